//! Hublink: a realtime client transport that multiplexes RPC hubs over one WebSocket.
//!
//! Frames are MessagePack envelopes routed by `(hub_id, terminal_id)`. Inbound calls are
//! decoded on a background task and run on the host's foreground through a
//! [`dispatch::DispatchQueue`]; a ping loop keeps a round-trip estimate current.

pub mod config;
pub mod connector;
pub mod dispatch;
pub mod hub;
pub mod ping;
pub mod transport;

pub use connector::{AttachError, ConnectionManager, Connector};
pub use dispatch::{DispatchQueue, ExecutionContext};
pub use hub::{Hub, HubHandle, Invocation, MethodTable, TerminalHub};
pub use transport::RpcTarget;
