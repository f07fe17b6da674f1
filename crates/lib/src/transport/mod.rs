//! Transport: the WebSocket connection and the envelope wire format.
//!
//! The connection moves opaque binary frames; the envelope codec reads and writes the
//! routing header in front of each payload.

mod connection;
pub mod envelope;
pub mod payload;

pub use connection::{ConnectError, Connection, ConnectionState, ReceiveError, SendError};
pub use envelope::{
    CallHeader, Envelope, EnvelopeError, EnvelopeLayout, Header, MessageType, RpcTarget,
};
pub use payload::PayloadError;
