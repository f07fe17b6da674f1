//! Hubs: logical RPC endpoints multiplexed over one connection.
//!
//! A hub is identified by `(hub_id, terminal_id)`. The connector routes inbound envelopes to
//! the registered hub, which decodes its own parameters (only it knows its method
//! signatures) and invokes the target method on the foreground.
//!
//! ```text
//!                              <---> Hub 1
//!                             /
//! Server <---> Connector <---> Hub 2
//!                             \
//!                              <---> Hub 3
//! ```

mod handle;
mod registry;
mod terminal;

pub use handle::HubHandle;
pub use registry::HubRegistry;
pub use terminal::{MethodTable, TerminalHub};

use crate::dispatch::Task;
use std::any::Any;
use std::fmt;

/// Decoded method parameters, produced by [`Hub::decode_params`] and consumed by [`Hub::invoke`].
pub type Params = Box<dyn Any + Send>;

/// What an invocation left behind.
pub enum Invocation {
    /// The method finished synchronously.
    Done,
    /// The method produced resumable work for the execution context to run.
    Scheduled(Task),
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invocation::Done => f.write_str("Done"),
            Invocation::Scheduled(_) => f.write_str("Scheduled(..)"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub {hub_id} has no method {method_id}")]
    UnknownMethod { hub_id: u8, method_id: i16 },
    #[error("hub {hub_id} has no method named {name}")]
    UnknownMethodName { hub_id: u8, name: String },
    #[error("method {method_id} received parameters of the wrong type")]
    ParamsType { method_id: i16 },
    #[error(transparent)]
    Payload(#[from] crate::transport::PayloadError),
    #[error("terminal is unavailable: {0}")]
    Terminal(String),
    #[error("hub {hub_id} uses terminal {terminal_id}, but this connection carries no terminal ids")]
    TerminalNotOnWire { hub_id: u8, terminal_id: u8 },
}

/// A routable endpoint bound to one terminal.
///
/// `decode_params` runs on the background receive task; `invoke` runs on the foreground.
pub trait Hub: Send + Sync {
    fn id(&self) -> u8;

    /// Distinguishes terminals sharing one hub type (e.g. several players). Defaults to 0.
    fn terminal_id(&self) -> u8 {
        0
    }

    /// Decode the payload that starts at `offset` in `frame` for `method_id`.
    fn decode_params(&self, method_id: i16, frame: &[u8], offset: usize) -> Result<Params, HubError>;

    /// Call `method_id` on the terminal.
    fn invoke(&self, method_id: i16, params: Params) -> Result<Invocation, HubError>;

    /// Method id for a method name, when the hub keeps a name table.
    fn method_id(&self, _name: &str) -> Option<i16> {
        None
    }
}
