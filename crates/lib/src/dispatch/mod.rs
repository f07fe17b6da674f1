//! Inbound routing and hand-off to the foreground.

mod dispatcher;
mod queue;

pub use dispatcher::{Dispatcher, Inbound};
pub use queue::{Callback, DispatchQueue, ExecutionContext, Task};
