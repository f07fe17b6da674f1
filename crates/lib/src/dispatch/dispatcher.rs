//! RPC/service dispatcher.
//!
//! Outbound: encode an envelope and hand it to the connection; sends never fail loudly.
//! Inbound: peek the header, resolve the hub, let the hub decode its parameters on the
//! background task, then post the invocation to the execution context.

use super::queue::ExecutionContext;
use crate::hub::{HubRegistry, Invocation};
use crate::ping::PingTracker;
use crate::transport::envelope::{self, Envelope, EnvelopeLayout, Header, RpcTarget};
use crate::transport::Connection;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// A pong; carries the RTT when the ping id was pending.
    Pong(Option<Duration>),
    /// The invocation was posted to the execution context.
    Posted,
    /// No hub registered for the envelope's ids.
    RouteMiss,
    /// The frame is not a valid envelope.
    Malformed,
    /// The hub could not decode the parameters.
    DecodeFailed,
}

pub struct Dispatcher {
    connection: Arc<Connection>,
    registry: Arc<HubRegistry>,
    pings: Arc<PingTracker>,
    context: Arc<dyn ExecutionContext>,
    layout: EnvelopeLayout,
}

impl Dispatcher {
    pub fn new(
        connection: Arc<Connection>,
        registry: Arc<HubRegistry>,
        pings: Arc<PingTracker>,
        context: Arc<dyn ExecutionContext>,
        layout: EnvelopeLayout,
    ) -> Self {
        Self {
            connection,
            registry,
            pings,
            context,
            layout,
        }
    }

    pub fn layout(&self) -> EnvelopeLayout {
        self.layout
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    /// Send a SERVICE call. Returns whether the frame was written.
    pub async fn send_service(
        &self,
        hub_id: u8,
        terminal_id: u8,
        method_id: i16,
        payload: Option<Vec<u8>>,
    ) -> bool {
        self.send_envelope(&Envelope::service(hub_id, terminal_id, method_id, payload))
            .await
    }

    /// Send an RPC relayed by the server to `rpc_target`. Returns whether the frame was written.
    pub async fn send_rpc(
        &self,
        hub_id: u8,
        terminal_id: u8,
        method_id: i16,
        rpc_target: RpcTarget,
        payload: Option<Vec<u8>>,
    ) -> bool {
        self.send_envelope(&Envelope::rpc(hub_id, terminal_id, method_id, rpc_target, payload))
            .await
    }

    pub async fn send_ping(&self, ping_id: i32) -> bool {
        self.send_envelope(&Envelope::ping(ping_id)).await
    }

    async fn send_envelope(&self, envelope: &Envelope) -> bool {
        if !self.connection.is_open() {
            log::warn!(
                "skip {:?} send while not connected (state {:?})",
                envelope.message_type(),
                self.connection.state()
            );
            return false;
        }
        let bytes = match envelope::encode(envelope, self.layout) {
            Ok(b) => b,
            Err(e) => {
                log::warn!("dropping outbound envelope: {}", e);
                return false;
            }
        };
        match self.connection.send(bytes).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("dropping outbound {:?}: {}", envelope.message_type(), e);
                false
            }
        }
    }

    /// Route one inbound frame. Runs on the background receive task.
    pub fn consume(&self, frame: &[u8]) -> Inbound {
        let header = match envelope::peek(frame, self.layout) {
            Ok(h) => h,
            Err(e) => {
                log::debug!("dropping malformed frame ({} bytes): {}", frame.len(), e);
                return Inbound::Malformed;
            }
        };

        let call = match header {
            Header::Ping { ping_id } => return Inbound::Pong(self.pings.on_pong(ping_id)),
            Header::Call(call) => call,
        };

        let Some(hub) = self.registry.resolve(call.hub_id, call.terminal_id) else {
            log::debug!(
                "no hub for {}/{}, dropping method {}",
                call.hub_id,
                call.terminal_id,
                call.method_id
            );
            return Inbound::RouteMiss;
        };

        let params = match hub.decode_params(call.method_id, frame, call.params_offset) {
            Ok(p) => p,
            Err(e) => {
                log::warn!(
                    "hub {}/{} could not decode method {}: {}",
                    call.hub_id,
                    call.terminal_id,
                    call.method_id,
                    e
                );
                return Inbound::DecodeFailed;
            }
        };

        let context = self.context.clone();
        let method_id = call.method_id;
        self.context.post(Box::new(move || {
            match catch_unwind(AssertUnwindSafe(|| hub.invoke(method_id, params))) {
                Ok(Ok(Invocation::Done)) => {}
                Ok(Ok(Invocation::Scheduled(task))) => context.schedule(task),
                Ok(Err(e)) => log::error!(
                    "hub {}/{} method {} failed: {}",
                    hub.id(),
                    hub.terminal_id(),
                    method_id,
                    e
                ),
                Err(_) => log::error!(
                    "hub {}/{} method {} panicked",
                    hub.id(),
                    hub.terminal_id(),
                    method_id
                ),
            }
        }));
        Inbound::Posted
    }
}
