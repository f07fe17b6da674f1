//! Application-side handle to an attached hub.

use super::{Hub, HubError};
use crate::connector::Connector;
use crate::transport::RpcTarget;
use std::sync::Arc;

/// Sends on behalf of one registered hub. Dropping the handle unregisters the hub, unless a
/// newer hub has taken its place.
pub struct HubHandle {
    connector: Arc<Connector>,
    hub: Arc<dyn Hub>,
}

impl HubHandle {
    pub(crate) fn new(connector: Arc<Connector>, hub: Arc<dyn Hub>) -> Self {
        Self { connector, hub }
    }

    pub fn hub_id(&self) -> u8 {
        self.hub.id()
    }

    pub fn terminal_id(&self) -> u8 {
        self.hub.terminal_id()
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// SERVICE call to the server-side hub.
    pub async fn send(&self, method_id: i16, payload: Option<Vec<u8>>) -> bool {
        self.connector
            .send_service(self.hub.id(), self.hub.terminal_id(), method_id, payload)
            .await
    }

    /// RPC the server relays to `target`.
    pub async fn rpc(&self, method_id: i16, target: RpcTarget, payload: Option<Vec<u8>>) -> bool {
        self.connector
            .send_rpc(self.hub.id(), self.hub.terminal_id(), method_id, target, payload)
            .await
    }

    /// Like [`HubHandle::rpc`], looking the method id up by name in the hub's table.
    pub async fn rpc_named(
        &self,
        name: &str,
        target: RpcTarget,
        payload: Option<Vec<u8>>,
    ) -> Result<bool, HubError> {
        let method_id = self
            .hub
            .method_id(name)
            .ok_or_else(|| HubError::UnknownMethodName {
                hub_id: self.hub.id(),
                name: name.to_string(),
            })?;
        Ok(self.rpc(method_id, target, payload).await)
    }

    /// Close the connection this hub talks through.
    pub async fn disconnect(&self) {
        self.connector.disconnect().await;
    }
}

impl Drop for HubHandle {
    fn drop(&mut self) {
        if self.connector.unregister_exact(&self.hub) {
            log::debug!("hub {}/{} detached", self.hub.id(), self.hub.terminal_id());
        }
    }
}
