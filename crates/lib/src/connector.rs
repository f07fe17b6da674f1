//! Connector: one realtime connection with its dispatcher, hub registry and background tasks.
//!
//! Each `connect` starts a session with a fresh [`Connection`] and cancellation token. The
//! receive loop and the ping loop run on that token; cancelling it (via `disconnect`, or a
//! fatal read) stops both and closes the socket. Hubs and the execution context outlive
//! sessions, so a reconnect routes to the same hubs.

use crate::config::{self, ConnectionSetting};
use crate::dispatch::{Dispatcher, ExecutionContext};
use crate::hub::{Hub, HubError, HubHandle, HubRegistry};
use crate::ping::{self, PingTracker};
use crate::transport::{
    ConnectError, Connection, ConnectionState, EnvelopeLayout, ReceiveError, RpcTarget,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Without terminal ids on the wire every inbound call routes to terminal 0.
fn check_routable(hub: &dyn Hub, layout: EnvelopeLayout) -> Result<(), HubError> {
    if layout == EnvelopeLayout::Single && hub.terminal_id() != 0 {
        return Err(HubError::TerminalNotOnWire {
            hub_id: hub.id(),
            terminal_id: hub.terminal_id(),
        });
    }
    Ok(())
}

struct Session {
    connection: Arc<Connection>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
}

pub struct Connector {
    context: Arc<dyn ExecutionContext>,
    registry: Arc<HubRegistry>,
    pings: Arc<PingTracker>,
    in_room: AtomicBool,
    session: Mutex<Option<Arc<Session>>>,
    /// Background tasks of the current session; also serializes connect and disconnect.
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Connector {
    pub fn new(context: Arc<dyn ExecutionContext>) -> Self {
        Self {
            context,
            registry: Arc::new(HubRegistry::new()),
            pings: Arc::new(PingTracker::new()),
            in_room: AtomicBool::new(false),
            session: Mutex::new(None),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    fn session(&self) -> Option<Arc<Session>> {
        lock(&self.session).clone()
    }

    /// Open a session to `setting.url`. Does nothing when already connected.
    pub async fn connect(self: &Arc<Self>, setting: &ConnectionSetting) -> Result<(), ConnectError> {
        let mut tasks = self.tasks.lock().await;
        if let Some(current) = self.session() {
            if current.connection.is_open() {
                log::debug!("connect ignored, already connected");
                return Ok(());
            }
            current.cancel.cancel();
            current.connection.close().await;
        }
        join_all(&mut tasks).await;

        let url = config::resolve_url(setting).unwrap_or_default();
        let authorization = config::resolve_authorization(setting);
        let connection = Arc::new(Connection::new(setting.in_buffer_size));
        let dispatcher = Arc::new(Dispatcher::new(
            connection.clone(),
            self.registry.clone(),
            self.pings.clone(),
            self.context.clone(),
            setting.layout(),
        ));
        let cancel = CancellationToken::new();
        *lock(&self.session) = Some(Arc::new(Session {
            connection: connection.clone(),
            dispatcher: dispatcher.clone(),
            cancel: cancel.clone(),
        }));
        self.pings.reset();

        connection
            .connect(&url, authorization.as_deref(), cancel.clone())
            .await?;

        tasks.push(tokio::spawn(run_receive_loop(
            dispatcher.clone(),
            connection,
            cancel.clone(),
        )));
        if setting.allow_ping_server {
            tasks.push(tokio::spawn(ping::run_ping_loop(
                dispatcher,
                self.pings.clone(),
                setting.ping_interval(),
                setting.ping_timeout(),
                cancel,
            )));
        }
        Ok(())
    }

    /// Cancel the session, close the socket and wait for the background tasks to finish.
    pub async fn disconnect(&self) {
        // Cancel first so an in-flight handshake gives up the lifecycle lock.
        if let Some(current) = self.session() {
            current.cancel.cancel();
        }
        let mut tasks = self.tasks.lock().await;
        if let Some(current) = self.session() {
            current.cancel.cancel();
            current.connection.close().await;
        }
        join_all(&mut tasks).await;
        self.in_room.store(false, Ordering::SeqCst);
    }

    pub fn state(&self) -> ConnectionState {
        self.session()
            .map(|s| s.connection.state())
            .unwrap_or(ConnectionState::Idle)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    /// Latest measured round-trip time.
    pub fn round_trip_time(&self) -> Option<Duration> {
        self.pings.round_trip_time()
    }

    pub fn rtt_watch(&self) -> watch::Receiver<Option<Duration>> {
        self.pings.subscribe()
    }

    pub fn in_room(&self) -> bool {
        self.in_room.load(Ordering::SeqCst)
    }

    pub fn set_in_room(&self, in_room: bool) {
        self.in_room.store(in_room, Ordering::SeqCst);
    }

    /// Token of the current session, if one was started.
    pub fn cancellation_token(&self) -> Option<CancellationToken> {
        self.session().map(|s| s.cancel.clone())
    }

    /// Route inbound calls for `hub`'s ids to it. Returns the hub it replaced, if any.
    ///
    /// A hub with a nonzero terminal id is refused while the session's layout has no terminal
    /// ids, since nothing could ever reach it.
    pub fn register_hub(&self, hub: Arc<dyn Hub>) -> Result<Option<Arc<dyn Hub>>, HubError> {
        if let Some(session) = self.session() {
            check_routable(hub.as_ref(), session.dispatcher.layout())?;
        }
        log::debug!("hub {}/{} registered", hub.id(), hub.terminal_id());
        Ok(self.registry.register(hub))
    }

    pub fn unregister_hub(&self, hub_id: u8, terminal_id: u8) -> Option<Arc<dyn Hub>> {
        self.registry.unregister(hub_id, terminal_id)
    }

    pub(crate) fn unregister_exact(&self, hub: &Arc<dyn Hub>) -> bool {
        self.registry.unregister_exact(hub)
    }

    pub fn hub_count(&self) -> usize {
        self.registry.len()
    }

    pub async fn send_service(
        &self,
        hub_id: u8,
        terminal_id: u8,
        method_id: i16,
        payload: Option<Vec<u8>>,
    ) -> bool {
        let Some(session) = self.session() else {
            log::warn!("skip service send to hub {}, never connected", hub_id);
            return false;
        };
        session
            .dispatcher
            .send_service(hub_id, terminal_id, method_id, payload)
            .await
    }

    pub async fn send_rpc(
        &self,
        hub_id: u8,
        terminal_id: u8,
        method_id: i16,
        rpc_target: RpcTarget,
        payload: Option<Vec<u8>>,
    ) -> bool {
        let Some(session) = self.session() else {
            log::warn!("skip rpc send to hub {}, never connected", hub_id);
            return false;
        };
        session
            .dispatcher
            .send_rpc(hub_id, terminal_id, method_id, rpc_target, payload)
            .await
    }
}

async fn join_all(tasks: &mut Vec<JoinHandle<()>>) {
    for handle in tasks.drain(..) {
        if let Err(e) = handle.await {
            log::warn!("connector task ended abnormally: {}", e);
        }
    }
}

/// Read frames and hand them to the dispatcher until cancelled or the socket dies.
async fn run_receive_loop(
    dispatcher: Arc<Dispatcher>,
    connection: Arc<Connection>,
    cancel: CancellationToken,
) {
    log::debug!("receive loop started");
    while !cancel.is_cancelled() {
        match connection.receive().await {
            Ok(Some(frame)) => {
                dispatcher.consume(&frame);
            }
            Ok(None) => {
                if !connection.is_open() {
                    break;
                }
            }
            Err(ReceiveError::NotOpen(_)) => break,
            Err(e) if e.is_fatal() => {
                log::warn!("receive loop stopping: {}", e);
                break;
            }
            Err(e) => log::debug!("skipping unreadable frame: {}", e),
        }
    }
    cancel.cancel();
    connection.close().await;
    log::debug!("receive loop stopped");
}

/// Hands out connectors: one shared default, or an isolated one per request.
pub struct ConnectionManager {
    context: Arc<dyn ExecutionContext>,
    default: Mutex<Option<Arc<Connector>>>,
    isolated: Mutex<Vec<Weak<Connector>>>,
}

impl ConnectionManager {
    pub fn new(context: Arc<dyn ExecutionContext>) -> Self {
        Self {
            context,
            default: Mutex::new(None),
            isolated: Mutex::new(Vec::new()),
        }
    }

    /// Shared default connector when `use_default_connector` is set, otherwise a new one.
    pub fn connector_for(&self, setting: &ConnectionSetting) -> Arc<Connector> {
        if setting.use_default_connector {
            return lock(&self.default)
                .get_or_insert_with(|| Arc::new(Connector::new(self.context.clone())))
                .clone();
        }
        let connector = Arc::new(Connector::new(self.context.clone()));
        let mut isolated = lock(&self.isolated);
        isolated.retain(|c| c.strong_count() > 0);
        isolated.push(Arc::downgrade(&connector));
        connector
    }

    /// Register `hub` and connect its connector if needed. On failure the hub is unregistered.
    pub async fn attach(
        &self,
        hub: Arc<dyn Hub>,
        setting: &ConnectionSetting,
    ) -> Result<HubHandle, AttachError> {
        check_routable(hub.as_ref(), setting.layout())?;
        let connector = self.connector_for(setting);
        connector.register_hub(hub.clone())?;
        if !connector.is_connected() {
            if let Err(e) = connector.connect(setting).await {
                connector.unregister_exact(&hub);
                return Err(e.into());
            }
        }
        Ok(HubHandle::new(connector, hub))
    }

    /// Disconnect the default connector and every isolated one still alive.
    pub async fn disconnect_all(&self) {
        let mut connectors: Vec<Arc<Connector>> =
            lock(&self.isolated).iter().filter_map(Weak::upgrade).collect();
        if let Some(default) = lock(&self.default).clone() {
            connectors.push(default);
        }
        for connector in connectors {
            connector.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchQueue;
    use crate::hub::{HubError, Invocation, Params};

    struct Quiet(u8);

    impl Hub for Quiet {
        fn id(&self) -> u8 {
            self.0
        }
        fn decode_params(&self, _m: i16, _f: &[u8], _o: usize) -> Result<Params, HubError> {
            Ok(Box::new(()))
        }
        fn invoke(&self, _m: i16, _p: Params) -> Result<Invocation, HubError> {
            Ok(Invocation::Done)
        }
    }

    struct OnTerminal(u8, u8);

    impl Hub for OnTerminal {
        fn id(&self) -> u8 {
            self.0
        }
        fn terminal_id(&self) -> u8 {
            self.1
        }
        fn decode_params(&self, _m: i16, _f: &[u8], _o: usize) -> Result<Params, HubError> {
            Ok(Box::new(()))
        }
        fn invoke(&self, _m: i16, _p: Params) -> Result<Invocation, HubError> {
            Ok(Invocation::Done)
        }
    }

    fn manager() -> ConnectionManager {
        ConnectionManager::new(Arc::new(DispatchQueue::new()))
    }

    /// A port that was free a moment ago; connecting to it is refused.
    fn unreachable() -> ConnectionSetting {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        ConnectionSetting::new(format!("ws://127.0.0.1:{}/hub", port))
    }

    #[test]
    fn default_connector_is_shared_and_isolated_ones_are_not() {
        let m = manager();
        let shared = unreachable();
        let a = m.connector_for(&shared);
        let b = m.connector_for(&shared);
        assert!(Arc::ptr_eq(&a, &b));

        let mut own = unreachable();
        own.use_default_connector = false;
        let c = m.connector_for(&own);
        let d = m.connector_for(&own);
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(!Arc::ptr_eq(&c, &d));
    }

    #[tokio::test]
    async fn fresh_connector_is_idle_and_refuses_sends() {
        let connector = Connector::new(Arc::new(DispatchQueue::new()));
        assert_eq!(connector.state(), ConnectionState::Idle);
        assert!(!connector.is_connected());
        assert!(!connector.is_connecting());
        assert!(connector.cancellation_token().is_none());
        assert!(!connector.send_service(1, 0, 1, None).await);
        assert!(!connector.send_rpc(1, 0, 1, RpcTarget::All, None).await);
        assert_eq!(connector.round_trip_time(), None);
    }

    #[tokio::test]
    async fn failed_connect_leaves_connector_closed() {
        let connector = Arc::new(Connector::new(Arc::new(DispatchQueue::new())));
        let err = connector.connect(&unreachable()).await.unwrap_err();
        assert!(matches!(err, ConnectError::Handshake(_)), "{err}");
        assert_eq!(connector.state(), ConnectionState::Closed);
        assert!(!connector.send_service(1, 0, 1, None).await);
        // Disconnect after a failed connect is harmless.
        connector.disconnect().await;
        assert_eq!(connector.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn invalid_url_is_reported() {
        let connector = Arc::new(Connector::new(Arc::new(DispatchQueue::new())));
        let err = connector
            .connect(&ConnectionSetting::new("not a url"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::InvalidUrl { .. }), "{err}");
    }

    #[tokio::test]
    async fn failed_attach_does_not_leave_the_hub_registered() {
        let m = manager();
        let setting = unreachable();
        assert!(matches!(
            m.attach(Arc::new(Quiet(4)), &setting).await,
            Err(AttachError::Connect(ConnectError::Handshake(_)))
        ));
        assert_eq!(m.connector_for(&setting).hub_count(), 0);
    }

    #[tokio::test]
    async fn attach_refuses_a_terminal_the_layout_cannot_address() {
        let m = manager();
        let setting = unreachable();
        assert!(matches!(
            m.attach(Arc::new(OnTerminal(4, 2)), &setting).await,
            Err(AttachError::Hub(HubError::TerminalNotOnWire { hub_id: 4, terminal_id: 2 }))
        ));
        assert_eq!(m.connector_for(&setting).hub_count(), 0);
        // The connector was never asked to connect.
        assert_eq!(m.connector_for(&setting).state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn register_hub_follows_the_session_layout() {
        let single = Arc::new(Connector::new(Arc::new(DispatchQueue::new())));
        // No session yet: the layout is unknown, so the hub is accepted.
        assert!(single.register_hub(Arc::new(OnTerminal(1, 3))).unwrap().is_none());
        assert!(single.connect(&unreachable()).await.is_err());
        assert!(matches!(
            single.register_hub(Arc::new(OnTerminal(2, 3))),
            Err(HubError::TerminalNotOnWire { hub_id: 2, terminal_id: 3 })
        ));
        assert!(single.register_hub(Arc::new(OnTerminal(2, 0))).unwrap().is_none());
        assert_eq!(single.hub_count(), 2);

        let multi = Arc::new(Connector::new(Arc::new(DispatchQueue::new())));
        let mut setting = unreachable();
        setting.multi_terminal = true;
        assert!(multi.connect(&setting).await.is_err());
        assert!(multi.register_hub(Arc::new(OnTerminal(2, 3))).unwrap().is_none());
    }

    #[test]
    fn in_room_flag_round_trips() {
        let connector = Connector::new(Arc::new(DispatchQueue::new()));
        assert!(!connector.in_room());
        connector.set_in_room(true);
        assert!(connector.in_room());
    }

    #[test]
    fn register_and_unregister_hubs() {
        let connector = Connector::new(Arc::new(DispatchQueue::new()));
        assert!(connector.register_hub(Arc::new(Quiet(1))).unwrap().is_none());
        assert!(connector.register_hub(Arc::new(Quiet(1))).unwrap().is_some());
        assert_eq!(connector.hub_count(), 1);
        assert!(connector.unregister_hub(1, 0).is_some());
        assert_eq!(connector.hub_count(), 0);
    }
}
