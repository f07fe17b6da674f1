//! Integration test: run a local WebSocket hub server and drive a connector against it.
//!
//! The server echoes PING frames (so they come back as pongs) and call frames (so they come
//! back routed to the sending hub). A SERVICE call with method [`POKE`] is answered with a
//! bare `PING 0` frame instead.

use futures_util::{SinkExt, StreamExt};
use hublink::config::ConnectionSetting;
use hublink::dispatch::DispatchQueue;
use hublink::hub::{Hub, HubError, Invocation, MethodTable, Params, TerminalHub};
use hublink::transport::envelope::{self, Envelope, EnvelopeLayout, Header};
use hublink::transport::{payload, ConnectionState, RpcTarget};
use hublink::{ConnectionManager, Connector};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

const POKE: i16 = 2;

struct MockServer {
    url: String,
    pings: Arc<AtomicUsize>,
}

async fn spawn_server(close_on_accept: bool) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind free port");
    let port = listener.local_addr().expect("local_addr").port();
    let pings = Arc::new(AtomicUsize::new(0));
    let counter = pings.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                if close_on_accept {
                    let _ = ws.close(None).await;
                    return;
                }
                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Binary(frame) = msg else {
                        continue;
                    };
                    let reply = match envelope::peek(&frame, EnvelopeLayout::Single) {
                        Ok(Header::Ping { .. }) => {
                            counter.fetch_add(1, Ordering::SeqCst);
                            frame
                        }
                        Ok(Header::Call(call)) if call.method_id == POKE => {
                            envelope::encode(&Envelope::ping(0), EnvelopeLayout::Single)
                                .expect("encode ping")
                        }
                        Ok(Header::Call(_)) => frame,
                        Err(_) => continue,
                    };
                    if ws.send(Message::Binary(reply)).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    MockServer {
        url: format!("ws://127.0.0.1:{}/hub", port),
        pings,
    }
}

fn setting(url: &str, ping_every_millis: Option<u64>) -> ConnectionSetting {
    let mut setting = ConnectionSetting::new(url);
    match ping_every_millis {
        Some(ms) => setting.ping_interval_millis = ms,
        None => setting.allow_ping_server = false,
    }
    setting
}

async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[derive(Default)]
struct Counts {
    decoded: AtomicUsize,
    invoked: AtomicUsize,
}

struct CountingHub {
    id: u8,
    counts: Arc<Counts>,
}

impl Hub for CountingHub {
    fn id(&self) -> u8 {
        self.id
    }

    fn decode_params(&self, _method_id: i16, _frame: &[u8], _offset: usize) -> Result<Params, HubError> {
        self.counts.decoded.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(()))
    }

    fn invoke(&self, _method_id: i16, _params: Params) -> Result<Invocation, HubError> {
        self.counts.invoked.fetch_add(1, Ordering::SeqCst);
        Ok(Invocation::Done)
    }
}

#[derive(Default)]
struct Lobby {
    echoes: Vec<String>,
}

fn lobby_methods() -> MethodTable<Lobby> {
    MethodTable::new().method(1, "OnEcho", |lobby: &mut Lobby, text: String| {
        lobby.echoes.push(text);
        Invocation::Done
    })
}

#[tokio::test]
async fn ping_measures_rtt_and_pong_never_reaches_hubs() {
    let server = spawn_server(false).await;
    let queue = Arc::new(DispatchQueue::new());
    let manager = ConnectionManager::new(queue.clone());
    let setting = setting(&server.url, Some(50));

    let watched = Arc::new(Counts::default());
    let sentinel = Arc::new(Counts::default());
    let watched_handle = manager
        .attach(Arc::new(CountingHub { id: 3, counts: watched.clone() }), &setting)
        .await
        .expect("attach hub 3");
    let sentinel_handle = manager
        .attach(Arc::new(CountingHub { id: 4, counts: sentinel.clone() }), &setting)
        .await
        .expect("attach hub 4");
    let connector = watched_handle.connector().clone();
    assert!(connector.is_connected());

    let mut rtt = connector.rtt_watch();
    tokio::time::timeout(Duration::from_secs(5), rtt.wait_for(|v| v.is_some()))
        .await
        .expect("rtt within 5s")
        .expect("rtt channel open");
    assert!(connector.round_trip_time().is_some());

    // The server answers the poke with PING 0; frames arrive in order, so once the sentinel
    // call has been dispatched the ping has been consumed too.
    assert!(watched_handle.send(POKE, None).await);
    assert!(sentinel_handle.send(1, None).await);
    assert!(
        wait_for(|| {
            queue.drain_and_run();
            sentinel.invoked.load(Ordering::SeqCst) == 1
        })
        .await,
        "sentinel call was not dispatched within 5s"
    );
    assert_eq!(watched.decoded.load(Ordering::SeqCst), 0);
    assert_eq!(watched.invoked.load(Ordering::SeqCst), 0);

    manager.disconnect_all().await;
}

#[tokio::test]
async fn attached_terminal_receives_echoed_calls() {
    let server = spawn_server(false).await;
    let queue = Arc::new(DispatchQueue::new());
    let manager = ConnectionManager::new(queue.clone());
    let setting = setting(&server.url, None);

    let lobby = Arc::new(Mutex::new(Lobby::default()));
    let hub = Arc::new(TerminalHub::new(5, 0, &lobby, lobby_methods()));
    let handle = manager.attach(hub, &setting).await.expect("attach lobby");

    assert!(handle.send(1, Some(payload::encode("hello").unwrap())).await);
    let sent = handle
        .rpc_named("OnEcho", RpcTarget::All, Some(payload::encode("again").unwrap()))
        .await
        .expect("OnEcho is declared");
    assert!(sent);
    assert!(matches!(
        handle.rpc_named("Missing", RpcTarget::Others, None).await,
        Err(HubError::UnknownMethodName { hub_id: 5, .. })
    ));

    assert!(
        wait_for(|| {
            queue.drain_and_run();
            lobby.lock().unwrap().echoes.len() == 2
        })
        .await,
        "echoes were not delivered within 5s"
    );
    assert_eq!(lobby.lock().unwrap().echoes, vec!["hello", "again"]);

    let connector = handle.connector().clone();
    assert_eq!(connector.hub_count(), 1);
    drop(handle);
    assert_eq!(connector.hub_count(), 0);
    connector.disconnect().await;
}

#[tokio::test]
async fn disconnect_stops_the_ping_loop() {
    let server = spawn_server(false).await;
    let connector = Arc::new(Connector::new(Arc::new(DispatchQueue::new())));
    connector
        .connect(&setting(&server.url, Some(20)))
        .await
        .expect("connect");
    let token = connector.cancellation_token().expect("session token");

    assert!(
        wait_for(|| server.pings.load(Ordering::SeqCst) >= 3).await,
        "server saw no pings within 5s"
    );

    connector.disconnect().await;
    assert!(token.is_cancelled());
    assert_eq!(connector.state(), ConnectionState::Closed);

    // Let the server finish reading whatever was in flight before the close.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = server.pings.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.pings.load(Ordering::SeqCst), seen);

    assert!(!connector.send_service(3, 0, 7, None).await);
    assert!(!connector.send_rpc(3, 0, 7, RpcTarget::Caller, None).await);
}

#[tokio::test]
async fn connect_twice_keeps_the_open_session() {
    let server = spawn_server(false).await;
    let connector = Arc::new(Connector::new(Arc::new(DispatchQueue::new())));
    let setting = setting(&server.url, None);
    connector.connect(&setting).await.expect("first connect");
    let first = connector.cancellation_token().expect("session token");
    connector.connect(&setting).await.expect("second connect");
    let second = connector.cancellation_token().expect("session token");
    assert!(!first.is_cancelled());
    assert!(!second.is_cancelled());
    assert!(connector.is_connected());

    // Reconnecting after a disconnect starts a new session.
    connector.disconnect().await;
    connector.connect(&setting).await.expect("reconnect");
    assert!(connector.is_connected());
    assert!(first.is_cancelled());
    assert!(!connector.cancellation_token().expect("session token").is_cancelled());
    connector.disconnect().await;
}

#[tokio::test]
async fn server_close_ends_the_session() {
    let server = spawn_server(true).await;
    let connector = Arc::new(Connector::new(Arc::new(DispatchQueue::new())));
    connector
        .connect(&setting(&server.url, None))
        .await
        .expect("connect");
    let token = connector.cancellation_token().expect("session token");

    assert!(
        wait_for(|| !connector.is_connected() && token.is_cancelled()).await,
        "session still open 5s after the server closed"
    );
    connector.disconnect().await;
}
