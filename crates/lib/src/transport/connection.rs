//! Connection: one duplex WebSocket to the realtime server.
//!
//! Owns both socket halves. Only binary frames are protocol data; every other frame kind is
//! logged and dropped. Physical writes go through one writer mutex so concurrent sends never
//! interleave, while the receive loop holds the reader half on its own.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::UrlError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::stream::Mode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::CancellationToken;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `close` waits for the peer to take the close frame before dropping the socket.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle of a connection. `Open` is the only state in which send/receive work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Connecting = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Open,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid websocket url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("invalid authorization header: {0}")]
    InvalidHeader(#[from] tungstenite::http::header::InvalidHeaderValue),
    #[error("websocket handshake failed: {0}")]
    Handshake(#[source] tungstenite::Error),
    #[error("connect cancelled")]
    Cancelled,
    #[error("cannot connect while connection is {0:?}")]
    InvalidState(ConnectionState),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection is not open (state {0:?})")]
    NotOpen(ConnectionState),
    #[error("send cancelled by close")]
    Cancelled,
    #[error("websocket send failed: {0}")]
    Socket(#[source] tungstenite::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("connection is not open (state {0:?})")]
    NotOpen(ConnectionState),
    #[error("websocket read failed: {source}")]
    Socket {
        #[source]
        source: tungstenite::Error,
        fatal: bool,
    },
}

impl ReceiveError {
    /// True when the connection can no longer be read from.
    pub fn is_fatal(&self) -> bool {
        match self {
            ReceiveError::NotOpen(_) => true,
            ReceiveError::Socket { fatal, .. } => *fatal,
        }
    }
}

/// Errors after which the socket cannot be read or written again. A protocol violation leaves
/// the websocket state machine unusable, so it counts too.
fn is_fatal(e: &tungstenite::Error) -> bool {
    matches!(
        e,
        tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Io(_)
            | tungstenite::Error::Protocol(_)
    )
}

fn frame_kind(msg: &Message) -> &'static str {
    match msg {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "raw",
    }
}

pub struct Connection {
    in_buffer_size: usize,
    state: AtomicU8,
    writer: tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>,
    reader: tokio::sync::Mutex<Option<SplitStream<WsStream>>>,
    cancel: std::sync::Mutex<CancellationToken>,
}

/// TCP socket whose receive buffer is sized to `in_buffer_size`.
fn socket_for(addr: SocketAddr, in_buffer_size: usize) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    let size = u32::try_from(in_buffer_size.max(1)).unwrap_or(u32::MAX);
    socket.set_recv_buffer_size(size)?;
    Ok(socket)
}

async fn tcp_connect(host: &str, port: u16, in_buffer_size: usize) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
        match socket_for(addr, in_buffer_size)?.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("{} resolved to no address", host))
    }))
}

impl Connection {
    /// New idle connection; `in_buffer_size` sizes the socket receive buffer.
    pub fn new(in_buffer_size: usize) -> Self {
        Self {
            in_buffer_size,
            state: AtomicU8::new(ConnectionState::Idle as u8),
            writer: tokio::sync::Mutex::new(None),
            reader: tokio::sync::Mutex::new(None),
            cancel: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn cancel_token(&self) -> CancellationToken {
        match self.cancel.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_cancel_token(&self, cancel: CancellationToken) {
        match self.cancel.lock() {
            Ok(mut g) => *g = cancel,
            Err(poisoned) => *poisoned.into_inner() = cancel,
        }
    }

    /// Open the socket. Allowed from `Idle` or `Closed`; any failure leaves the state `Closed`.
    ///
    /// A `close` or a cancelled token while connecting wins: the new socket is dropped and the
    /// call returns [`ConnectError::Cancelled`].
    pub async fn connect(
        &self,
        url: &str,
        authorization: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<(), ConnectError> {
        let current = self.state();
        if !matches!(current, ConnectionState::Idle | ConnectionState::Closed) {
            return Err(ConnectError::InvalidState(current));
        }
        if self
            .state
            .compare_exchange(
                current as u8,
                ConnectionState::Connecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(ConnectError::InvalidState(self.state()));
        }
        self.set_cancel_token(cancel.clone());

        let ws = match self.open(url, authorization, &cancel).await {
            Ok(ws) => ws,
            Err(e) => {
                self.set_state(ConnectionState::Closed);
                return Err(e);
            }
        };

        let (sink, stream) = ws.split();
        *self.writer.lock().await = Some(sink);
        *self.reader.lock().await = Some(stream);
        let opened = !cancel.is_cancelled()
            && self
                .state
                .compare_exchange(
                    ConnectionState::Connecting as u8,
                    ConnectionState::Open as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok();
        if !opened {
            self.writer.lock().await.take();
            self.reader.lock().await.take();
            self.set_state(ConnectionState::Closed);
            log::debug!("connect to {} cancelled after the handshake", url);
            return Err(ConnectError::Cancelled);
        }
        log::info!("connected to {}", url);
        Ok(())
    }

    async fn open(
        &self,
        url: &str,
        authorization: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<WsStream, ConnectError> {
        let invalid = |source: tungstenite::Error| ConnectError::InvalidUrl {
            url: url.to_string(),
            source,
        };
        let mut request = url.into_client_request().map_err(invalid)?;
        if let Some(auth) = authorization {
            let value = tungstenite::http::HeaderValue::from_str(auth)?;
            request
                .headers_mut()
                .insert(tungstenite::http::header::AUTHORIZATION, value);
        }

        if matches!(
            tungstenite::client::uri_mode(request.uri()).map_err(invalid)?,
            Mode::Tls
        ) {
            return Err(ConnectError::Handshake(tungstenite::Error::Url(
                UrlError::TlsFeatureNotEnabled,
            )));
        }
        let host = request
            .uri()
            .host()
            .ok_or_else(|| invalid(tungstenite::Error::Url(UrlError::NoHostName)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = request.uri().port_u16().unwrap_or(80);

        let handshake = async {
            let stream = tcp_connect(&host, port, self.in_buffer_size)
                .await
                .map_err(|e| ConnectError::Handshake(tungstenite::Error::Io(e)))?;
            let (ws, _response) = tokio_tungstenite::client_async_with_config(
                request,
                MaybeTlsStream::Plain(stream),
                None,
            )
            .await
            .map_err(ConnectError::Handshake)?;
            Ok::<_, ConnectError>(ws)
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
            res = handshake => res,
        }
    }

    /// Send one binary frame. Gives up as soon as the connection is closed.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), SendError> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(SendError::NotOpen(state));
        }
        let cancel = self.cancel_token();
        let mut guard = tokio::select! {
            biased;

            _ = cancel.cancelled() => return Err(SendError::Cancelled),
            guard = self.writer.lock() => guard,
        };
        let Some(sink) = guard.as_mut() else {
            return Err(SendError::NotOpen(self.state()));
        };
        let len = bytes.len();
        let sent = tokio::select! {
            biased;

            _ = cancel.cancelled() => return Err(SendError::Cancelled),
            sent = sink.send(Message::Binary(bytes)) => sent,
        };
        if let Err(e) = sent {
            if is_fatal(&e) {
                self.set_state(ConnectionState::Closed);
            }
            return Err(SendError::Socket(e));
        }
        log::trace!("sent {} bytes", len);
        Ok(())
    }

    /// Wait for the next binary frame.
    ///
    /// `Ok(None)` means nothing usable arrived: the peer closed, the frame was not binary, or
    /// the connection was cancelled.
    pub async fn receive(&self) -> Result<Option<Vec<u8>>, ReceiveError> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(ReceiveError::NotOpen(state));
        }
        let cancel = self.cancel_token();
        let mut guard = self.reader.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(ReceiveError::NotOpen(self.state()));
        };

        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Binary(data))) => Ok(Some(data)),
            Some(Ok(Message::Close(frame))) => {
                log::debug!("peer closed the connection: {:?}", frame);
                self.set_state(ConnectionState::Closed);
                Ok(None)
            }
            Some(Ok(other)) => {
                log::debug!("dropping unsupported {} frame", frame_kind(&other));
                Ok(None)
            }
            Some(Err(source)) => {
                let fatal = is_fatal(&source);
                if fatal {
                    self.set_state(ConnectionState::Closed);
                }
                Err(ReceiveError::Socket { source, fatal })
            }
            None => {
                log::debug!("websocket stream ended");
                self.set_state(ConnectionState::Closed);
                Ok(None)
            }
        }
    }

    /// Close gracefully if the peer cooperates within [`CLOSE_GRACE`], then release both halves
    /// regardless. Cancels pending sends, receives and an in-flight connect.
    pub async fn close(&self) {
        let previous = ConnectionState::from_u8(
            self.state
                .swap(ConnectionState::Closing as u8, Ordering::SeqCst),
        );
        if previous == ConnectionState::Idle {
            self.set_state(ConnectionState::Idle);
            return;
        }
        self.cancel_token().cancel();

        let sink = self.writer.lock().await.take();
        if let Some(mut sink) = sink {
            let goodbye = async {
                if previous == ConnectionState::Open {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "OK".into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        log::debug!("close frame not sent: {}", e);
                    }
                }
                if let Err(e) = sink.close().await {
                    log::debug!("closing websocket sink: {}", e);
                }
            };
            if tokio::time::timeout(CLOSE_GRACE, goodbye).await.is_err() {
                log::warn!("peer did not take the close within {:?}, dropping the socket", CLOSE_GRACE);
            }
        }
        self.reader.lock().await.take();
        self.set_state(ConnectionState::Closed);
        if previous != ConnectionState::Closed {
            log::info!("connection closed");
        }
    }
}
