//! The single persistent push connection.
//!
//! [`ConnectionManager`] owns the socket: it connects, reconnects with exponential backoff
//! after unexpected drops, keeps the link alive with application-level pings, and fans
//! every decoded [`WebSocketMessage`] out to its handler and to any number of read-only
//! [`MessageFeed`] subscribers. Runtime failures are reported through
//! [`ConnectionHandler`] hooks and never returned to unrelated callers.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::messages::{Envelope, WebSocketMessage};
use crate::types::ConnectionState;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type FirstAttempt = Option<Result<(), ConnectionError>>;

/// Why an established connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    Requested,
    ClosedByPeer,
    HeartbeatTimeout,
    Transport(String),
}

/// Lifecycle hooks of the push connection. Every method has a no-op default.
///
/// Hooks run on the connection task; keep them short and non-blocking.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_message(&self, _message: &WebSocketMessage) {}
    fn on_connect(&self) {}
    fn on_disconnect(&self, _reason: &DisconnectReason) {}
    fn on_error(&self, _error: &ConnectionError) {}
    /// A reconnect attempt (1-based) is scheduled after `delay`.
    fn on_reconnect(&self, _attempt: u32, _delay: Duration) {}
    /// Checked before every reconnect; return `false` once the owning session has logged out.
    fn should_reconnect(&self) -> bool {
        true
    }
}

/// Handler that ignores every hook.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ConnectionHandler for NoopHandler {}

/// Read-only subscription point for decoded push messages.
#[derive(Debug, Clone)]
pub struct MessageFeed {
    tx: broadcast::Sender<WebSocketMessage>,
}

impl MessageFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WebSocketMessage> {
        self.tx.subscribe()
    }

    /// Deliver `message` to current subscribers, returning how many received it.
    pub fn publish(&self, message: WebSocketMessage) -> usize {
        self.tx.send(message).unwrap_or(0)
    }
}

struct Driver {
    cancel: CancellationToken,
    first: watch::Receiver<FirstAttempt>,
    handle: JoinHandle<()>,
}

struct Inner {
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    feed: MessageFeed,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    driver: Mutex<Option<Driver>>,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<Message>>) {
        *relock(&self.outbound) = tx;
    }

    /// Decode and fan out one text frame. Returns true for a heartbeat `pong`.
    fn dispatch(&self, handler: &dyn ConnectionHandler, text: &str) -> bool {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "dropping malformed push frame");
                return false;
            }
        };
        let kind = envelope.kind.clone();
        match WebSocketMessage::from_envelope(envelope) {
            Ok(Some(WebSocketMessage::Pong)) => true,
            Ok(Some(message)) => {
                handler.on_message(&message);
                self.feed.publish(message);
                false
            }
            Ok(None) => {
                debug!(kind = %kind, "dropping push message of unknown type");
                false
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "dropping malformed push message");
                false
            }
        }
    }
}

/// Owner of the single push connection. Clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &redact(&self.inner.config.url))
            .field("state", &self.connection_state())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let feed = MessageFeed::new(config.feed_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                feed,
                outbound: Mutex::new(None),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Open the connection, or join the one already being established.
    ///
    /// Resolves once the first connection attempt does: `Ok` when the socket opens, `Err`
    /// when the endpoint or TLS setup is unusable, or when the first network attempt
    /// fails (reconnection keeps going in the background in that case). Later failures
    /// only reach the handler. A second call while a connection is live ignores its
    /// handler and awaits the existing attempt.
    pub async fn connect<H: ConnectionHandler>(&self, handler: H) -> Result<(), ConnectionError> {
        self.connect_shared(Arc::new(handler)).await
    }

    pub async fn connect_shared(
        &self,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<(), ConnectionError> {
        let mut first = {
            let mut driver = relock(&self.inner.driver);
            match driver.as_ref() {
                Some(active) if !active.handle.is_finished() => {
                    debug!("connect called while a connection is active; joining it");
                    active.first.clone()
                }
                _ => {
                    let url = push_url(&self.inner.config)?;
                    let connector = tls_connector(&self.inner.config)?;
                    let cancel = CancellationToken::new();
                    let (first_tx, first_rx) = watch::channel(None);
                    self.inner.set_state(ConnectionState::Connecting);
                    let handle = tokio::spawn(run_driver(
                        self.inner.clone(),
                        handler,
                        url,
                        connector,
                        cancel.clone(),
                        first_tx,
                    ));
                    *driver = Some(Driver {
                        cancel,
                        first: first_rx.clone(),
                        handle,
                    });
                    first_rx
                }
            }
        };

        let outcome = match first.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(ConnectionError::Cancelled)),
            Err(_) => Err(ConnectionError::Cancelled),
        };
        outcome
    }

    /// Tear the connection down and cancel any scheduled reconnect. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let driver = relock(&self.inner.driver).take();
        if let Some(driver) = driver {
            driver.cancel.cancel();
            let _ = driver.handle.await;
            info!("push channel disconnected");
        }
        self.inner.set_outbound(None);
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Best-effort send. Returns false (and logs) when there is no open connection; nothing
    /// is queued for later.
    pub fn send(&self, envelope: &Envelope) -> bool {
        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "failed to encode outbound message");
                return false;
            }
        };
        let outbound = relock(&self.inner.outbound);
        match outbound.as_ref() {
            Some(tx) if self.is_connected() => tx.send(Message::Text(text)).is_ok(),
            _ => {
                warn!(kind = %envelope.kind, "push channel not connected; dropping outbound message");
                false
            }
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn feed(&self) -> MessageFeed {
        self.inner.feed.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WebSocketMessage> {
        self.inner.feed.subscribe()
    }
}

fn push_url(config: &ConnectionConfig) -> Result<String, ConnectionError> {
    let mut url = Url::parse(&config.url)
        .map_err(|e| ConnectionError::InvalidEndpoint(format!("{}: {e}", config.url)))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ConnectionError::InvalidEndpoint(format!(
            "unsupported scheme `{}`",
            url.scheme()
        )));
    }
    if let Some(token) = config.token.as_deref() {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url.into())
}

fn tls_connector(config: &ConnectionConfig) -> Result<Option<Connector>, ConnectionError> {
    if !config.accept_invalid_certs {
        return Ok(None);
    }
    native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map(|tls| Some(Connector::NativeTls(tls)))
        .map_err(|e| ConnectionError::Tls(e.to_string()))
}

/// Strip the query (which may carry the token) for logging.
fn redact(url: &str) -> String {
    url.split('?').next().unwrap_or(url).to_string()
}

async fn run_driver(
    inner: Arc<Inner>,
    handler: Arc<dyn ConnectionHandler>,
    url: String,
    connector: Option<Connector>,
    cancel: CancellationToken,
    first_tx: watch::Sender<FirstAttempt>,
) {
    let mut first = Some(first_tx);
    let mut attempt: u32 = 0;

    loop {
        let connecting = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = tokio_tungstenite::connect_async_tls_with_config(
                url.as_str(),
                None,
                false,
                connector.clone(),
            ) => res,
        };

        match connecting {
            Ok((socket, _)) => {
                attempt = 0;
                let (tx, rx) = mpsc::unbounded_channel::<Message>();
                inner.set_outbound(Some(tx));
                inner.set_state(ConnectionState::Connected);
                info!(url = %redact(&url), "push channel connected");
                if let Some(tx) = first.take() {
                    let _ = tx.send(Some(Ok(())));
                }
                handler.on_connect();

                let reason = run_session(&inner, handler.as_ref(), socket, rx, &cancel).await;
                inner.set_outbound(None);
                inner.set_state(ConnectionState::Disconnected);
                handler.on_disconnect(&reason);
                if reason == DisconnectReason::Requested {
                    break;
                }
                warn!(?reason, "push channel dropped");
            }
            Err(e) => {
                let err = ConnectionError::Connect(e.to_string());
                warn!(error = %err, attempt, "push connect failed");
                handler.on_error(&err);
                if let Some(tx) = first.take() {
                    let _ = tx.send(Some(Err(err)));
                }
            }
        }

        if cancel.is_cancelled() {
            break;
        }
        if !handler.should_reconnect() {
            info!("session no longer authenticated; not reconnecting");
            break;
        }

        let delay = inner.config.backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        inner.set_state(ConnectionState::Reconnecting);
        debug!(attempt, ?delay, "scheduling reconnect");
        handler.on_reconnect(attempt, delay);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = time::sleep(delay) => {}
        }
    }

    inner.set_outbound(None);
    inner.set_state(ConnectionState::Disconnected);
}

async fn run_session(
    inner: &Inner,
    handler: &dyn ConnectionHandler,
    socket: Socket,
    mut rx: mpsc::UnboundedReceiver<Message>,
    cancel: &CancellationToken,
) -> DisconnectReason {
    let (mut sink, mut stream) = socket.split();

    let period = inner.config.heartbeat_interval;
    let pong_timeout = inner.config.heartbeat_timeout;
    let mut heartbeat = time::interval_at(Instant::now() + period, period);
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let deadline = pong_deadline;
        let pong_overdue = async move {
            match deadline {
                Some(at) => time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return DisconnectReason::Requested;
            }
            _ = pong_overdue => {
                handler.on_error(&ConnectionError::HeartbeatTimeout(pong_timeout));
                return DisconnectReason::HeartbeatTimeout;
            }
            Some(out) = rx.recv() => {
                if let Err(e) = sink.send(out).await {
                    return transport_failure(handler, e.to_string());
                }
            }
            _ = heartbeat.tick() => {
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + pong_timeout);
                }
                let ping = match serde_json::to_string(&Envelope::ping()) {
                    Ok(text) => text,
                    Err(e) => return transport_failure(handler, e.to_string()),
                };
                if let Err(e) = sink.send(Message::Text(ping)).await {
                    return transport_failure(handler, e.to_string());
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if inner.dispatch(handler, &text) {
                        pong_deadline = None;
                    }
                }
                Some(Ok(Message::Pong(_))) => pong_deadline = None,
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "server closed push channel");
                    return DisconnectReason::ClosedByPeer;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return transport_failure(handler, e.to_string()),
                None => return DisconnectReason::ClosedByPeer,
            },
        }
    }
}

fn transport_failure(handler: &dyn ConnectionHandler, detail: String) -> DisconnectReason {
    handler.on_error(&ConnectionError::Transport(detail.clone()));
    DisconnectReason::Transport(detail)
}
