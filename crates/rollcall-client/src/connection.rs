//! Client connection manager.
//!
//! One [`ConnectionManager`] owns exactly one live WebSocket for one
//! identity. It authenticates, subscribes to its topics, resyncs through a
//! [`SnapshotSource`], keeps the link alive with heartbeats and redials with
//! exponential backoff when the link dies. Pushed envelopes are merged into a
//! [`SharedReconciler`] and re-published on [`ConnectionManager::events`].
//!
//! A resync always waits until the server has acknowledged every
//! subscription, so any fact the snapshot misses is pushed afterwards. The
//! snapshot covers all current topics, and a subscription change while
//! connected triggers a fresh one.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use rollcall_core::enrollment::Role;
use rollcall_core::envelope::Envelope;
use rollcall_core::errors::AuthError;
use rollcall_core::ids::UserId;
use rollcall_core::protocol::{ClientFrame, ControlFrame, ServerFrame};
use rollcall_core::retry::ReconnectPolicy;
use rollcall_core::topic::TopicKey;

use crate::error::ClientError;
use crate::reconciler::SharedReconciler;
use crate::snapshot::{CredentialProvider, SnapshotSource};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Consecutive failed redials before the status turns [`ConnectionStatus::Offline`].
pub const DEFAULT_OFFLINE_AFTER: u32 = 3;

const EVENT_CHANNEL_CAPACITY: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Connection manager settings.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:8080/ws`.
    pub server_url: String,
    /// REST base URL, e.g. `http://127.0.0.1:8080`.
    pub api_url: String,
    /// Topics to subscribe after every (re)connect.
    pub topics: Vec<TopicKey>,
    /// Heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Silence after which the link is considered dead.
    pub heartbeat_timeout: Duration,
    /// Deadline for `AUTH_OK`.
    pub auth_timeout: Duration,
    /// Redial spacing.
    pub reconnect: ReconnectPolicy,
    /// Ask for a replay instead of a full resync when reconnecting.
    pub replay_on_reconnect: bool,
    /// Failed redials before reporting offline.
    pub offline_after: u32,
}

impl ClientConfig {
    /// Defaults for a server at `server_url` / `api_url`.
    pub fn new(server_url: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            api_url: api_url.into(),
            topics: Vec::new(),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            replay_on_reconnect: false,
            offline_after: DEFAULT_OFFLINE_AFTER,
        }
    }

    /// Add a topic.
    #[must_use]
    pub fn with_topic(mut self, topic: TopicKey) -> Self {
        if !self.topics.contains(&topic) {
            self.topics.push(topic);
        }
        self
    }
}

/// Connectivity as seen by the UI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected and not trying.
    Disconnected,
    /// Dialing or waiting to redial.
    Connecting,
    /// Authenticated and live.
    Connected,
    /// Still redialing, but failures have persisted.
    Offline,
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// One live connection per identity, kept alive across failures.
pub struct ConnectionManager {
    inner: Arc<Inner>,
    running: tokio::sync::Mutex<Option<Running>>,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: ClientConfig,
    credentials: Arc<dyn CredentialProvider>,
    snapshots: Arc<dyn SnapshotSource>,
    reconciler: SharedReconciler,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<Envelope>,
    last_error: Mutex<Option<String>>,
    topics: Mutex<Vec<TopicKey>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
}

/// An authenticated, subscribed, resynced socket.
struct Link {
    tx: WsSink,
    rx: WsSource,
    outbound: mpsc::UnboundedReceiver<ClientFrame>,
}

impl ConnectionManager {
    /// Build an idle manager.
    pub fn new(
        config: ClientConfig,
        credentials: Arc<dyn CredentialProvider>,
        snapshots: Arc<dyn SnapshotSource>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let topics = Mutex::new(config.topics.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                credentials,
                snapshots,
                reconciler: SharedReconciler::new(),
                status,
                events,
                last_error: Mutex::new(None),
                topics,
                outbound: Mutex::new(None),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Connect as `user_id` / `role`.
    ///
    /// Resolves once the server has answered `AUTH_OK`, the configured topics
    /// are requested and the first resync has been applied. Fails on
    /// `AUTH_REJECTED` or transport error without retrying. Once connected,
    /// the manager keeps redialing in the background until
    /// [`disconnect`](Self::disconnect). Calling it while already running
    /// is a no-op.
    #[instrument(skip_all, fields(user_id = %user_id, role = %role))]
    pub async fn connect(&self, user_id: UserId, role: Role) -> Result<(), ClientError> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Ok(());
        }

        self.inner.set_status(ConnectionStatus::Connecting);
        let link = match self.inner.open(&user_id, role, false).await {
            Ok(link) => link,
            Err(e) => {
                self.inner.record_error(&e);
                self.inner.clear_outbound();
                self.inner.set_status(ConnectionStatus::Disconnected);
                return Err(e);
            }
        };

        info!("connected");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&self.inner).supervise(
            link,
            user_id,
            role,
            cancel.clone(),
        ));
        *running = Some(Running { cancel, task });
        Ok(())
    }

    /// Close the connection and stop redialing. Idempotent.
    pub async fn disconnect(&self) {
        let running = self.running.lock().await.take();
        if let Some(Running { cancel, task }) = running {
            cancel.cancel();
            if let Err(e) = task.await {
                warn!(error = %e, "connection task ended abnormally");
            }
        }
        self.inner.clear_outbound();
        self.inner.set_status(ConnectionStatus::Disconnected);
    }

    /// Add a topic, subscribing right away if connected. The cache is
    /// resynced once the server acknowledges it; a refused topic is dropped.
    pub fn subscribe(&self, topic: TopicKey) {
        {
            let mut topics = self.inner.topics.lock();
            if topics.contains(&topic) {
                return;
            }
            topics.push(topic.clone());
        }
        self.inner.send_now(ClientFrame::Subscribe {
            topic: topic.to_string(),
        });
    }

    /// Drop a topic, unsubscribing right away if connected.
    pub fn unsubscribe(&self, topic: &TopicKey) {
        self.inner.topics.lock().retain(|t| t != topic);
        self.inner.send_now(ClientFrame::Unsubscribe {
            topic: topic.to_string(),
        });
    }

    /// Topics requested after every (re)connect.
    pub fn topics(&self) -> Vec<TopicKey> {
        self.inner.topics.lock().clone()
    }

    /// Current connectivity.
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    /// Follow connectivity changes.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Envelopes that changed the cache, in arrival order.
    pub fn events(&self) -> broadcast::Receiver<Envelope> {
        self.inner.events.subscribe()
    }

    /// Most recent failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// The merged enrollment view.
    pub fn reconciler(&self) -> &SharedReconciler {
        &self.inner.reconciler
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("server_url", &self.inner.config.server_url)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection tasks
// ─────────────────────────────────────────────────────────────────────────────

impl Inner {
    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(?previous, ?status, "connection status changed");
        }
    }

    fn record_error(&self, error: &ClientError) {
        *self.last_error.lock() = Some(error.to_string());
    }

    fn send_now(&self, frame: ClientFrame) {
        if let Some(tx) = self.outbound.lock().as_ref() {
            let _ = tx.send(frame);
        }
    }

    fn clear_outbound(&self) {
        *self.outbound.lock() = None;
    }

    fn forget_topic(&self, raw: &str) {
        self.topics.lock().retain(|t| t.to_string() != raw);
    }

    /// Dial, authenticate, subscribe and resync.
    async fn open(&self, user_id: &UserId, role: Role, resumed: bool) -> Result<Link, ClientError> {
        let ws = self.dial(user_id, role).await?;
        self.establish(ws, resumed).await
    }

    async fn dial(&self, user_id: &UserId, role: Role) -> Result<WsStream, ClientError> {
        let token = self.credentials.token(user_id, role).await?;
        let (mut ws, _) = connect_async(self.config.server_url.as_str()).await?;
        send_frame(
            &mut ws,
            &ClientFrame::Auth {
                user_id: user_id.clone(),
                role,
                token,
            },
        )
        .await?;
        tokio::time::timeout(self.config.auth_timeout, await_auth_ok(&mut ws))
            .await
            .map_err(|_| ClientError::transport("timed out waiting for AUTH_OK"))??;
        Ok(ws)
    }

    async fn establish(&self, ws: WsStream, resumed: bool) -> Result<Link, ClientError> {
        let (mut tx, mut rx) = ws.split();

        // Open the command channel before reading topics so a concurrent
        // subscribe is never lost; a duplicate SUBSCRIBE is harmless.
        let (out_tx, outbound) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(out_tx);
        let topics = self.topics.lock().clone();
        for topic in &topics {
            send_frame(&mut tx, &ClientFrame::Subscribe { topic: topic.to_string() }).await?;
        }
        let deferred = tokio::time::timeout(
            self.config.auth_timeout,
            self.await_subscribed(&mut rx, &topics),
        )
        .await
        .map_err(|_| ClientError::transport("timed out waiting for SUBSCRIBED"))??;

        let replay_from = if resumed && self.config.replay_on_reconnect {
            self.reconciler.last_event_id()
        } else {
            None
        };
        match replay_from {
            Some(last_event_id) => {
                debug!(%last_event_id, "requesting replay");
                send_frame(&mut tx, &ClientFrame::Replay { last_event_id }).await?;
            }
            None => self.resync().await?,
        }
        for text in &deferred {
            self.handle_text(text).await?;
        }

        Ok(Link { tx, rx, outbound })
    }

    /// Read until every topic is answered with `SUBSCRIBED` or a topic
    /// `ERROR`. Other frames are returned to be handled after the resync.
    async fn await_subscribed(
        &self,
        rx: &mut WsSource,
        topics: &[TopicKey],
    ) -> Result<Vec<String>, ClientError> {
        let mut waiting: HashSet<String> = topics.iter().map(ToString::to_string).collect();
        let mut deferred = Vec::new();
        while !waiting.is_empty() {
            let msg = match rx.next().await {
                Some(msg) => msg?,
                None => return Err(ClientError::transport("connection closed while subscribing")),
            };
            let text = match msg {
                Message::Text(text) => text.as_str().to_owned(),
                Message::Close(_) => {
                    return Err(ClientError::transport("closed by server while subscribing"));
                }
                _ => continue,
            };
            match serde_json::from_str::<ServerFrame>(&text) {
                Ok(ServerFrame::Control(ControlFrame::Subscribed { topic })) => {
                    let _ = waiting.remove(&topic.to_string());
                }
                Ok(ServerFrame::Control(ControlFrame::Error {
                    code,
                    message,
                    topic: Some(topic),
                })) if waiting.contains(&topic) => {
                    warn!(?code, %topic, %message, "subscription refused");
                    self.forget_topic(&topic);
                    *self.last_error.lock() = Some(message);
                    let _ = waiting.remove(&topic);
                }
                _ => deferred.push(text),
            }
        }
        Ok(deferred)
    }

    async fn resync(&self) -> Result<(), ClientError> {
        let topics = self.topics.lock().clone();
        let snapshot = self.snapshots.fetch(&topics).await?;
        let applied = self.reconciler.apply_snapshot(&snapshot);
        debug!(applied, count = snapshot.enrollments.len(), "resynced");
        Ok(())
    }

    /// Drive one live link. `Ok` means we were asked to stop; `Err` means
    /// the link died.
    async fn pump(&self, link: Link, cancel: &CancellationToken) -> Result<(), ClientError> {
        let Link {
            mut tx,
            mut rx,
            mut outbound,
        } = link;
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let _ = ticker.tick().await;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = tx.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if last_seen.elapsed() > self.config.heartbeat_timeout {
                        return Err(ClientError::transport("heartbeat timed out"));
                    }
                    send_frame(&mut tx, &ClientFrame::Heartbeat).await?;
                }
                Some(frame) = outbound.recv() => send_frame(&mut tx, &frame).await?,
                next = rx.next() => {
                    let msg = match next {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(ClientError::transport("connection closed")),
                    };
                    last_seen = Instant::now();
                    match msg {
                        Message::Text(text) => self.handle_text(text.as_str()).await?,
                        Message::Close(frame) => {
                            let reason = frame.map(|f| f.reason.as_str().to_owned()).unwrap_or_default();
                            return Err(ClientError::transport(format!("closed by server: {reason}")));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) -> Result<(), ClientError> {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "undecodable server frame");
                return Ok(());
            }
        };
        match frame {
            ServerFrame::Envelope(envelope) => {
                let outcome = self.reconciler.apply_event(&envelope);
                debug!(event_id = %envelope.event_id, ?outcome, "envelope applied");
                if outcome.changed() {
                    let _ = self.events.send(envelope);
                }
            }
            ServerFrame::Control(ControlFrame::ReplayUnavailable) => {
                info!("replay window missed, resyncing");
                self.resync().await?;
            }
            ServerFrame::Control(ControlFrame::ReplayComplete { replayed }) => {
                debug!(replayed, "replay complete");
            }
            ServerFrame::Control(
                ControlFrame::Subscribed { topic } | ControlFrame::Unsubscribed { topic },
            ) => {
                debug!(%topic, "subscriptions changed, resyncing");
                self.resync().await?;
            }
            ServerFrame::Control(ControlFrame::Error {
                code,
                message,
                topic,
            }) => {
                warn!(?code, ?topic, %message, "server refused frame");
                if let Some(topic) = &topic {
                    self.forget_topic(topic);
                }
                *self.last_error.lock() = Some(message);
            }
            ServerFrame::Control(other) => debug!(?other, "control frame"),
        }
        Ok(())
    }

    async fn supervise(
        self: Arc<Self>,
        first: Link,
        user_id: UserId,
        role: Role,
        cancel: CancellationToken,
    ) {
        let mut link = Some(first);
        let mut failures: u32 = 0;

        loop {
            if let Some(current) = link.take() {
                self.set_status(ConnectionStatus::Connected);
                failures = 0;
                let result = self.pump(current, &cancel).await;
                self.clear_outbound();
                match result {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(error = %e, "connection lost");
                        self.record_error(&e);
                    }
                }
            }

            self.set_status(if failures >= self.config.offline_after {
                ConnectionStatus::Offline
            } else {
                ConnectionStatus::Connecting
            });
            let delay = self.config.reconnect.delay_for(failures, rand::random::<f64>());
            debug!(attempt = failures, delay_ms = delay.as_millis(), "scheduling reconnect");
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                () = cancel.cancelled() => break,
                result = self.open(&user_id, role, true) => result,
            };
            match result {
                Ok(next) => {
                    info!(attempts = failures + 1, "reconnected");
                    link = Some(next);
                }
                Err(e) if e.is_retryable() => {
                    debug!(error = %e, "reconnect attempt failed");
                    self.clear_outbound();
                    self.record_error(&e);
                    failures = failures.saturating_add(1);
                }
                Err(e) => {
                    error!(error = %e, "reconnect refused, giving up");
                    self.clear_outbound();
                    self.record_error(&e);
                    break;
                }
            }
        }

        self.clear_outbound();
        self.set_status(ConnectionStatus::Disconnected);
    }
}

async fn await_auth_ok(ws: &mut WsStream) -> Result<(), ClientError> {
    while let Some(msg) = ws.next().await {
        let text = match msg? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<ServerFrame>(text.as_str()) {
            Ok(ServerFrame::Control(ControlFrame::AuthOk { session_id })) => {
                debug!(%session_id, "authenticated");
                return Ok(());
            }
            Ok(ServerFrame::Control(ControlFrame::AuthRejected { reason })) => {
                return Err(AuthError::Rejected(reason).into());
            }
            Ok(other) => debug!(?other, "ignoring frame before AUTH_OK"),
            Err(e) => return Err(ClientError::Decode(e.to_string())),
        }
    }
    Err(ClientError::transport("connection closed during handshake"))
}

async fn send_frame<S>(sink: &mut S, frame: &ClientFrame) -> Result<(), ClientError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(frame).map_err(|e| ClientError::Decode(e.to_string()))?;
    sink.send(Message::text(json)).await?;
    Ok(())
}
