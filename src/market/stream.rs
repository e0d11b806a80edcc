use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::market::session::SessionStore;
use crate::market::transport::stream_endpoint;
use crate::market::types::{parse_stream_frame, ConnectionState, StreamMessage, StreamStatusSnapshot};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PARSE_WARNING_THROTTLE_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

pub type FrameStream = BoxStream<'static, Result<StreamFrame, SyncError>>;

/// Opens the duplex connection behind a push channel.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<FrameStream, SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Reconnect { attempt: u32, delay: Duration },
    Exhausted,
    /// The close arrived in a state that has no live connection.
    Ignored,
}

/// Connection lifecycle of one channel, free of any IO.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempts: u32,
    exhausted: bool,
    reconnect: bool,
    max_attempts: u32,
    interval: Duration,
}

impl ConnectionMachine {
    pub fn new(reconnect: bool, max_attempts: u32, interval: Duration) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempts: 0,
            exhausted: false,
            reconnect,
            max_attempts,
            interval,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.exhausted
    }

    /// `Idle|Closed -> Connecting`. A closed machine starts over with a fresh counter.
    pub fn start(&mut self) -> bool {
        match self.state {
            ConnectionState::Idle | ConnectionState::Closed => {
                self.state = ConnectionState::Connecting;
                self.attempts = 0;
                self.exhausted = false;
                true
            }
            _ => false,
        }
    }

    pub fn on_open(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Open;
        self.attempts = 0;
        true
    }

    /// Covers both a dropped open connection and a failed handshake.
    pub fn on_unexpected_close(&mut self) -> CloseOutcome {
        if !matches!(
            self.state,
            ConnectionState::Open | ConnectionState::Connecting
        ) {
            return CloseOutcome::Ignored;
        }

        if !self.reconnect || self.attempts >= self.max_attempts {
            self.state = ConnectionState::Closed;
            self.exhausted = true;
            return CloseOutcome::Exhausted;
        }

        self.state = ConnectionState::Reconnecting;
        CloseOutcome::Reconnect {
            attempt: self.attempts + 1,
            delay: self.interval,
        }
    }

    pub fn on_reconnect_timer(&mut self) -> bool {
        if self.state != ConnectionState::Reconnecting {
            return false;
        }
        self.state = ConnectionState::Connecting;
        self.attempts = self.attempts.saturating_add(1);
        true
    }

    pub fn on_explicit_disconnect(&mut self) {
        self.state = ConnectionState::Closed;
        self.exhausted = false;
    }
}

#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    pub stream_base_url: String,
    pub reconnect: bool,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
}

impl StreamClientConfig {
    pub fn from_sync_config(config: &SyncConfig) -> Self {
        Self {
            stream_base_url: config.stream_base_url.clone(),
            reconnect: config.reconnect,
            reconnect_interval: config.reconnect_interval,
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }

    fn machine(&self) -> ConnectionMachine {
        ConnectionMachine::new(
            self.reconnect,
            self.max_reconnect_attempts,
            self.reconnect_interval,
        )
    }
}

#[derive(Debug, Default)]
struct ParseWarningThrottle {
    last_reason: Option<String>,
    last_emit: Option<Instant>,
    suppressed: u64,
}

impl ParseWarningThrottle {
    /// Returns the number of identical warnings swallowed since the last one
    /// that went out, or `None` when this one should be swallowed too.
    fn allow(&mut self, reason: &str, now: Instant) -> Option<u64> {
        let repeated = self.last_reason.as_deref() == Some(reason)
            && self
                .last_emit
                .map(|instant| {
                    now.duration_since(instant) < Duration::from_millis(PARSE_WARNING_THROTTLE_MS)
                })
                .unwrap_or(false);
        if repeated {
            self.suppressed += 1;
            return None;
        }

        self.last_reason = Some(reason.to_string());
        self.last_emit = Some(now);
        Some(std::mem::take(&mut self.suppressed))
    }
}

struct ClientInner {
    channel: String,
    config: StreamClientConfig,
    connector: Arc<dyn StreamConnector>,
    session: Arc<dyn SessionStore>,
    machine: Mutex<ConnectionMachine>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<StreamMessage>>>>,
    status: watch::Sender<StreamStatusSnapshot>,
    cancel: Mutex<Option<CancellationToken>>,
    parse_warnings: Mutex<ParseWarningThrottle>,
    dropped_frames: AtomicU64,
}

/// Push subscription for one channel. Cloning shares the same connection.
#[derive(Clone)]
pub struct StreamClient {
    inner: Arc<ClientInner>,
}

impl StreamClient {
    pub fn new(
        channel: String,
        config: StreamClientConfig,
        connector: Arc<dyn StreamConnector>,
        session: Arc<dyn SessionStore>,
    ) -> Self {
        let (status, _) = watch::channel(StreamStatusSnapshot::idle(channel.clone()));
        let machine = config.machine();
        Self {
            inner: Arc::new(ClientInner {
                channel,
                config,
                connector,
                session,
                machine: Mutex::new(machine),
                subscribers: Mutex::new(HashMap::new()),
                status,
                cancel: Mutex::new(None),
                parse_warnings: Mutex::new(ParseWarningThrottle::default()),
                dropped_frames: AtomicU64::new(0),
            }),
        }
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Starts the driver task. Does nothing while a connection is already
    /// being established, open, or waiting to reconnect.
    pub fn connect(&self) {
        if !self.inner.machine.lock().start() {
            return;
        }

        let token = CancellationToken::new();
        if let Some(previous) = self.inner.cancel.lock().replace(token.clone()) {
            previous.cancel();
        }
        self.inner.publish_status(Some("opening stream".to_string()));

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.drive(token).await;
        });
    }

    /// Closes the channel for good, skipping reconnection. Subscribers see
    /// their receivers end.
    pub fn disconnect(&self) {
        if let Some(token) = self.inner.cancel.lock().take() {
            token.cancel();
        }
        self.inner.machine.lock().on_explicit_disconnect();
        self.inner.subscribers.lock().clear();
        self.inner
            .publish_status(Some("disconnected by caller".to_string()));
        info!(channel = %self.inner.channel, "stream disconnected");
    }

    /// Registers a listener for one message `type`. Listeners whose
    /// receivers were dropped are pruned here and on dispatch.
    pub fn subscribe(&self, kind: &str) -> mpsc::UnboundedReceiver<StreamMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|_, listeners| {
            listeners.retain(|listener| !listener.is_closed());
            !listeners.is_empty()
        });
        subscribers.entry(kind.to_string()).or_default().push(sender);
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().values().map(Vec::len).sum()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.machine.lock().state()
    }

    pub fn status(&self) -> watch::Receiver<StreamStatusSnapshot> {
        self.inner.status.subscribe()
    }

    pub fn status_snapshot(&self) -> StreamStatusSnapshot {
        self.inner.status.borrow().clone()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.inner.dropped_frames.load(Ordering::Relaxed)
    }
}

impl ClientInner {
    async fn drive(self: Arc<Self>, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.open_stream() => result,
            };

            let reason = match connected {
                Ok(frames) => {
                    if self.step_machine(&cancel, ConnectionMachine::on_open) != Some(true) {
                        break;
                    }
                    info!(channel = %self.channel, "stream open");
                    self.publish_status(Some("stream open".to_string()));
                    self.pump(frames, &cancel).await
                }
                Err(error) => format!("connect failed: {error}"),
            };

            let Some(outcome) = self.step_machine(&cancel, ConnectionMachine::on_unexpected_close)
            else {
                break;
            };
            match outcome {
                CloseOutcome::Reconnect { attempt, delay } => {
                    warn!(
                        channel = %self.channel,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "stream closed unexpectedly, scheduling reconnect"
                    );
                    self.publish_status(Some(reason));
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if self.step_machine(&cancel, ConnectionMachine::on_reconnect_timer) != Some(true) {
                        break;
                    }
                    self.publish_status(Some(format!("reconnect attempt {attempt}")));
                }
                CloseOutcome::Exhausted => {
                    warn!(channel = %self.channel, %reason, "stream closed, no reconnect attempts left");
                    self.publish_status(Some(format!("reconnect attempts exhausted: {reason}")));
                    break;
                }
                CloseOutcome::Ignored => break,
            }
        }
        debug!(channel = %self.channel, "stream driver stopped");
    }

    /// Moves the machine on behalf of the driver owning `cancel`. Returns
    /// `None` once that driver has been cancelled, since a later `connect`
    /// may already own the machine.
    fn step_machine<R>(
        &self,
        cancel: &CancellationToken,
        step: impl FnOnce(&mut ConnectionMachine) -> R,
    ) -> Option<R> {
        let mut machine = self.machine.lock();
        if cancel.is_cancelled() {
            return None;
        }
        Some(step(&mut machine))
    }

    async fn open_stream(&self) -> Result<FrameStream, SyncError> {
        let token = self.session.auth_token().await?;
        let endpoint = stream_endpoint(&self.config.stream_base_url, &self.channel, token.as_deref())?;
        debug!(channel = %self.channel, authenticated = token.is_some(), "connecting stream");
        self.connector.connect(endpoint.as_str()).await
    }

    /// Runs until the connection ends, returning why it ended.
    async fn pump(&self, mut frames: FrameStream, cancel: &CancellationToken) -> String {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return "cancelled".to_string(),
                next = frames.next() => next,
            };

            match next {
                Some(Ok(StreamFrame::Text(text))) => self.dispatch(text.into_bytes()),
                Some(Ok(StreamFrame::Binary(bytes))) => self.dispatch(bytes),
                Some(Ok(StreamFrame::Close)) => return "closed by server".to_string(),
                Some(Err(error)) => return format!("frame error: {error}"),
                None => return "stream ended".to_string(),
            }
        }
    }

    fn dispatch(&self, mut payload: Vec<u8>) {
        let message = match parse_stream_frame(&mut payload) {
            Ok(message) => message,
            Err(error) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                let reason = error.to_string();
                if let Some(suppressed) = self.parse_warnings.lock().allow(&reason, Instant::now()) {
                    warn!(channel = %self.channel, suppressed, %reason, "dropping malformed frame");
                }
                return;
            }
        };

        let mut subscribers = self.subscribers.lock();
        if let Some(listeners) = subscribers.get_mut(&message.kind) {
            listeners.retain(|listener| listener.send(message.clone()).is_ok());
        }
    }

    fn publish_status(&self, reason: Option<String>) {
        let snapshot = {
            let machine = self.machine.lock();
            StreamStatusSnapshot {
                state: machine.state(),
                channel: self.channel.clone(),
                reconnect_attempts: machine.attempts(),
                exhausted: machine.exhausted(),
                reason,
            }
        };
        debug!(
            channel = %self.channel,
            state = snapshot.state.as_str(),
            attempts = snapshot.reconnect_attempts,
            "stream status"
        );
        self.status.send_replace(snapshot);
    }
}
