use crate::error::SyncError;
use crate::market::batch::QuoteSource;
use crate::market::stream::{FrameStream, StreamConnector, StreamFrame};
use crate::market::types::Quote;
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub type ServerHandle = mpsc::UnboundedSender<Result<StreamFrame, SyncError>>;

pub fn sample_quote(symbol: &str, price: f64) -> Quote {
    Quote {
        symbol: symbol.to_string(),
        price,
        change: None,
        change_percent: None,
        volume: None,
        timestamp_ms: None,
    }
}

/// Quote source that answers every symbol with a configurable price and
/// records each call it receives.
#[derive(Default)]
pub struct RecordingSource {
    calls: Mutex<Vec<Vec<String>>>,
    prices: Mutex<HashMap<String, f64>>,
    omitted: Mutex<HashSet<String>>,
    failures: Mutex<VecDeque<SyncError>>,
    latency: Duration,
}

impl RecordingSource {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.lock().insert(symbol.to_string(), price);
    }

    pub fn omit(&self, symbol: &str) {
        self.omitted.lock().insert(symbol.to_string());
    }

    pub fn fail_next(&self, error: SyncError) {
        self.failures.lock().push_back(error);
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl QuoteSource for RecordingSource {
    async fn fetch_quotes(&self, symbols: &[String]) -> Result<HashMap<String, Quote>, SyncError> {
        self.calls.lock().push(symbols.to_vec());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let prices = self.prices.lock();
        let omitted = self.omitted.lock();
        Ok(symbols
            .iter()
            .filter(|symbol| !omitted.contains(*symbol))
            .map(|symbol| {
                let price = prices.get(symbol).copied().unwrap_or(100.0);
                (symbol.clone(), sample_quote(symbol, price))
            })
            .collect())
    }
}

pub enum ScriptedConnection {
    Fail,
    Open(mpsc::UnboundedReceiver<Result<StreamFrame, SyncError>>),
}

/// Connector that plays back scripted outcomes in order; once the script
/// runs out every attempt fails.
#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<ScriptedConnection>>,
    urls: Mutex<Vec<String>>,
    attempts: Mutex<Vec<Instant>>,
    handshake: Duration,
}

impl ScriptedConnector {
    /// Every attempt takes `handshake` before the scripted outcome is taken.
    pub fn with_handshake(handshake: Duration) -> Self {
        Self {
            handshake,
            ..Self::default()
        }
    }

    pub fn script(&self, connection: ScriptedConnection) {
        self.script.lock().push_back(connection);
    }

    /// Queues a connection that stays open until the returned handle sends
    /// `StreamFrame::Close` or is dropped.
    pub fn script_open(&self) -> ServerHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.script(ScriptedConnection::Open(receiver));
        sender
    }

    pub fn connect_count(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn connect(&self, url: &str) -> Result<FrameStream, SyncError> {
        self.attempts.lock().push(Instant::now());
        self.urls.lock().push(url.to_string());
        if !self.handshake.is_zero() {
            tokio::time::sleep(self.handshake).await;
        }

        let next = self.script.lock().pop_front();
        match next {
            Some(ScriptedConnection::Open(receiver)) => Ok(futures_util::stream::unfold(
                receiver,
                |mut receiver| async move { receiver.recv().await.map(|frame| (frame, receiver)) },
            )
            .boxed()),
            Some(ScriptedConnection::Fail) | None => {
                Err(SyncError::Connection("scripted connect failure".to_string()))
            }
        }
    }
}
