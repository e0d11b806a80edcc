use crate::error::SyncError;
use crate::market::cache::{quote_cache_key, RequestCache};
use crate::market::quota::QuotaBroadcaster;
use crate::market::types::{normalize_symbol, Quote};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, warn};

pub type SharedQuoteCache = Arc<Mutex<RequestCache<Quote>>>;

/// Multi-symbol fetch endpoint.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch_quotes(&self, symbols: &[String]) -> Result<HashMap<String, Quote>, SyncError>;
}

#[derive(Debug)]
pub struct PendingBatchRequest {
    pub symbol: String,
    pub enqueued_at: Instant,
    responder: oneshot::Sender<Result<Quote, SyncError>>,
}

impl PendingBatchRequest {
    // Consumes the request, so it can only ever settle once.
    fn settle(self, result: Result<Quote, SyncError>) {
        let _ = self.responder.send(result);
    }
}

struct OpenBatch {
    id: u64,
    pending: Vec<PendingBatchRequest>,
    timer: Option<JoinHandle<()>>,
}

struct BatchInner {
    source: Arc<dyn QuoteSource>,
    cache: SharedQuoteCache,
    quota: QuotaBroadcaster,
    window: Duration,
    cache_ttl: Duration,
    open: Mutex<Option<OpenBatch>>,
    in_flight: Mutex<HashMap<u64, AbortHandle>>,
    next_batch_id: AtomicU64,
    shut_down: AtomicBool,
}

/// Coalesces per-symbol requests made within one debounce window into a
/// single call to the [`QuoteSource`].
#[derive(Clone)]
pub struct BatchScheduler {
    inner: Arc<BatchInner>,
}

impl BatchScheduler {
    pub fn new(
        source: Arc<dyn QuoteSource>,
        cache: SharedQuoteCache,
        quota: QuotaBroadcaster,
        window: Duration,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                source,
                cache,
                quota,
                window,
                cache_ttl,
                open: Mutex::new(None),
                in_flight: Mutex::new(HashMap::new()),
                next_batch_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub async fn request(&self, symbol: &str) -> Result<Quote, SyncError> {
        let symbol = normalize_symbol(symbol)?;
        if let Some(quote) = self.inner.cache.lock().get(&quote_cache_key(&symbol)) {
            return Ok(quote);
        }

        let receiver = self.enqueue(symbol)?;
        receiver.await.unwrap_or(Err(SyncError::Cancelled))
    }

    /// Requests waiting for the current window to close.
    pub fn open_batch_len(&self) -> usize {
        self.inner
            .open
            .lock()
            .as_ref()
            .map(|batch| batch.pending.len())
            .unwrap_or(0)
    }

    /// Cancels the debounce timer and any call in flight. Every request that
    /// has not settled yet is rejected with [`SyncError::Cancelled`].
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);

        let open = self.inner.open.lock().take();
        if let Some(batch) = open {
            if let Some(timer) = batch.timer {
                timer.abort();
            }
            for request in batch.pending {
                request.settle(Err(SyncError::Cancelled));
            }
        }

        // aborted tasks drop their responders, which the callers see as Cancelled
        for (_, handle) in self.inner.in_flight.lock().drain() {
            handle.abort();
        }
    }

    fn enqueue(&self, symbol: String) -> Result<oneshot::Receiver<Result<Quote, SyncError>>, SyncError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }

        let (responder, receiver) = oneshot::channel();
        let mut open = self.inner.open.lock();
        let batch = open.get_or_insert_with(|| OpenBatch {
            id: self.inner.next_batch_id.fetch_add(1, Ordering::Relaxed),
            pending: Vec::new(),
            timer: None,
        });

        if batch.timer.is_none() {
            let scheduler = self.clone();
            let batch_id = batch.id;
            let window = self.inner.window;
            debug!(batch_id, window_ms = window.as_millis() as u64, "opening batch window");
            batch.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(window).await;
                scheduler.flush(batch_id).await;
            }));
        }

        batch.pending.push(PendingBatchRequest {
            symbol,
            enqueued_at: Instant::now(),
            responder,
        });
        Ok(receiver)
    }

    async fn flush(&self, batch_id: u64) {
        let batch = {
            let mut open = self.inner.open.lock();
            match open.as_ref() {
                Some(batch) if batch.id == batch_id => open.take(),
                _ => None,
            }
        };
        let Some(mut batch) = batch else {
            return;
        };

        if let Some(timer) = batch.timer.take() {
            self.inner
                .in_flight
                .lock()
                .insert(batch_id, timer.abort_handle());
        }
        if self.inner.shut_down.load(Ordering::SeqCst) {
            for request in batch.pending {
                request.settle(Err(SyncError::Cancelled));
            }
            self.inner.in_flight.lock().remove(&batch_id);
            return;
        }
        self.dispatch(batch_id, batch.pending).await;
        self.inner.in_flight.lock().remove(&batch_id);
    }

    async fn dispatch(&self, batch_id: u64, pending: Vec<PendingBatchRequest>) {
        let mut symbols: Vec<String> = Vec::new();
        let mut waiters: HashMap<String, Vec<PendingBatchRequest>> = HashMap::new();
        {
            let cache = self.inner.cache.lock();
            for request in pending {
                // an earlier batch may have filled the cache while this window was open
                if let Some(quote) = cache.get(&quote_cache_key(&request.symbol)) {
                    request.settle(Ok(quote));
                    continue;
                }
                if !waiters.contains_key(&request.symbol) {
                    symbols.push(request.symbol.clone());
                }
                waiters
                    .entry(request.symbol.clone())
                    .or_default()
                    .push(request);
            }
        }

        if symbols.is_empty() {
            return;
        }

        debug!(batch_id, symbols = ?symbols, "dispatching batch");
        match self.inner.source.fetch_quotes(&symbols).await {
            Ok(quotes) => {
                {
                    let mut cache = self.inner.cache.lock();
                    for (symbol, quote) in &quotes {
                        cache.set(quote_cache_key(symbol), quote.clone(), self.inner.cache_ttl);
                    }
                }

                for (symbol, requests) in waiters {
                    match quotes.get(&symbol) {
                        Some(quote) => {
                            for request in requests {
                                request.settle(Ok(quote.clone()));
                            }
                        }
                        None => {
                            warn!(batch_id, %symbol, "symbol missing from batch response");
                            for request in requests {
                                request.settle(Err(SyncError::MissingSymbol(symbol.clone())));
                            }
                        }
                    }
                }
            }
            Err(error) => {
                warn!(batch_id, %error, "batch fetch failed");
                if let SyncError::QuotaExceeded(signal) = &error {
                    self.inner.quota.publish(signal.clone());
                }
                for request in waiters.into_values().flatten() {
                    request.settle(Err(error.for_batch_callers()));
                }
            }
        }
    }
}
