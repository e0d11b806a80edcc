use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::market::batch::{BatchScheduler, QuoteSource, SharedQuoteCache};
use crate::market::cache::RequestCache;
use crate::market::hydrator::{WidgetHydrator, WidgetRenderer};
use crate::market::quota::QuotaBroadcaster;
use crate::market::session::SessionStore;
use crate::market::stream::{StreamClientConfig, StreamConnector};
use crate::market::subscriptions::StreamHub;
use crate::market::transport::{HttpQuoteSource, WsConnector};
use crate::market::visibility::{ElementId, PeriodicHandle, VisibilityScheduler};
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

const HTTP_TIMEOUT_SECS: u64 = 10;

pub struct MountedWidget {
    pub hydrator: WidgetHydrator,
    pub channel: String,
    pub element: Option<ElementId>,
    pub refresh: Option<PeriodicHandle>,
    pub forwarder: CancellationToken,
}

/// Everything one dashboard shares: cache, batcher, push channels and the
/// visibility scheduler. Built once by the host and passed to every command.
pub struct SyncContext {
    pub started_at: Instant,
    pub config: SyncConfig,
    pub cache: SharedQuoteCache,
    pub batch: BatchScheduler,
    pub streams: StreamHub,
    pub visibility: Arc<VisibilityScheduler>,
    pub quota: QuotaBroadcaster,
    pub session: Arc<dyn SessionStore>,
    pub renderer: Arc<dyn WidgetRenderer>,
    pub widgets: Mutex<HashMap<u64, MountedWidget>>,
    next_widget_id: AtomicU64,
}

impl SyncContext {
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn QuoteSource>,
        connector: Arc<dyn StreamConnector>,
        session: Arc<dyn SessionStore>,
        renderer: Arc<dyn WidgetRenderer>,
    ) -> Self {
        let cache: SharedQuoteCache = Arc::new(Mutex::new(RequestCache::new(
            config.max_cache_entries,
            config.cache_ttl,
        )));
        let quota = QuotaBroadcaster::default();
        let batch = BatchScheduler::new(
            source,
            Arc::clone(&cache),
            quota.clone(),
            config.batch_window,
            config.cache_ttl,
        );
        let streams = StreamHub::new(
            StreamClientConfig::from_sync_config(&config),
            connector,
            Arc::clone(&session),
        );
        let visibility = Arc::new(VisibilityScheduler::new(
            config.lazy_load_root_margin,
            config.lazy_load_threshold,
        ));

        Self {
            started_at: Instant::now(),
            config,
            cache,
            batch,
            streams,
            visibility,
            quota,
            session,
            renderer,
            widgets: Mutex::new(HashMap::new()),
            next_widget_id: AtomicU64::new(1),
        }
    }

    /// Context backed by the real HTTP batch endpoint and WebSocket push
    /// channels.
    pub fn with_http(
        config: SyncConfig,
        session: Arc<dyn SessionStore>,
        renderer: Arc<dyn WidgetRenderer>,
    ) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        let source = HttpQuoteSource::new(
            client,
            config.fetch_base_url.clone(),
            Arc::clone(&session),
        );
        Ok(Self::new(
            config,
            Arc::new(source),
            Arc::new(WsConnector),
            session,
            renderer,
        ))
    }

    pub fn next_widget_id(&self) -> u64 {
        self.next_widget_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn widget_count(&self) -> usize {
        self.widgets.lock().len()
    }

    /// Tears down every widget, timer and connection.
    pub fn shutdown(&self) {
        let widgets: Vec<(u64, MountedWidget)> = self.widgets.lock().drain().collect();
        let count = widgets.len();
        for (widget_id, widget) in widgets {
            widget.teardown(widget_id, self);
        }

        self.batch.shutdown();
        self.streams.shutdown();
        self.visibility.shutdown();
        info!(widgets = count, "sync context shut down");
    }
}

impl MountedWidget {
    pub fn teardown(self, widget_id: u64, context: &SyncContext) {
        self.hydrator.unmount();
        self.forwarder.cancel();
        if let Some(refresh) = self.refresh {
            refresh.cancel();
        }
        if let Some(element) = self.element {
            context.visibility.unobserve(element);
        }
        context.streams.release(&self.channel, widget_id);
    }
}
