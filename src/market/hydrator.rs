use crate::error::SyncError;
use crate::market::batch::{BatchScheduler, SharedQuoteCache};
use crate::market::cache::quote_cache_key;
use crate::market::types::{DisplayVariant, Quote, WidgetState, WidgetView};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Host-side sink for rendered widget views.
pub trait WidgetRenderer: Send + Sync {
    fn render(&self, view: &WidgetView);
}

/// Forwards every view into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelRenderer {
    sender: mpsc::UnboundedSender<WidgetView>,
}

impl ChannelRenderer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WidgetView>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl WidgetRenderer for ChannelRenderer {
    fn render(&self, view: &WidgetView) {
        let _ = self.sender.send(view.clone());
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRenderer;

impl WidgetRenderer for TracingRenderer {
    fn render(&self, view: &WidgetView) {
        debug!(
            widget_id = view.widget_id,
            symbol = %view.symbol,
            state = view.state.as_str(),
            price = view.quote.as_ref().map(|quote| quote.price),
            stale = view.stale,
            disconnected = view.disconnected,
            "widget rendered"
        );
    }
}

#[derive(Debug)]
struct RenderState {
    state: WidgetState,
    quote: Option<Quote>,
    stale: bool,
    disconnected: bool,
    error: Option<String>,
}

struct HydratorInner {
    widget_id: u64,
    symbol: String,
    variant: DisplayVariant,
    batch: BatchScheduler,
    cache: SharedQuoteCache,
    renderer: Arc<dyn WidgetRenderer>,
    alive: AtomicBool,
    render_state: Mutex<RenderState>,
}

/// Drives one widget from its first load through refreshes and push
/// updates. Clones share the same widget.
#[derive(Clone)]
pub struct WidgetHydrator {
    inner: Arc<HydratorInner>,
}

impl WidgetHydrator {
    pub fn new(
        widget_id: u64,
        symbol: String,
        variant: DisplayVariant,
        batch: BatchScheduler,
        cache: SharedQuoteCache,
        renderer: Arc<dyn WidgetRenderer>,
    ) -> Self {
        Self {
            inner: Arc::new(HydratorInner {
                widget_id,
                symbol,
                variant,
                batch,
                cache,
                renderer,
                alive: AtomicBool::new(true),
                render_state: Mutex::new(RenderState {
                    state: WidgetState::Idle,
                    quote: None,
                    stale: false,
                    disconnected: false,
                    error: None,
                }),
            }),
        }
    }

    pub fn widget_id(&self) -> u64 {
        self.inner.widget_id
    }

    pub fn symbol(&self) -> &str {
        &self.inner.symbol
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> WidgetState {
        self.inner.render_state.lock().state
    }

    pub fn view(&self) -> WidgetView {
        let render_state = self.inner.render_state.lock();
        self.view_of(&render_state)
    }

    /// Loads the widget's quote through the batch scheduler. Results that
    /// arrive after unmount, or after a push already rendered the widget,
    /// are discarded.
    pub async fn hydrate(&self) -> Result<WidgetState, SyncError> {
        self.transition(WidgetState::Loading, |render_state| {
            render_state.error = None;
        })?;

        let result = self.inner.batch.request(&self.inner.symbol).await;
        if !self.is_alive() || self.state() != WidgetState::Loading {
            debug!(widget_id = self.inner.widget_id, "discarding late batch result");
            return Ok(self.state());
        }

        match result {
            Ok(quote) => {
                self.transition(WidgetState::Loaded, |render_state| {
                    render_state.quote = Some(quote);
                    render_state.stale = false;
                })?;
            }
            Err(error) => {
                warn!(
                    widget_id = self.inner.widget_id,
                    symbol = %self.inner.symbol,
                    %error,
                    "widget hydration failed"
                );
                let fallback = self.stale_fallback();
                self.transition(WidgetState::Error, |render_state| {
                    render_state.stale = fallback.is_some();
                    render_state.quote = fallback;
                    render_state.error = Some(error.to_string());
                })?;
            }
        }
        Ok(self.state())
    }

    /// Hydrates unless the widget already shows a quote the cache still
    /// considers fresh.
    pub async fn hydrate_if_stale(&self) -> Result<WidgetState, SyncError> {
        let current = self.state();
        let fresh = self
            .inner
            .cache
            .lock()
            .has_fresh(&quote_cache_key(&self.inner.symbol));
        match current {
            WidgetState::Loading => Ok(current),
            WidgetState::Loaded if fresh => Ok(current),
            _ => self.hydrate().await,
        }
    }

    /// Renders a pushed quote directly. Pushes for other symbols and pushes
    /// that reach a widget that never started loading are ignored.
    pub fn apply_push(&self, quote: Quote) -> bool {
        if quote.symbol != self.inner.symbol || self.state() == WidgetState::Idle {
            return false;
        }
        self.transition(WidgetState::Loaded, |render_state| {
            render_state.quote = Some(quote);
            render_state.stale = false;
            render_state.error = None;
        })
        .is_ok()
    }

    pub fn mark_disconnected(&self, disconnected: bool) {
        if !self.is_alive() {
            return;
        }
        let view = {
            let mut render_state = self.inner.render_state.lock();
            if render_state.disconnected == disconnected {
                return;
            }
            render_state.disconnected = disconnected;
            if render_state.state == WidgetState::Idle {
                return;
            }
            self.view_of(&render_state)
        };
        self.inner.renderer.render(&view);
    }

    pub fn unmount(&self) {
        self.inner.alive.store(false, Ordering::SeqCst);
    }

    fn stale_fallback(&self) -> Option<Quote> {
        let own = self.inner.render_state.lock().quote.clone();
        own.or_else(|| {
            self.inner
                .cache
                .lock()
                .get_any(&quote_cache_key(&self.inner.symbol))
                .map(|read| read.payload)
        })
    }

    fn transition(
        &self,
        next: WidgetState,
        apply: impl FnOnce(&mut RenderState),
    ) -> Result<(), SyncError> {
        if !self.is_alive() {
            return Err(SyncError::Cancelled);
        }

        let view = {
            let mut render_state = self.inner.render_state.lock();
            if !render_state.state.can_transition_to(next) {
                return Err(SyncError::InvalidTransition {
                    from: render_state.state.as_str(),
                    to: next.as_str(),
                });
            }
            render_state.state = next;
            apply(&mut render_state);
            self.view_of(&render_state)
        };
        self.inner.renderer.render(&view);
        Ok(())
    }

    fn view_of(&self, render_state: &RenderState) -> WidgetView {
        WidgetView {
            widget_id: self.inner.widget_id,
            symbol: self.inner.symbol.clone(),
            variant: self.inner.variant,
            state: render_state.state,
            quote: render_state.quote.clone(),
            stale: render_state.stale,
            disconnected: render_state.disconnected,
            error: render_state.error.clone(),
        }
    }
}
