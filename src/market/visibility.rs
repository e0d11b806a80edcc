use crate::error::SyncError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Edge contact counts as touching.
    pub fn touches(&self, other: &Rect) -> bool {
        self.x <= other.right()
            && other.x <= self.right()
            && self.y <= other.bottom()
            && other.y <= self.bottom()
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        if !self.touches(other) {
            return None;
        }
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        Some(Rect::new(
            x,
            y,
            self.right().min(other.right()) - x,
            self.bottom().min(other.bottom()) - y,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MarginLength {
    Px(f64),
    Percent(f64),
}

impl MarginLength {
    fn parse(token: &str) -> Result<Self, SyncError> {
        let invalid = || SyncError::InvalidArgument(format!("invalid root margin length '{token}'"));
        let (number, build): (&str, fn(f64) -> MarginLength) =
            if let Some(number) = token.strip_suffix("px") {
                (number, MarginLength::Px)
            } else if let Some(number) = token.strip_suffix('%') {
                (number, MarginLength::Percent)
            } else if token == "0" {
                (token, MarginLength::Px)
            } else {
                return Err(invalid());
            };

        let value = number.parse::<f64>().map_err(|_| invalid())?;
        if !value.is_finite() {
            return Err(invalid());
        }
        Ok(build(value))
    }

    fn resolve(self, basis: f64) -> f64 {
        match self {
            Self::Px(value) => value,
            Self::Percent(value) => basis * value / 100.0,
        }
    }
}

/// Grows (or with negative lengths shrinks) the viewport before visibility
/// is tested, CSS margin shorthand order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RootMargin {
    pub top: MarginLength,
    pub right: MarginLength,
    pub bottom: MarginLength,
    pub left: MarginLength,
}

impl RootMargin {
    pub fn uniform_px(value: f64) -> Self {
        Self {
            top: MarginLength::Px(value),
            right: MarginLength::Px(value),
            bottom: MarginLength::Px(value),
            left: MarginLength::Px(value),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        let lengths = raw
            .split_whitespace()
            .map(MarginLength::parse)
            .collect::<Result<Vec<_>, _>>()?;

        let (top, right, bottom, left) = match lengths.as_slice() {
            [all] => (*all, *all, *all, *all),
            [vertical, horizontal] => (*vertical, *horizontal, *vertical, *horizontal),
            [top, horizontal, bottom] => (*top, *horizontal, *bottom, *horizontal),
            [top, right, bottom, left] => (*top, *right, *bottom, *left),
            _ => {
                return Err(SyncError::InvalidArgument(format!(
                    "root margin '{raw}' must have one to four lengths"
                )))
            }
        };
        Ok(Self {
            top,
            right,
            bottom,
            left,
        })
    }

    pub fn expand(&self, viewport: Rect) -> Rect {
        let top = self.top.resolve(viewport.height);
        let bottom = self.bottom.resolve(viewport.height);
        let left = self.left.resolve(viewport.width);
        let right = self.right.resolve(viewport.width);
        Rect::new(
            viewport.x - left,
            viewport.y - top,
            viewport.width + left + right,
            viewport.height + top + bottom,
        )
    }
}

/// Share of `target` inside `root`. Zero-area targets count as fully inside
/// when they touch the root at all.
pub fn intersection_ratio(target: &Rect, root: &Rect) -> f64 {
    let Some(overlap) = target.intersection(root) else {
        return 0.0;
    };
    let area = target.area();
    if area <= 0.0 {
        return 1.0;
    }
    (overlap.area() / area).clamp(0.0, 1.0)
}

pub fn is_visible(target: &Rect, root: &Rect, threshold: f64) -> bool {
    if !target.touches(root) {
        return false;
    }
    threshold <= 0.0 || intersection_ratio(target, root) >= threshold
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveMode {
    /// Fire on the first time the element becomes visible, never again.
    Once,
    /// Fire on every transition from hidden to visible.
    Rearm,
}

pub type VisibilityCallback = Arc<dyn Fn() + Send + Sync>;

struct ObservedElement {
    rect: Rect,
    mode: ObserveMode,
    on_visible: VisibilityCallback,
    visible: bool,
    fired: bool,
}

#[derive(Default)]
struct ObserverState {
    viewport: Option<Rect>,
    tab_visible: bool,
    elements: HashMap<ElementId, ObservedElement>,
}

impl ObserverState {
    /// Recomputes every element and returns the callbacks owed to elements
    /// that just became visible.
    fn evaluate(&mut self, root_margin: &RootMargin, threshold: f64) -> Vec<VisibilityCallback> {
        let root = self.viewport.map(|viewport| root_margin.expand(viewport));
        let tab_visible = self.tab_visible;
        let mut due = Vec::new();

        for element in self.elements.values_mut() {
            let now_visible = tab_visible
                && root
                    .as_ref()
                    .map(|root| is_visible(&element.rect, root, threshold))
                    .unwrap_or(false);
            let entered = now_visible && !element.visible;
            element.visible = now_visible;

            if entered && (element.mode == ObserveMode::Rearm || !element.fired) {
                element.fired = true;
                due.push(Arc::clone(&element.on_visible));
            }
        }
        due
    }
}

/// Cancels its periodic timer when cancelled or dropped.
#[derive(Debug)]
pub struct PeriodicHandle {
    token: CancellationToken,
}

impl PeriodicHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for PeriodicHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Decides when lazy loads and periodic refreshes may run, based on what the
/// host reports about the viewport, element geometry and tab visibility.
pub struct VisibilityScheduler {
    root_margin: RootMargin,
    threshold: f64,
    state: Arc<Mutex<ObserverState>>,
    tab_visible: watch::Sender<bool>,
    next_element_id: AtomicU64,
    shutdown: CancellationToken,
}

impl VisibilityScheduler {
    pub fn new(root_margin: RootMargin, threshold: f64) -> Self {
        let (tab_visible, _) = watch::channel(true);
        Self {
            root_margin,
            threshold,
            state: Arc::new(Mutex::new(ObserverState {
                tab_visible: true,
                ..ObserverState::default()
            })),
            tab_visible,
            next_element_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn observe(&self, rect: Rect, mode: ObserveMode, on_visible: VisibilityCallback) -> ElementId {
        let id = ElementId(self.next_element_id.fetch_add(1, Ordering::Relaxed));
        self.state.lock().elements.insert(
            id,
            ObservedElement {
                rect,
                mode,
                on_visible,
                visible: false,
                fired: false,
            },
        );
        self.reevaluate();
        id
    }

    pub fn unobserve(&self, id: ElementId) -> bool {
        self.state.lock().elements.remove(&id).is_some()
    }

    pub fn update_element(&self, id: ElementId, rect: Rect) -> bool {
        let known = match self.state.lock().elements.get_mut(&id) {
            Some(element) => {
                element.rect = rect;
                true
            }
            None => false,
        };
        if known {
            self.reevaluate();
        }
        known
    }

    pub fn update_viewport(&self, viewport: Rect) {
        self.state.lock().viewport = Some(viewport);
        self.reevaluate();
    }

    pub fn set_tab_visible(&self, visible: bool) {
        self.state.lock().tab_visible = visible;
        self.tab_visible.send_replace(visible);
        debug!(visible, "tab visibility changed");
        self.reevaluate();
    }

    pub fn tab_visible(&self) -> bool {
        *self.tab_visible.borrow()
    }

    pub fn is_element_visible(&self, id: ElementId) -> bool {
        self.state
            .lock()
            .elements
            .get(&id)
            .map(|element| element.visible)
            .unwrap_or(false)
    }

    /// Runs `callback` every `interval` while the tab is visible. Ticks that
    /// fall in a hidden period are skipped, not replayed.
    pub fn schedule_periodic<F, Fut>(&self, interval: Duration, callback: F) -> PeriodicHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let tab = self.tab_visible.subscribe();
        self.spawn_periodic(interval, move || *tab.borrow(), callback)
    }

    /// Like [`schedule_periodic`](Self::schedule_periodic), additionally
    /// skipping ticks while `element` is outside the viewport.
    pub fn schedule_periodic_while_visible<F, Fut>(
        &self,
        element: ElementId,
        interval: Duration,
        callback: F,
    ) -> PeriodicHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        self.spawn_periodic(
            interval,
            move || {
                let state = state.lock();
                state.tab_visible
                    && state
                        .elements
                        .get(&element)
                        .map(|observed| observed.visible)
                        .unwrap_or(false)
            },
            callback,
        )
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.state.lock().elements.clear();
    }

    fn spawn_periodic<G, F, Fut>(&self, interval: Duration, gate: G, mut callback: F) -> PeriodicHandle
    where
        G: Fn() -> bool + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let interval = interval.max(Duration::from_millis(1));
        let token = self.shutdown.child_token();
        let task_token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !gate() {
                    continue;
                }
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = callback() => {}
                }
            }
        });
        PeriodicHandle { token }
    }

    fn reevaluate(&self) {
        let due = self.state.lock().evaluate(&self.root_margin, self.threshold);
        for callback in due {
            callback();
        }
    }
}
