use crate::config::{MAX_REFRESH_INTERVAL_MS, MIN_REFRESH_INTERVAL_MS};
use crate::error::SyncError;
use crate::market::hydrator::WidgetHydrator;
use crate::market::stream::StreamClient;
use crate::market::types::{normalize_symbol, DisplayVariant, WidgetView, QUOTE_MESSAGE_TYPE};
use crate::market::visibility::{ElementId, ObserveMode, Rect, VisibilityCallback};
use crate::state::{MountedWidget, SyncContext};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MountWidgetArgs {
    pub symbol: String,
    pub variant: Option<DisplayVariant>,
    pub lazy: Option<bool>,
    pub rect: Option<Rect>,
    pub refresh_interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct WidgetMount {
    pub symbol: String,
    pub variant: DisplayVariant,
    pub lazy: bool,
    pub rect: Option<Rect>,
    pub refresh_interval: Option<Duration>,
}

impl MountWidgetArgs {
    pub fn normalize(self) -> Result<WidgetMount, SyncError> {
        let symbol = normalize_symbol(&self.symbol)?;
        let lazy = self.lazy.unwrap_or(false);
        if lazy && self.rect.is_none() {
            return Err(SyncError::InvalidArgument(
                "lazy widgets need an element rect".to_string(),
            ));
        }

        let refresh_interval = match self.refresh_interval_ms {
            Some(value) if !(MIN_REFRESH_INTERVAL_MS..=MAX_REFRESH_INTERVAL_MS).contains(&value) => {
                return Err(SyncError::InvalidArgument(format!(
                    "refreshIntervalMs must be between {MIN_REFRESH_INTERVAL_MS} and {MAX_REFRESH_INTERVAL_MS}"
                )))
            }
            Some(value) => Some(Duration::from_millis(value)),
            None => None,
        };

        Ok(WidgetMount {
            symbol,
            variant: self.variant.unwrap_or_default(),
            lazy,
            rect: self.rect,
            refresh_interval,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSession {
    pub widget_id: u64,
    pub symbol: String,
    pub lazy: bool,
    pub element_id: Option<ElementId>,
    pub refresh_interval_ms: u64,
}

pub async fn mount_widget(
    context: &Arc<SyncContext>,
    args: MountWidgetArgs,
) -> Result<WidgetSession, SyncError> {
    let mount = args.normalize()?;
    let widget_id = context.next_widget_id();
    let hydrator = WidgetHydrator::new(
        widget_id,
        mount.symbol.clone(),
        mount.variant,
        context.batch.clone(),
        Arc::clone(&context.cache),
        Arc::clone(&context.renderer),
    );

    let client = context.streams.acquire(&mount.symbol, widget_id)?;
    let forwarder = spawn_push_forwarder(&client, hydrator.clone());

    let runtime = Handle::current();
    let element = mount.rect.map(|rect| {
        let lazy_target = hydrator.clone();
        let runtime = runtime.clone();
        let on_visible: VisibilityCallback = Arc::new(move || {
            let hydrator = lazy_target.clone();
            runtime.spawn(async move {
                if let Err(error) = hydrator.hydrate_if_stale().await {
                    debug!(widget_id = hydrator.widget_id(), %error, "visibility hydrate skipped");
                }
            });
        });
        context.visibility.observe(rect, ObserveMode::Rearm, on_visible)
    });

    if !mount.lazy {
        let eager = hydrator.clone();
        runtime.spawn(async move {
            if let Err(error) = eager.hydrate_if_stale().await {
                debug!(widget_id = eager.widget_id(), %error, "initial hydrate skipped");
            }
        });
    }

    let refresh_interval = mount
        .refresh_interval
        .unwrap_or(context.config.refresh_interval);
    let refresh_target = hydrator.clone();
    let refresh_task = move || {
        let hydrator = refresh_target.clone();
        async move {
            if let Err(error) = hydrator.hydrate().await {
                debug!(widget_id = hydrator.widget_id(), %error, "periodic refresh skipped");
            }
        }
    };
    let refresh = match element {
        Some(element) => context
            .visibility
            .schedule_periodic_while_visible(element, refresh_interval, refresh_task),
        None => context
            .visibility
            .schedule_periodic(refresh_interval, refresh_task),
    };

    context.widgets.lock().insert(
        widget_id,
        MountedWidget {
            hydrator,
            channel: client.channel().to_string(),
            element,
            refresh: Some(refresh),
            forwarder,
        },
    );
    info!(widget_id, symbol = %mount.symbol, lazy = mount.lazy, "widget mounted");

    Ok(WidgetSession {
        widget_id,
        symbol: mount.symbol,
        lazy: mount.lazy,
        element_id: element,
        refresh_interval_ms: refresh_interval.as_millis() as u64,
    })
}

/// Feeds `quote` pushes into the widget and mirrors channel exhaustion as
/// the disconnected indicator.
fn spawn_push_forwarder(client: &StreamClient, hydrator: WidgetHydrator) -> CancellationToken {
    let token = CancellationToken::new();
    let task_token = token.clone();
    let mut quotes = client.subscribe(QUOTE_MESSAGE_TYPE);
    let mut status = client.status();
    hydrator.mark_disconnected(status.borrow_and_update().exhausted);

    tokio::spawn(async move {
        let mut pushes_open = true;
        loop {
            tokio::select! {
                _ = task_token.cancelled() => break,
                message = quotes.recv(), if pushes_open => match message {
                    Some(message) => match message.quote() {
                        Ok(quote) => {
                            hydrator.apply_push(quote);
                        }
                        Err(error) => {
                            warn!(widget_id = hydrator.widget_id(), %error, "ignoring malformed quote push");
                        }
                    },
                    None => pushes_open = false,
                },
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let exhausted = status.borrow_and_update().exhausted;
                    hydrator.mark_disconnected(exhausted);
                }
            }
        }
    });
    token
}

pub fn unmount_widget(context: &SyncContext, widget_id: u64) -> bool {
    let widget = context.widgets.lock().remove(&widget_id);
    match widget {
        Some(widget) => {
            widget.teardown(widget_id, context);
            info!(widget_id, "widget unmounted");
            true
        }
        None => false,
    }
}

pub async fn refresh_widget(context: &SyncContext, widget_id: u64) -> Result<WidgetView, SyncError> {
    let hydrator = mounted_hydrator(context, widget_id)?;
    hydrator.hydrate().await?;
    Ok(hydrator.view())
}

pub fn widget_view(context: &SyncContext, widget_id: u64) -> Result<WidgetView, SyncError> {
    Ok(mounted_hydrator(context, widget_id)?.view())
}

pub fn set_tab_visibility(context: &SyncContext, visible: bool) {
    context.visibility.set_tab_visible(visible);
}

pub fn report_viewport(context: &SyncContext, viewport: Rect) {
    context.visibility.update_viewport(viewport);
}

pub fn report_element_rect(context: &SyncContext, widget_id: u64, rect: Rect) -> Result<bool, SyncError> {
    let element = context
        .widgets
        .lock()
        .get(&widget_id)
        .map(|widget| widget.element)
        .ok_or_else(|| SyncError::InvalidArgument(format!("unknown widget {widget_id}")))?;
    Ok(element
        .map(|element| context.visibility.update_element(element, rect))
        .unwrap_or(false))
}

fn mounted_hydrator(context: &SyncContext, widget_id: u64) -> Result<WidgetHydrator, SyncError> {
    context
        .widgets
        .lock()
        .get(&widget_id)
        .map(|widget| widget.hydrator.clone())
        .ok_or_else(|| SyncError::InvalidArgument(format!("unknown widget {widget_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::market::batch::QuoteSource;
    use crate::market::hydrator::{ChannelRenderer, WidgetRenderer};
    use crate::market::session::MemorySessionStore;
    use crate::market::stream::{StreamConnector, StreamFrame};
    use crate::market::types::{ConnectionState, WidgetState};
    use crate::test_support::{RecordingSource, ScriptedConnector};
    use tokio::sync::mpsc;

    struct Harness {
        context: Arc<SyncContext>,
        source: Arc<RecordingSource>,
        connector: Arc<ScriptedConnector>,
        views: mpsc::UnboundedReceiver<WidgetView>,
    }

    impl Harness {
        fn new(config: SyncConfig) -> Self {
            let source = Arc::new(RecordingSource::default());
            let connector = Arc::new(ScriptedConnector::default());
            let (renderer, views) = ChannelRenderer::new();
            let context = Arc::new(SyncContext::new(
                config,
                Arc::clone(&source) as Arc<dyn QuoteSource>,
                Arc::clone(&connector) as Arc<dyn StreamConnector>,
                Arc::new(MemorySessionStore::with_token("tok")),
                Arc::new(renderer) as Arc<dyn WidgetRenderer>,
            ));
            Self {
                context,
                source,
                connector,
                views,
            }
        }

        fn last_view(&mut self) -> Option<WidgetView> {
            let mut last = None;
            while let Ok(view) = self.views.try_recv() {
                last = Some(view);
            }
            last
        }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            batch_window: Duration::from_millis(10),
            refresh_interval: Duration::from_millis(15_000),
            cache_ttl: Duration::from_millis(5_000),
            ..SyncConfig::default()
        }
    }

    fn args(symbol: &str) -> MountWidgetArgs {
        MountWidgetArgs {
            symbol: symbol.to_string(),
            ..MountWidgetArgs::default()
        }
    }

    fn sleep_ms(ms: u64) -> tokio::time::Sleep {
        tokio::time::sleep(Duration::from_millis(ms))
    }

    #[test]
    fn normalize_rejects_lazy_without_rect_and_bad_interval() {
        let lazy = MountWidgetArgs {
            lazy: Some(true),
            ..args("AAPL")
        };
        assert!(lazy.normalize().is_err());

        let fast = MountWidgetArgs {
            refresh_interval_ms: Some(10),
            ..args("AAPL")
        };
        assert!(fast.normalize().is_err());

        let mount = args(" msft ").normalize().expect("valid args");
        assert_eq!(mount.symbol, "MSFT");
        assert_eq!(mount.variant, DisplayVariant::Ticker);
    }

    #[tokio::test(start_paused = true)]
    async fn eager_widget_hydrates_and_follows_pushes() {
        let mut harness = Harness::new(test_config());
        let server = harness.connector.script_open();

        let session = mount_widget(&harness.context, args("AAPL"))
            .await
            .expect("mount");
        sleep_ms(50).await;

        let loaded = harness.last_view().expect("loaded view");
        assert_eq!(loaded.state, WidgetState::Loaded);
        assert_eq!(loaded.quote.map(|quote| quote.price), Some(100.0));
        assert_eq!(
            harness.connector.urls(),
            vec!["wss://stream.example.invalid/ws/AAPL?token=tok".to_string()]
        );

        server
            .send(Ok(StreamFrame::Text(
                r#"{"type":"quote","ticker":"aapl","last":"101.5"}"#.to_string(),
            )))
            .expect("push");
        sleep_ms(1).await;

        let pushed = widget_view(&harness.context, session.widget_id).expect("view");
        assert_eq!(pushed.quote.map(|quote| quote.price), Some(101.5));
    }

    #[tokio::test(start_paused = true)]
    async fn widgets_on_one_symbol_share_a_channel_until_last_unmount() {
        let harness = Harness::new(test_config());
        let _server = harness.connector.script_open();

        let first = mount_widget(&harness.context, args("AAPL")).await.expect("mount");
        let second = mount_widget(&harness.context, args("AAPL")).await.expect("mount");
        sleep_ms(50).await;

        assert_eq!(harness.connector.connect_count(), 1);
        assert_eq!(harness.source.calls(), vec![vec!["AAPL".to_string()]]);
        let client = harness.context.streams.client("AAPL").expect("channel held");

        assert!(unmount_widget(&harness.context, first.widget_id));
        assert_eq!(harness.context.streams.consumer_count("AAPL"), 1);
        assert_eq!(client.state(), ConnectionState::Open);

        assert!(unmount_widget(&harness.context, second.widget_id));
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(!unmount_widget(&harness.context, second.widget_id));

        sleep_ms(60_000).await;
        assert_eq!(harness.source.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lazy_widget_waits_for_viewport() {
        let mut harness = Harness::new(test_config());
        let _server = harness.connector.script_open();
        let lazy = MountWidgetArgs {
            lazy: Some(true),
            rect: Some(Rect::new(0.0, 1_500.0, 300.0, 100.0)),
            ..args("TSLA")
        };

        let session = mount_widget(&harness.context, lazy).await.expect("mount");
        report_viewport(&harness.context, Rect::new(0.0, 0.0, 1_000.0, 800.0));
        sleep_ms(50).await;
        assert_eq!(harness.source.call_count(), 0);
        assert!(harness.last_view().is_none());

        report_element_rect(&harness.context, session.widget_id, Rect::new(0.0, 900.0, 300.0, 100.0))
            .expect("known widget");
        sleep_ms(50).await;

        assert_eq!(harness.source.call_count(), 1);
        let view = harness.last_view().expect("hydrated view");
        assert_eq!(view.state, WidgetState::Loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_refresh_stops_while_tab_hidden() {
        let config = SyncConfig {
            refresh_interval: Duration::from_millis(10_000),
            cache_ttl: Duration::from_millis(1_000),
            ..test_config()
        };
        let harness = Harness::new(config);
        let _server = harness.connector.script_open();

        mount_widget(&harness.context, args("NVDA")).await.expect("mount");
        sleep_ms(25_000).await;
        assert_eq!(harness.source.call_count(), 3);

        set_tab_visibility(&harness.context, false);
        sleep_ms(60_000).await;
        assert_eq!(harness.source.call_count(), 3);

        set_tab_visibility(&harness.context, true);
        sleep_ms(10_000).await;
        assert_eq!(harness.source.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_channel_marks_widget_disconnected() {
        let config = SyncConfig {
            reconnect: false,
            ..test_config()
        };
        let mut harness = Harness::new(config);

        let session = mount_widget(&harness.context, args("AMD")).await.expect("mount");
        sleep_ms(50).await;

        let view = harness.last_view().expect("rendered");
        assert_eq!(view.state, WidgetState::Loaded);
        assert!(view.disconnected);

        let _server = harness.connector.script_open();
        assert!(harness.context.streams.reconnect("AMD").expect("valid"));
        sleep_ms(10).await;
        assert!(!widget_view(&harness.context, session.widget_id)
            .expect("view")
            .disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_of_unknown_widget_is_rejected() {
        let harness = Harness::new(test_config());
        assert!(matches!(
            refresh_widget(&harness.context, 42).await,
            Err(SyncError::InvalidArgument(_))
        ));
        assert!(report_element_rect(&harness.context, 42, Rect::default()).is_err());
    }
}
