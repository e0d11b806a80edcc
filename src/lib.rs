pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod market;
pub mod state;

#[cfg(test)]
mod test_support;

pub use config::{SyncConfig, SyncConfigArgs};
pub use error::SyncError;
pub use state::SyncContext;

use commands::{
    market_stream::quota_events,
    widgets::{mount_widget, MountWidgetArgs},
};
use db::initialize_pool;
use market::hydrator::TracingRenderer;
use market::session::{SessionStore, SqliteSessionStore};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Runs a headless dashboard that keeps one ticker widget per symbol in sync
/// until `shutdown` resolves.
pub async fn run<F>(config: SyncConfig, symbols: Vec<String>, shutdown: F) -> Result<(), SyncError>
where
    F: Future<Output = ()>,
{
    let pool = initialize_pool().await?;
    let session: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(pool));
    let context = Arc::new(SyncContext::with_http(
        config,
        session,
        Arc::new(TracingRenderer),
    )?);

    for symbol in symbols {
        let mounted = mount_widget(
            &context,
            MountWidgetArgs {
                symbol,
                ..MountWidgetArgs::default()
            },
        )
        .await?;
        info!(widget_id = mounted.widget_id, symbol = %mounted.symbol, "tracking symbol");
    }

    let mut quota = quota_events(&context);
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = quota.recv() => match event {
                Ok(signal) => info!(%signal, "quota signal delivered"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "quota events lagged"),
                Err(RecvError::Closed) => {
                    (&mut shutdown).await;
                    break;
                }
            },
        }
    }

    context.shutdown();
    Ok(())
}
