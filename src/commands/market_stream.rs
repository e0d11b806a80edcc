use crate::error::SyncError;
use crate::market::quota::QuotaSignal;
use crate::market::types::{Quote, StreamStatusSnapshot};
use crate::state::SyncContext;
use tokio::sync::broadcast;
use tracing::info;

pub fn stream_statuses(context: &SyncContext) -> Vec<StreamStatusSnapshot> {
    context.streams.statuses()
}

/// Restarts a push channel that exhausted its reconnect attempts.
pub fn reconnect_channel(context: &SyncContext, channel: &str) -> Result<bool, SyncError> {
    let restarted = context.streams.reconnect(channel)?;
    if restarted {
        info!(%channel, "channel reconnect requested");
    }
    Ok(restarted)
}

pub fn quota_events(context: &SyncContext) -> broadcast::Receiver<QuotaSignal> {
    context.quota.subscribe()
}

/// One-off quote lookup through the cache and batch window, outside any widget.
pub async fn request_quote(context: &SyncContext, symbol: &str) -> Result<Quote, SyncError> {
    context.batch.request(symbol).await
}
