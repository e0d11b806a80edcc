use crate::market::session::SessionStore;
use crate::market::types::StreamStatusSnapshot;
use crate::state::SyncContext;
use serde::Serialize;
use std::time::Instant;

const HEALTH_PROBE_KEY: &str = "__health__";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub session_store: &'static str,
    pub cache_entries: usize,
    pub widgets: usize,
    pub channels: Vec<StreamStatusSnapshot>,
}

pub async fn session_store_status(session: &dyn SessionStore) -> &'static str {
    match session.read(HEALTH_PROBE_KEY).await {
        Ok(_) => "ok",
        Err(_) => "error",
    }
}

pub async fn build_health_response(started_at: Instant, context: &SyncContext) -> HealthResponse {
    let session_store = session_store_status(context.session.as_ref()).await;
    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        session_store,
        cache_entries: context.cache.lock().len(),
        widgets: context.widget_count(),
        channels: context.streams.statuses(),
    }
}

pub async fn health(context: &SyncContext) -> HealthResponse {
    build_health_response(context.started_at, context).await
}
