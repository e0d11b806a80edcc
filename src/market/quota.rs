use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::warn;

const QUOTA_CHANNEL_CAPACITY: usize = 64;

/// Client-visible side of the backend's rate limiting. The core relays it and
/// never interprets the numbers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSignal {
    pub plan: String,
    pub resource: String,
    pub usage: u64,
    pub limit: u64,
}

impl fmt::Display for QuotaSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "plan '{}' used {}/{} of '{}'",
            self.plan, self.usage, self.limit, self.resource
        )
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct QuotaSignalWire {
    #[serde(default, alias = "plan_name", alias = "planName")]
    pub plan: Option<String>,
    #[serde(default, alias = "resource_type", alias = "resourceType")]
    pub resource: Option<String>,
    #[serde(default, alias = "current_usage", alias = "currentUsage", alias = "current")]
    pub usage: Option<u64>,
    #[serde(default, alias = "max", alias = "quota")]
    pub limit: Option<u64>,
}

impl From<QuotaSignalWire> for QuotaSignal {
    fn from(value: QuotaSignalWire) -> Self {
        Self {
            plan: value.plan.unwrap_or_else(|| "unknown".to_string()),
            resource: value.resource.unwrap_or_else(|| "unknown".to_string()),
            usage: value.usage.unwrap_or_default(),
            limit: value.limit.unwrap_or_default(),
        }
    }
}

/// Decodes a 429 body. Anything unreadable still yields a signal so the
/// event is never swallowed.
pub fn parse_quota_body(body: &mut [u8]) -> QuotaSignal {
    match simd_json::serde::from_slice::<QuotaSignalWire>(body) {
        Ok(wire) => wire.into(),
        Err(error) => {
            warn!(%error, "quota response body is not a quota payload");
            QuotaSignalWire::default().into()
        }
    }
}

/// Process-wide fan-out of quota signals.
#[derive(Debug, Clone)]
pub struct QuotaBroadcaster {
    sender: broadcast::Sender<QuotaSignal>,
}

impl Default for QuotaBroadcaster {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(QUOTA_CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl QuotaBroadcaster {
    pub fn subscribe(&self) -> broadcast::Receiver<QuotaSignal> {
        self.sender.subscribe()
    }

    /// Returns how many listeners received the signal.
    pub fn publish(&self, signal: QuotaSignal) -> usize {
        warn!(%signal, "quota exceeded");
        self.sender.send(signal).unwrap_or(0)
    }
}
