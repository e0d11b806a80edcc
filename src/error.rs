use crate::market::quota::QuotaSignal;
use serde::ser::Serializer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("message parse error: {0}")]
    MessageParse(String),
    #[error("fetch error: {0}")]
    Fetch(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(QuotaSignal),
    #[error("symbol {0} missing from batch response")]
    MissingSymbol(String),
    #[error("request cancelled before it settled")]
    Cancelled,
    #[error("invalid widget transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("float parse error: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
}

impl SyncError {
    /// Copy of this error that can be handed to every caller of a failed batch.
    /// Quota signals keep their kind; everything else collapses into `Fetch`.
    pub fn for_batch_callers(&self) -> SyncError {
        match self {
            Self::QuotaExceeded(signal) => Self::QuotaExceeded(signal.clone()),
            Self::Fetch(reason) => Self::Fetch(reason.clone()),
            Self::Cancelled => Self::Cancelled,
            other => Self::Fetch(other.to_string()),
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl serde::Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_copy_keeps_quota_kind() {
        let signal = QuotaSignal {
            plan: "free".to_string(),
            resource: "quotes".to_string(),
            usage: 100,
            limit: 100,
        };
        let copied = SyncError::QuotaExceeded(signal.clone()).for_batch_callers();
        assert!(copied.is_quota());

        let copied = SyncError::ParseFloat("x".parse::<f64>().unwrap_err()).for_batch_callers();
        assert!(matches!(copied, SyncError::Fetch(_)));
    }
}
