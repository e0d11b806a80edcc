use crate::error::SyncError;
use crate::market::visibility::RootMargin;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_RECONNECT: bool = true;
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_CACHE_TTL_MS: u64 = 30_000;
pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 200;
pub const DEFAULT_BATCH_WINDOW_MS: u64 = 50;
pub const DEFAULT_LAZY_LOAD_ROOT_MARGIN: &str = "200px";
pub const DEFAULT_LAZY_LOAD_THRESHOLD: f64 = 0.1;
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_STREAM_BASE_URL: &str = "wss://stream.example.invalid/ws";
pub const DEFAULT_FETCH_BASE_URL: &str = "https://api.example.invalid/v1/quotes";
pub const MIN_RECONNECT_INTERVAL_MS: u64 = 100;
pub const MAX_RECONNECT_INTERVAL_MS: u64 = 300_000;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 100;
pub const MIN_CACHE_TTL_MS: u64 = 1;
pub const MAX_CACHE_TTL_MS: u64 = 86_400_000;
pub const MIN_CACHE_ENTRIES: usize = 1;
pub const MAX_CACHE_ENTRIES: usize = 100_000;
pub const MAX_BATCH_WINDOW_MS: u64 = 10_000;
pub const MIN_REFRESH_INTERVAL_MS: u64 = 1_000;
pub const MAX_REFRESH_INTERVAL_MS: u64 = 3_600_000;

const ENV_PREFIX: &str = "MARKET_SYNC_";

/// Raw options as a host hands them over; every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfigArgs {
    pub reconnect: Option<bool>,
    pub reconnect_interval_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub cache_ttl_ms: Option<u64>,
    pub max_cache_entries: Option<usize>,
    pub batch_window_ms: Option<u64>,
    pub lazy_load_root_margin: Option<String>,
    pub lazy_load_threshold: Option<f64>,
    pub refresh_interval_ms: Option<u64>,
    pub stream_base_url: Option<String>,
    pub fetch_base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub reconnect: bool,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub cache_ttl: Duration,
    pub max_cache_entries: usize,
    pub batch_window: Duration,
    pub lazy_load_root_margin: RootMargin,
    pub lazy_load_threshold: f64,
    pub refresh_interval: Duration,
    pub stream_base_url: String,
    pub fetch_base_url: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect: DEFAULT_RECONNECT,
            reconnect_interval: Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            cache_ttl: Duration::from_millis(DEFAULT_CACHE_TTL_MS),
            max_cache_entries: DEFAULT_MAX_CACHE_ENTRIES,
            batch_window: Duration::from_millis(DEFAULT_BATCH_WINDOW_MS),
            lazy_load_root_margin: RootMargin::uniform_px(200.0),
            lazy_load_threshold: DEFAULT_LAZY_LOAD_THRESHOLD,
            refresh_interval: Duration::from_millis(DEFAULT_REFRESH_INTERVAL_MS),
            stream_base_url: DEFAULT_STREAM_BASE_URL.to_string(),
            fetch_base_url: DEFAULT_FETCH_BASE_URL.to_string(),
        }
    }
}

fn env_value<T: FromStr>(name: &str) -> Result<Option<T>, SyncError> {
    let key = format!("{ENV_PREFIX}{name}");
    match std::env::var(&key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| SyncError::InvalidArgument(format!("{key} has an invalid value"))),
        _ => Ok(None),
    }
}

fn validate_base_url(name: &str, raw: &str, schemes: &[&str]) -> Result<String, SyncError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let parsed = url::Url::parse(trimmed)?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(SyncError::InvalidArgument(format!(
            "{name} must use one of the schemes {schemes:?}"
        )));
    }
    Ok(trimmed.to_string())
}

impl SyncConfigArgs {
    pub fn from_json_slice(payload: &mut [u8]) -> Result<Self, SyncError> {
        Ok(simd_json::serde::from_slice(payload)?)
    }

    /// Fields set in `MARKET_SYNC_*` variables replace the current values.
    pub fn with_env_overrides(mut self) -> Result<Self, SyncError> {
        if let Some(value) = env_value("RECONNECT")? {
            self.reconnect = Some(value);
        }
        if let Some(value) = env_value("RECONNECT_INTERVAL_MS")? {
            self.reconnect_interval_ms = Some(value);
        }
        if let Some(value) = env_value("MAX_RECONNECT_ATTEMPTS")? {
            self.max_reconnect_attempts = Some(value);
        }
        if let Some(value) = env_value("CACHE_TTL_MS")? {
            self.cache_ttl_ms = Some(value);
        }
        if let Some(value) = env_value("MAX_CACHE_ENTRIES")? {
            self.max_cache_entries = Some(value);
        }
        if let Some(value) = env_value("BATCH_WINDOW_MS")? {
            self.batch_window_ms = Some(value);
        }
        if let Some(value) = env_value("LAZY_LOAD_ROOT_MARGIN")? {
            self.lazy_load_root_margin = Some(value);
        }
        if let Some(value) = env_value("LAZY_LOAD_THRESHOLD")? {
            self.lazy_load_threshold = Some(value);
        }
        if let Some(value) = env_value("REFRESH_INTERVAL_MS")? {
            self.refresh_interval_ms = Some(value);
        }
        if let Some(value) = env_value("STREAM_BASE_URL")? {
            self.stream_base_url = Some(value);
        }
        if let Some(value) = env_value("FETCH_BASE_URL")? {
            self.fetch_base_url = Some(value);
        }
        Ok(self)
    }

    pub fn from_env() -> Result<Self, SyncError> {
        Self::default().with_env_overrides()
    }

    pub fn normalize(self) -> Result<SyncConfig, SyncError> {
        let reconnect = self.reconnect.unwrap_or(DEFAULT_RECONNECT);

        let reconnect_interval_ms = self
            .reconnect_interval_ms
            .unwrap_or(DEFAULT_RECONNECT_INTERVAL_MS);
        if !(MIN_RECONNECT_INTERVAL_MS..=MAX_RECONNECT_INTERVAL_MS).contains(&reconnect_interval_ms)
        {
            return Err(SyncError::InvalidArgument(format!(
                "reconnectIntervalMs must be between {MIN_RECONNECT_INTERVAL_MS} and {MAX_RECONNECT_INTERVAL_MS}"
            )));
        }

        let max_reconnect_attempts = self
            .max_reconnect_attempts
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS);
        if max_reconnect_attempts > MAX_RECONNECT_ATTEMPTS {
            return Err(SyncError::InvalidArgument(format!(
                "maxReconnectAttempts must be at most {MAX_RECONNECT_ATTEMPTS}"
            )));
        }

        let cache_ttl_ms = self.cache_ttl_ms.unwrap_or(DEFAULT_CACHE_TTL_MS);
        if !(MIN_CACHE_TTL_MS..=MAX_CACHE_TTL_MS).contains(&cache_ttl_ms) {
            return Err(SyncError::InvalidArgument(format!(
                "cacheTtlMs must be between {MIN_CACHE_TTL_MS} and {MAX_CACHE_TTL_MS}"
            )));
        }

        let max_cache_entries = self.max_cache_entries.unwrap_or(DEFAULT_MAX_CACHE_ENTRIES);
        if !(MIN_CACHE_ENTRIES..=MAX_CACHE_ENTRIES).contains(&max_cache_entries) {
            return Err(SyncError::InvalidArgument(format!(
                "maxCacheEntries must be between {MIN_CACHE_ENTRIES} and {MAX_CACHE_ENTRIES}"
            )));
        }

        let batch_window_ms = self.batch_window_ms.unwrap_or(DEFAULT_BATCH_WINDOW_MS);
        if batch_window_ms > MAX_BATCH_WINDOW_MS {
            return Err(SyncError::InvalidArgument(format!(
                "batchWindowMs must be at most {MAX_BATCH_WINDOW_MS}"
            )));
        }

        let lazy_load_root_margin = RootMargin::parse(
            self.lazy_load_root_margin
                .as_deref()
                .unwrap_or(DEFAULT_LAZY_LOAD_ROOT_MARGIN),
        )?;

        let lazy_load_threshold = self
            .lazy_load_threshold
            .unwrap_or(DEFAULT_LAZY_LOAD_THRESHOLD);
        if !lazy_load_threshold.is_finite() || !(0.0..=1.0).contains(&lazy_load_threshold) {
            return Err(SyncError::InvalidArgument(
                "lazyLoadThreshold must be between 0 and 1".to_string(),
            ));
        }

        let refresh_interval_ms = self
            .refresh_interval_ms
            .unwrap_or(DEFAULT_REFRESH_INTERVAL_MS);
        if !(MIN_REFRESH_INTERVAL_MS..=MAX_REFRESH_INTERVAL_MS).contains(&refresh_interval_ms) {
            return Err(SyncError::InvalidArgument(format!(
                "refreshIntervalMs must be between {MIN_REFRESH_INTERVAL_MS} and {MAX_REFRESH_INTERVAL_MS}"
            )));
        }

        let stream_base_url = validate_base_url(
            "streamBaseUrl",
            self.stream_base_url
                .as_deref()
                .unwrap_or(DEFAULT_STREAM_BASE_URL),
            &["ws", "wss", "http", "https"],
        )?;
        let fetch_base_url = validate_base_url(
            "fetchBaseUrl",
            self.fetch_base_url
                .as_deref()
                .unwrap_or(DEFAULT_FETCH_BASE_URL),
            &["http", "https"],
        )?;

        Ok(SyncConfig {
            reconnect,
            reconnect_interval: Duration::from_millis(reconnect_interval_ms),
            max_reconnect_attempts,
            cache_ttl: Duration::from_millis(cache_ttl_ms),
            max_cache_entries,
            batch_window: Duration::from_millis(batch_window_ms),
            lazy_load_root_margin,
            lazy_load_threshold,
            refresh_interval: Duration::from_millis(refresh_interval_ms),
            stream_base_url,
            fetch_base_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_defaults() {
        let config = SyncConfigArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.reconnect, DEFAULT_RECONNECT);
        assert_eq!(
            config.reconnect_interval,
            Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS)
        );
        assert_eq!(config.max_reconnect_attempts, DEFAULT_MAX_RECONNECT_ATTEMPTS);
        assert_eq!(config.cache_ttl, Duration::from_millis(DEFAULT_CACHE_TTL_MS));
        assert_eq!(config.max_cache_entries, DEFAULT_MAX_CACHE_ENTRIES);
        assert_eq!(
            config.batch_window,
            Duration::from_millis(DEFAULT_BATCH_WINDOW_MS)
        );
        assert_eq!(config.lazy_load_root_margin, RootMargin::uniform_px(200.0));
        assert_eq!(config.lazy_load_threshold, DEFAULT_LAZY_LOAD_THRESHOLD);
        assert_eq!(config.stream_base_url, DEFAULT_STREAM_BASE_URL);
        assert_eq!(config.fetch_base_url, DEFAULT_FETCH_BASE_URL);
    }

    #[test]
    fn parses_camel_case_json_options() {
        let mut payload = br#"{
            "reconnect": false,
            "reconnectIntervalMs": 5000,
            "maxReconnectAttempts": 5,
            "cacheTtlMs": 5000,
            "maxCacheEntries": 2,
            "batchWindowMs": 100,
            "lazyLoadRootMargin": "50px 0px",
            "lazyLoadThreshold": 0.25,
            "fetchBaseUrl": "http://localhost:8080/quotes/"
        }"#
        .to_vec();

        let config = SyncConfigArgs::from_json_slice(&mut payload)
            .expect("json options should parse")
            .normalize()
            .expect("options should be valid");

        assert!(!config.reconnect);
        assert_eq!(config.max_cache_entries, 2);
        assert_eq!(config.batch_window, Duration::from_millis(100));
        assert_eq!(config.lazy_load_threshold, 0.25);
        assert_eq!(config.fetch_base_url, "http://localhost:8080/quotes");
    }

    #[test]
    fn validates_reconnect_interval_range() {
        let result = SyncConfigArgs {
            reconnect_interval_ms: Some(10),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn validates_threshold_range() {
        let result = SyncConfigArgs {
            lazy_load_threshold: Some(1.5),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn validates_cache_capacity() {
        let result = SyncConfigArgs {
            max_cache_entries: Some(0),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_fetch_url_with_websocket_scheme() {
        let result = SyncConfigArgs {
            fetch_base_url: Some("wss://api.example.invalid".to_string()),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_malformed_root_margin() {
        let result = SyncConfigArgs {
            lazy_load_root_margin: Some("wide".to_string()),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());
    }
}
