use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use simd_json::prelude::*;
use simd_json::OwnedValue;
use std::collections::HashMap;
use tracing::warn;

pub const QUOTE_MESSAGE_TYPE: &str = "quote";
pub const MAX_SYMBOL_LEN: usize = 32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatusSnapshot {
    pub state: ConnectionState,
    pub channel: String,
    pub reconnect_attempts: u32,
    /// Set once reconnection gave up; the channel needs an explicit reconnect.
    pub exhausted: bool,
    pub reason: Option<String>,
}

impl StreamStatusSnapshot {
    pub fn idle(channel: String) -> Self {
        Self {
            state: ConnectionState::Idle,
            channel,
            reconnect_attempts: 0,
            exhausted: false,
            reason: None,
        }
    }
}

/// Canonical market record. Every backend payload shape is mapped onto this
/// before anything else in the crate sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub change: Option<f64>,
    pub change_percent: Option<f64>,
    pub volume: Option<f64>,
    pub timestamp_ms: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireNumber {
    Number(f64),
    Text(String),
}

impl WireNumber {
    pub fn to_f64(&self) -> Result<f64, SyncError> {
        let value = match self {
            Self::Number(value) => *value,
            Self::Text(text) => text.trim().parse::<f64>()?,
        };
        if !value.is_finite() {
            return Err(SyncError::InvalidArgument(
                "numeric field must be finite".to_string(),
            ));
        }
        Ok(value)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct QuoteWire {
    #[serde(default, alias = "ticker")]
    pub symbol: Option<String>,
    #[serde(
        default,
        alias = "current_price",
        alias = "currentPrice",
        alias = "last",
        alias = "lastPrice"
    )]
    pub price: Option<WireNumber>,
    #[serde(default, alias = "price_change", alias = "priceChange")]
    pub change: Option<WireNumber>,
    #[serde(
        default,
        alias = "change_percent",
        alias = "changePercent",
        alias = "percent_change"
    )]
    pub change_pct: Option<WireNumber>,
    #[serde(default, alias = "vol")]
    pub volume: Option<WireNumber>,
    #[serde(
        default,
        alias = "ts",
        alias = "time",
        alias = "updated_at",
        alias = "updatedAt"
    )]
    pub timestamp: Option<WireNumber>,
}

fn optional_number(value: Option<WireNumber>) -> Result<Option<f64>, SyncError> {
    value.map(|number| number.to_f64()).transpose()
}

impl Quote {
    /// `fallback_symbol` covers payloads keyed by symbol that omit it in the body.
    pub fn from_wire(wire: QuoteWire, fallback_symbol: Option<&str>) -> Result<Self, SyncError> {
        let raw_symbol = wire
            .symbol
            .as_deref()
            .or(fallback_symbol)
            .ok_or_else(|| SyncError::InvalidArgument("quote payload has no symbol".to_string()))?;
        let symbol = normalize_symbol(raw_symbol)?;

        let price = wire
            .price
            .ok_or_else(|| SyncError::InvalidArgument(format!("quote for {symbol} has no price")))?
            .to_f64()?;
        if price < 0.0 {
            return Err(SyncError::InvalidArgument(format!(
                "quote for {symbol} has a negative price"
            )));
        }

        let volume = optional_number(wire.volume)?.map(|volume| volume.max(0.0));
        let timestamp_ms = optional_number(wire.timestamp)?.map(|ts| ts as i64);

        Ok(Self {
            symbol,
            price,
            change: optional_number(wire.change)?,
            change_percent: optional_number(wire.change_pct)?,
            volume,
            timestamp_ms,
        })
    }
}

pub fn normalize_symbol(raw: &str) -> Result<String, SyncError> {
    let symbol = raw.trim().to_ascii_uppercase();
    if symbol.is_empty() || symbol.len() > MAX_SYMBOL_LEN {
        return Err(SyncError::InvalidArgument(format!(
            "symbol must be 1 to {MAX_SYMBOL_LEN} characters"
        )));
    }
    if !symbol
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '^' | '=' | '/'))
    {
        return Err(SyncError::InvalidArgument(format!(
            "symbol '{symbol}' contains unsupported characters"
        )));
    }
    Ok(symbol)
}

fn parse_batch_entry(key: &str, entry: OwnedValue) -> Result<(String, Quote), SyncError> {
    let wire: QuoteWire = simd_json::serde::from_owned_value(entry)?;
    let quote = Quote::from_wire(wire, Some(key))?;
    Ok((normalize_symbol(key)?, quote))
}

/// Batched endpoint body: a JSON object keyed by symbol. Entries that fail to
/// normalize are skipped so the rest of the batch still resolves.
pub fn parse_batch_payload(payload: &mut [u8]) -> Result<HashMap<String, Quote>, SyncError> {
    let wire: HashMap<String, OwnedValue> = simd_json::serde::from_slice(payload)?;
    let mut quotes = HashMap::with_capacity(wire.len());
    for (key, entry) in wire {
        match parse_batch_entry(&key, entry) {
            Ok((symbol, quote)) => {
                quotes.insert(symbol, quote);
            }
            Err(error) => warn!(%key, %error, "skipping malformed batch entry"),
        }
    }
    Ok(quotes)
}

/// One inbound push frame, dispatched by its `type` field.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub kind: String,
    pub body: OwnedValue,
}

impl StreamMessage {
    pub fn quote(&self) -> Result<Quote, SyncError> {
        let wire: QuoteWire = simd_json::serde::from_owned_value(self.body.clone())
            .map_err(|error| SyncError::MessageParse(error.to_string()))?;
        Quote::from_wire(wire, None)
    }
}

pub fn parse_stream_frame(payload: &mut [u8]) -> Result<StreamMessage, SyncError> {
    let body = simd_json::to_owned_value(payload)
        .map_err(|error| SyncError::MessageParse(error.to_string()))?;
    let kind = body
        .get("type")
        .and_then(|kind| kind.as_str())
        .map(str::to_string)
        .ok_or_else(|| SyncError::MessageParse("frame has no string 'type' field".to_string()))?;
    Ok(StreamMessage { kind, body })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DisplayVariant {
    #[default]
    Ticker,
    Compact,
    Detailed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WidgetState {
    Idle,
    Loading,
    Loaded,
    Error,
}

impl WidgetState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Error => "error",
        }
    }

    pub fn can_transition_to(self, next: WidgetState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Loading)
                | (Self::Loading, Self::Loaded)
                | (Self::Loading, Self::Error)
                | (Self::Loaded, Self::Loading)
                | (Self::Error, Self::Loading)
                // push updates land directly on a rendered widget
                | (Self::Loaded, Self::Loaded)
                | (Self::Error, Self::Loaded)
        )
    }
}

/// What the host draws for one widget.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WidgetView {
    pub widget_id: u64,
    pub symbol: String,
    pub variant: DisplayVariant,
    pub state: WidgetState,
    pub quote: Option<Quote>,
    pub stale: bool,
    pub disconnected: bool,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_alternate_backend_field_names() {
        let mut payload = br#"{
            "aapl": {"ticker":"aapl","current_price":"189.5","price_change":-1.25,"percent_change":"-0.66","vol":1200},
            "MSFT": {"symbol":"MSFT","price":410.1,"changePercent":0.4,"ts":1735000000000}
        }"#
        .to_vec();

        let quotes = parse_batch_payload(&mut payload).expect("batch payload should parse");

        let apple = quotes.get("AAPL").expect("AAPL keyed by normalized symbol");
        assert_eq!(apple.symbol, "AAPL");
        assert_eq!(apple.price, 189.5);
        assert_eq!(apple.change, Some(-1.25));
        assert_eq!(apple.change_percent, Some(-0.66));
        assert_eq!(apple.volume, Some(1200.0));

        let microsoft = quotes.get("MSFT").expect("MSFT present");
        assert_eq!(microsoft.timestamp_ms, Some(1_735_000_000_000));
    }

    #[test]
    fn batch_entry_without_symbol_uses_its_key() {
        let mut payload = br#"{"tsla":{"price":250}}"#.to_vec();
        let quotes = parse_batch_payload(&mut payload).expect("payload should parse");
        assert_eq!(quotes["TSLA"].symbol, "TSLA");
    }

    #[test]
    fn malformed_entry_is_skipped_and_siblings_survive() {
        let mut payload =
            br#"{"AAPL":{"price":190.1},"MSFT":{"price":"n/a"},"TSLA":{"price":{"nested":1}}}"#
                .to_vec();
        let quotes = parse_batch_payload(&mut payload).expect("body is still a valid object");

        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes["AAPL"].price, 190.1);
        assert!(!quotes.contains_key("MSFT"));
        assert!(!quotes.contains_key("TSLA"));
    }

    #[test]
    fn rejects_body_that_is_not_an_object() {
        let mut payload = br#"[{"symbol":"AAPL","price":1}]"#.to_vec();
        assert!(parse_batch_payload(&mut payload).is_err());
    }

    #[test]
    fn rejects_symbols_with_unsupported_characters() {
        assert!(normalize_symbol("  ").is_err());
        assert!(normalize_symbol("AA PL").is_err());
        assert_eq!(normalize_symbol(" brk.b ").expect("valid"), "BRK.B");
        assert_eq!(normalize_symbol("^gspc").expect("valid"), "^GSPC");
    }

    #[test]
    fn parses_stream_frame_by_type() {
        let mut payload = br#"{"type":"quote","symbol":"aapl","last":190.0}"#.to_vec();
        let message = parse_stream_frame(&mut payload).expect("frame should parse");

        assert_eq!(message.kind, QUOTE_MESSAGE_TYPE);
        let quote = message.quote().expect("quote body should normalize");
        assert_eq!(quote.symbol, "AAPL");
        assert_eq!(quote.price, 190.0);
    }

    #[test]
    fn stream_frame_without_type_is_a_parse_error() {
        let mut payload = br#"{"symbol":"AAPL"}"#.to_vec();
        let error = parse_stream_frame(&mut payload).expect_err("missing type must fail");
        assert!(matches!(error, SyncError::MessageParse(_)));

        let mut garbage = b"{not json".to_vec();
        assert!(matches!(
            parse_stream_frame(&mut garbage),
            Err(SyncError::MessageParse(_))
        ));
    }

    #[test]
    fn widget_transitions_follow_lifecycle() {
        assert!(WidgetState::Idle.can_transition_to(WidgetState::Loading));
        assert!(WidgetState::Loading.can_transition_to(WidgetState::Error));
        assert!(WidgetState::Error.can_transition_to(WidgetState::Loading));
        assert!(!WidgetState::Idle.can_transition_to(WidgetState::Loaded));
        assert!(!WidgetState::Loaded.can_transition_to(WidgetState::Idle));
    }
}
