use crate::error::SyncError;
use crate::market::batch::QuoteSource;
use crate::market::quota::parse_quota_body;
use crate::market::session::SessionStore;
use crate::market::stream::{FrameStream, StreamConnector, StreamFrame};
use crate::market::types::{parse_batch_payload, Quote};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

pub fn batch_endpoint(fetch_base_url: &str, symbols: &[String]) -> Result<Url, SyncError> {
    let mut endpoint = Url::parse(fetch_base_url)?;
    endpoint
        .query_pairs_mut()
        .append_pair("symbols", &symbols.join(","));
    Ok(endpoint)
}

pub fn stream_endpoint(
    stream_base_url: &str,
    channel: &str,
    auth_token: Option<&str>,
) -> Result<Url, SyncError> {
    let mut endpoint = Url::parse(stream_base_url)?;
    endpoint
        .path_segments_mut()
        .map_err(|_| {
            SyncError::InvalidArgument(format!("{stream_base_url} cannot carry a channel path"))
        })?
        .pop_if_empty()
        .push(channel);
    if let Some(token) = auth_token {
        endpoint.query_pairs_mut().append_pair("token", token);
    }
    Ok(endpoint)
}

/// Batched quote endpoint over HTTP.
pub struct HttpQuoteSource {
    client: Client,
    fetch_base_url: String,
    session: Arc<dyn SessionStore>,
}

impl HttpQuoteSource {
    pub fn new(client: Client, fetch_base_url: String, session: Arc<dyn SessionStore>) -> Self {
        Self {
            client,
            fetch_base_url,
            session,
        }
    }
}

#[async_trait]
impl QuoteSource for HttpQuoteSource {
    async fn fetch_quotes(&self, symbols: &[String]) -> Result<HashMap<String, Quote>, SyncError> {
        let endpoint = batch_endpoint(&self.fetch_base_url, symbols)?;
        let mut request = self.client.get(endpoint);
        if let Some(token) = self.session.auth_token().await? {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let mut body = response.bytes().await?.to_vec();
            return Err(SyncError::QuotaExceeded(parse_quota_body(&mut body)));
        }

        let response = response.error_for_status()?;
        let mut body = response.bytes().await?.to_vec();
        let quotes = parse_batch_payload(&mut body)?;
        debug!(requested = symbols.len(), returned = quotes.len(), "batch response decoded");
        Ok(quotes)
    }
}

/// WebSocket transport for push channels.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<FrameStream, SyncError> {
        let ws_config = WebSocketConfig {
            max_message_size: Some(16 << 20),
            max_frame_size: Some(4 << 20),
            ..Default::default()
        };

        let (stream, _) = connect_async_with_config(url, Some(ws_config), true).await?;
        let frames = stream.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(StreamFrame::Text(text))),
                Ok(Message::Binary(bytes)) => Some(Ok(StreamFrame::Binary(bytes))),
                Ok(Message::Close(_)) => Some(Ok(StreamFrame::Close)),
                Ok(_) => None,
                Err(error) => Some(Err(SyncError::from(error))),
            }
        });
        Ok(frames.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_endpoint_joins_symbols_with_commas() {
        let endpoint = batch_endpoint(
            "https://api.example.invalid/v1/quotes",
            &["AAPL".to_string(), "MSFT".to_string()],
        )
        .expect("endpoint should build");

        let symbols = endpoint
            .query_pairs()
            .find(|(key, _)| key == "symbols")
            .map(|(_, value)| value.into_owned());
        assert_eq!(symbols.as_deref(), Some("AAPL,MSFT"));
        assert_eq!(endpoint.path(), "/v1/quotes");
    }

    #[test]
    fn stream_endpoint_carries_channel_and_token() {
        let endpoint = stream_endpoint("wss://stream.example.invalid/ws", "AAPL", Some("t o+k"))
            .expect("endpoint should build");

        assert_eq!(endpoint.path(), "/ws/AAPL");
        let token = endpoint
            .query_pairs()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned());
        assert_eq!(token.as_deref(), Some("t o+k"));
    }

    #[test]
    fn stream_endpoint_tolerates_trailing_slash_and_missing_token() {
        let endpoint = stream_endpoint("ws://localhost:9000/", "BRK.B", None)
            .expect("endpoint should build");
        assert_eq!(endpoint.as_str(), "ws://localhost:9000/BRK.B");
    }
}
