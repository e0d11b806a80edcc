use crate::error::SyncError;
use crate::market::session::SessionStore;
use crate::market::stream::{StreamClient, StreamClientConfig, StreamConnector};
use crate::market::types::{normalize_symbol, StreamStatusSnapshot};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

struct Subscription {
    client: StreamClient,
    consumers: HashSet<u64>,
}

/// Registry of push channels, one client per channel shared by every
/// consumer that asked for it.
pub struct StreamHub {
    config: StreamClientConfig,
    connector: Arc<dyn StreamConnector>,
    session: Arc<dyn SessionStore>,
    channels: Mutex<BTreeMap<String, Subscription>>,
}

impl StreamHub {
    pub fn new(
        config: StreamClientConfig,
        connector: Arc<dyn StreamConnector>,
        session: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config,
            connector,
            session,
            channels: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn acquire(&self, channel: &str, consumer: u64) -> Result<StreamClient, SyncError> {
        let channel = normalize_symbol(channel)?;
        let mut channels = self.channels.lock();
        let subscription = channels.entry(channel.clone()).or_insert_with(|| {
            info!(%channel, "opening push channel");
            Subscription {
                client: StreamClient::new(
                    channel.clone(),
                    self.config.clone(),
                    Arc::clone(&self.connector),
                    Arc::clone(&self.session),
                ),
                consumers: HashSet::new(),
            }
        });
        subscription.consumers.insert(consumer);
        subscription.client.connect();
        debug!(%channel, consumer, consumers = subscription.consumers.len(), "channel acquired");
        Ok(subscription.client.clone())
    }

    /// Returns true when this was the last consumer and the channel closed.
    pub fn release(&self, channel: &str, consumer: u64) -> bool {
        let Ok(channel) = normalize_symbol(channel) else {
            return false;
        };
        let mut channels = self.channels.lock();
        let Some(subscription) = channels.get_mut(&channel) else {
            return false;
        };
        subscription.consumers.remove(&consumer);
        if !subscription.consumers.is_empty() {
            return false;
        }

        if let Some(subscription) = channels.remove(&channel) {
            subscription.client.disconnect();
        }
        info!(%channel, "last consumer left, push channel closed");
        true
    }

    pub fn consumer_count(&self, channel: &str) -> usize {
        normalize_symbol(channel)
            .ok()
            .and_then(|channel| {
                self.channels
                    .lock()
                    .get(&channel)
                    .map(|subscription| subscription.consumers.len())
            })
            .unwrap_or(0)
    }

    pub fn client(&self, channel: &str) -> Option<StreamClient> {
        let channel = normalize_symbol(channel).ok()?;
        self.channels
            .lock()
            .get(&channel)
            .map(|subscription| subscription.client.clone())
    }

    pub fn statuses(&self) -> Vec<StreamStatusSnapshot> {
        self.channels
            .lock()
            .values()
            .map(|subscription| subscription.client.status_snapshot())
            .collect()
    }

    /// Restarts a channel that gave up reconnecting. Returns false for
    /// channels nobody holds.
    pub fn reconnect(&self, channel: &str) -> Result<bool, SyncError> {
        let channel = normalize_symbol(channel)?;
        let client = self.client(&channel);
        match client {
            Some(client) => {
                client.connect();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn shutdown(&self) {
        let channels = std::mem::take(&mut *self.channels.lock());
        for (channel, subscription) in channels {
            debug!(%channel, "closing push channel on shutdown");
            subscription.client.disconnect();
        }
    }
}
