use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

pub fn quote_cache_key(symbol: &str) -> String {
    format!("quote:{}", symbol.trim().to_ascii_uppercase())
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub payload: T,
    pub inserted_at: Instant,
    pub ttl: Duration,
    generation: u64,
}

impl<T> CacheEntry<T> {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) < self.ttl
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<T> {
    pub payload: T,
    pub stale: bool,
}

/// Bounded TTL cache with first-in-first-out eviction.
///
/// Insertion order lives in `order`, separate from the map. Replacing a key
/// bumps its generation and appends a new order slot; the superseded slot is
/// skipped lazily during eviction, so eviction stays O(1) amortized.
#[derive(Debug)]
pub struct RequestCache<T> {
    entries: HashMap<String, CacheEntry<T>>,
    order: VecDeque<(String, u64)>,
    max_entries: usize,
    default_ttl: Duration,
    next_generation: u64,
}

impl<T: Clone> RequestCache<T> {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            entries: HashMap::with_capacity(max_entries),
            order: VecDeque::with_capacity(max_entries),
            max_entries,
            default_ttl,
            next_generation: 0,
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fresh-only read.
    pub fn get(&self, key: &str) -> Option<T> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<T> {
        self.entries
            .get(key)
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| entry.payload.clone())
    }

    /// Read that also returns stale values, flagged, for degraded rendering.
    pub fn get_any(&self, key: &str) -> Option<CacheRead<T>> {
        let now = Instant::now();
        self.entries.get(key).map(|entry| CacheRead {
            payload: entry.payload.clone(),
            stale: !entry.is_fresh(now),
        })
    }

    pub fn has_fresh(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|entry| entry.is_fresh(now))
            .unwrap_or(false)
    }

    pub fn insert(&mut self, key: String, payload: T) {
        let ttl = self.default_ttl;
        self.set(key, payload, ttl);
    }

    pub fn set(&mut self, key: String, payload: T, ttl: Duration) {
        self.set_at(key, payload, ttl, Instant::now());
    }

    pub fn set_at(&mut self, key: String, payload: T, ttl: Duration, now: Instant) {
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.max_entries {
                if !self.evict_oldest() {
                    break;
                }
            }
        }

        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        self.order.push_back((key.clone(), generation));
        self.entries.insert(
            key,
            CacheEntry {
                payload,
                inserted_at: now,
                ttl,
                generation,
            },
        );

        if self.order.len() > self.max_entries.saturating_mul(2) {
            self.compact_order();
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<T> {
        // the order slot becomes a tombstone and is skipped on eviction
        self.entries.remove(key).map(|entry| entry.payload)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Keys in eviction order, oldest first.
    pub fn keys_by_age(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|(key, generation)| self.is_live_slot(key, *generation))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn is_live_slot(&self, key: &str, generation: u64) -> bool {
        self.entries
            .get(key)
            .map(|entry| entry.generation == generation)
            .unwrap_or(false)
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((key, generation)) = self.order.pop_front() {
            if self.is_live_slot(&key, generation) {
                self.entries.remove(&key);
                return true;
            }
        }
        false
    }

    fn compact_order(&mut self) {
        let order = std::mem::take(&mut self.order);
        let live: VecDeque<(String, u64)> = order
            .into_iter()
            .filter(|(key, generation)| self.is_live_slot(key, *generation))
            .collect();
        self.order = live;
    }
}
