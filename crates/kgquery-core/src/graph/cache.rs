// Result Cache - bounded LRU store with per-entry TTL
// Values are opaque; TTL is checked lazily on read, there is no sweeper

use crate::error::QueryError;
use kgquery_common::config::CacheSettings;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries; values below 1 are treated as 1.
    pub capacity: usize,
    /// Entry lifetime; `Duration::ZERO` disables expiry.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheSettings::default().into()
    }
}

impl From<CacheSettings> for CacheConfig {
    fn from(settings: CacheSettings) -> Self {
        Self {
            capacity: settings.capacity,
            ttl: Duration::from_secs(settings.ttl_secs),
        }
    }
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    tick: u64,
}

/// Key map plus recency index. Both are only touched under the cache lock.
#[derive(Debug)]
struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// tick -> key, oldest first.
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<V> CacheState<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    // Drops every entry so that a detected inconsistency does not outlive
    // the call that found it.
    fn fault(&mut self, detail: String) -> QueryError {
        self.entries.clear();
        self.recency.clear();
        QueryError::CacheUnavailable(detail)
    }

    fn touch(&mut self, key: &str) -> Result<(), QueryError> {
        let tick = self.next_tick();
        let old = match self.entries.get_mut(key) {
            Some(entry) => std::mem::replace(&mut entry.tick, tick),
            None => return Err(self.fault(format!("entry '{}' vanished during promotion", key))),
        };
        if self.recency.remove(&old).is_none() {
            return Err(self.fault(format!("entry '{}' missing from recency index", key)));
        }
        self.recency.insert(tick, key.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<Option<CacheEntry<V>>, QueryError> {
        let Some(entry) = self.entries.remove(key) else {
            return Ok(None);
        };
        if self.recency.remove(&entry.tick).is_none() {
            return Err(self.fault(format!("entry '{}' missing from recency index", key)));
        }
        Ok(Some(entry))
    }

    fn pop_lru(&mut self) -> Result<Option<String>, QueryError> {
        let Some((_, key)) = self.recency.pop_first() else {
            return Ok(None);
        };
        if self.entries.remove(&key).is_none() {
            return Err(self.fault(format!("recency index points at unknown entry '{}'", key)));
        }
        Ok(Some(key))
    }
}

/// Thread-safe LRU cache with TTL and hit/miss accounting.
///
/// Every operation, including `stats`, runs under one lock, so counters are
/// always read as a consistent snapshot.
pub struct ResultCache<V> {
    state: Mutex<CacheState<V>>,
    capacity: usize,
    ttl: Duration,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState::new()),
            capacity: config.capacity.max(1),
            ttl: config.ttl,
        }
    }

    fn is_expired(&self, inserted_at: Instant) -> bool {
        !self.ttl.is_zero() && inserted_at.elapsed() > self.ttl
    }

    /// Returns a copy of the live value and promotes it to most recently used.
    /// Expired entries are removed and reported as a miss.
    pub async fn get(&self, key: &str) -> Result<Option<V>, QueryError> {
        let mut state = self.state.lock().await;

        let inserted_at = match state.entries.get(key) {
            Some(entry) => entry.inserted_at,
            None => {
                state.misses += 1;
                tracing::debug!("Cache MISS for {}", key);
                return Ok(None);
            }
        };

        if self.is_expired(inserted_at) {
            state.remove(key)?;
            state.misses += 1;
            state.expirations += 1;
            tracing::debug!("Cache entry expired: {}", key);
            return Ok(None);
        }

        state.touch(key)?;
        state.hits += 1;
        tracing::debug!("Cache HIT for {}", key);
        Ok(state.entries.get(key).map(|entry| entry.value.clone()))
    }

    /// Inserts or replaces, resetting recency and timestamp. Evicts the least
    /// recently used entry when the store goes over capacity.
    pub async fn set(&self, key: impl Into<String>, value: V) -> Result<(), QueryError> {
        let key = key.into();
        let mut state = self.state.lock().await;

        state.remove(&key)?;
        let tick = state.next_tick();
        state.recency.insert(tick, key.clone());
        state.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                tick,
            },
        );

        if state.entries.len() > self.capacity {
            if let Some(evicted) = state.pop_lru()? {
                state.evictions += 1;
                tracing::debug!("Evicted LRU cache entry: {}", evicted);
            }
        }
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<bool, QueryError> {
        let mut state = self.state.lock().await;
        Ok(state.remove(key)?.is_some())
    }

    /// Empties the store and the recency index. Counters are kept.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.recency.clear();
        tracing::info!("Cleared query result cache");
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        let total_requests = state.hits + state.misses;
        let hit_rate = if total_requests > 0 {
            state.hits as f64 / total_requests as f64
        } else {
            0.0
        };

        CacheStats {
            size: state.entries.len(),
            capacity: self.capacity,
            ttl_secs: self.ttl.as_secs(),
            hits: state.hits,
            misses: state.misses,
            hit_rate,
            total_requests,
            evictions: state.evictions,
            expirations: state.expirations,
        }
    }

    #[cfg(test)]
    pub(crate) async fn corrupt_recency_index(&self) {
        self.state.lock().await.recency.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub total_requests: u64,
    pub evictions: u64,
    pub expirations: u64,
}
