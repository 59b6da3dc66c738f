//! Response cache for improved prompts
//!
//! Results are keyed by a fingerprint of `(model, system prompt, prompt)` where
//! the prompt is trimmed and lowercased, so re-selecting the same text with the
//! same settings never hits the provider twice.
//!
//! ## Expiry and eviction
//!
//! 1. **Lazy expiry**: an expired entry is dropped by the lookup that finds it
//! 2. **Periodic sweep**: [`spawn_sweeper`] runs [`ResponseCache::clean_expired`] on a timer
//! 3. **FIFO eviction**: when full, the oldest *inserted* entry goes first, however
//!    recently it was read

mod stats;

pub use stats::CacheStats;

use crate::settings::Settings;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Default time-to-live for an entry (1 hour)
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Default capacity
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// Default period of the background sweep (5 minutes)
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Shortest sweep period; shorter requests are raised to this
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for the response cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Time-to-live for new entries
    pub ttl: Duration,
    /// Maximum number of entries held at once
    pub max_entries: usize,
    /// Period of the background expiry sweep
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_entries: DEFAULT_MAX_ENTRIES,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Build the cache fingerprint for a prompt under the given settings.
///
/// Case and surrounding whitespace of the prompt are ignored; model and system
/// prompt are taken verbatim so different settings never share an entry.
pub fn generate_key(prompt: &str, settings: &Settings) -> String {
    let normalized = prompt.trim().to_lowercase();
    format!(
        "{}\u{1f}{}\u{1f}{}",
        settings.effective_model(),
        settings.system_prompt().unwrap_or_default(),
        normalized
    )
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    data: V,
    created_at: Instant,
    ttl: Duration,
    /// Insertion sequence, drives FIFO eviction
    seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

struct Inner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// seq -> key, oldest first
    order: BTreeMap<u64, String>,
    next_seq: u64,
    stats: CacheStats,
}

impl<V> Inner<V> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    fn evict_oldest(&mut self) {
        if let Some((_, key)) = self.order.pop_first() {
            self.entries.remove(&key);
            self.stats.record_eviction();
            debug!(key = %key, "Evicted oldest cache entry");
        }
    }
}

/// Bounded TTL cache of successful results
pub struct ResponseCache<V> {
    inner: Mutex<Inner<V>>,
    config: CacheConfig,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
                stats: CacheStats::default(),
            }),
            config,
        }
    }

    // No invariant spans a panic inside these short sections, so a poisoned
    // lock is still consistent.
    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached result for the prompt, if present and unexpired.
    pub fn get(&self, prompt: &str, settings: &Settings) -> Option<V> {
        let key = generate_key(prompt, settings);
        let mut inner = self.lock();
        let now = Instant::now();

        match inner.entries.get(&key).map(|entry| entry.is_expired(now)) {
            None => {
                inner.stats.record_miss();
                None
            }
            Some(true) => {
                inner.remove(&key);
                inner.stats.record_expiration();
                inner.stats.record_miss();
                debug!("Cache entry expired on lookup");
                None
            }
            Some(false) => {
                inner.stats.record_hit();
                inner.entries.get(&key).map(|entry| entry.data.clone())
            }
        }
    }

    /// Store a result with the configured TTL.
    pub fn set(&self, prompt: &str, settings: &Settings, data: V) {
        self.set_with_ttl(prompt, settings, data, self.config.ttl);
    }

    /// Store a result with an explicit TTL.
    ///
    /// A new key arriving at capacity evicts the oldest inserted entry first.
    /// Overwriting an existing key keeps its place in the eviction order.
    pub fn set_with_ttl(&self, prompt: &str, settings: &Settings, data: V, ttl: Duration) {
        let key = generate_key(prompt, settings);
        let mut inner = self.lock();
        let now = Instant::now();

        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.data = data;
            entry.created_at = now;
            entry.ttl = ttl;
            inner.stats.record_insert();
            return;
        }

        while inner.entries.len() >= self.config.max_entries.max(1) {
            inner.evict_oldest();
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, key.clone());
        inner.entries.insert(
            key,
            CacheEntry {
                data,
                created_at: now,
                ttl,
                seq,
            },
        );
        inner.stats.record_insert();
    }

    /// Drop the entry for this prompt. Returns whether one was present.
    pub fn invalidate(&self, prompt: &str, settings: &Settings) -> bool {
        let key = generate_key(prompt, settings);
        self.lock().remove(&key).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn clean_expired(&self) -> usize {
        let mut inner = self.lock();
        let now = Instant::now();

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if inner.remove(key).is_some() {
                inner.stats.record_expiration();
            }
        }

        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Whether an entry (expired or not) is currently held for the prompt.
    pub fn contains(&self, prompt: &str, settings: &Settings) -> bool {
        self.lock()
            .entries
            .contains_key(&generate_key(prompt, settings))
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats.clone()
    }
}

/// Run [`ResponseCache::clean_expired`] every `period` until the handle is aborted.
///
/// A period under [`MIN_SWEEP_INTERVAL`] is raised to it.
pub fn spawn_sweeper<V>(cache: Arc<ResponseCache<V>>, period: Duration) -> JoinHandle<()>
where
    V: Clone + Send + 'static,
{
    let period = period.max(MIN_SWEEP_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let removed = cache.clean_expired();
            if removed > 0 {
                debug!(removed, remaining = cache.len(), "Swept expired cache entries");
            }
        }
    })
}
