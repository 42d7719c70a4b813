//! Two-tier read-through cache over ledger reads.
//!
//! ```text
//!   get_or_load(key)
//!        │
//!        ├─► HotspotDetector::record_access
//!        │
//!        ├─► local tier (moka) ──hit──► return
//!        │
//!        ├─► shared tier ──hit──► [hot: fill local] ──► return
//!        │      (errors degrade to a miss)
//!        │
//!        └─► loader (ledger) ──► fill shared ──► [hot: fill local] ──► return
//! ```
//!
//! Entries are never updated in place; writers call [`CacheTier::invalidate`].
//! Each key carries an invalidation epoch: a refill that observes a bumped
//! epoch after populating deletes what it wrote, so a snapshot read before an
//! invalidation cannot outlive it.

mod local;
mod shared;

pub use local::{LocalCache, LocalCacheStats};
pub use shared::{InMemorySharedCache, SharedCache};

use crate::config::CacheTierConfig;
use crate::error::Result;
use crate::hotspot::HotspotDetector;
use crate::types::{ShardKey, StockCounters};
use bytes::Bytes;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Counters describing cache tier behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheTierStats {
    pub local_hits: u64,
    pub local_misses: u64,
    pub local_entries: u64,
    pub shared_hits: u64,
    pub shared_misses: u64,
    pub shared_errors: u64,
    pub loads: u64,
    pub invalidations: u64,
}

/// Local + shared read-through cache of shard snapshots.
pub struct CacheTier {
    local: LocalCache,
    shared: Arc<dyn SharedCache>,
    hotspot: Arc<HotspotDetector>,
    config: CacheTierConfig,
    epochs: DashMap<ShardKey, u64>,
    shared_hits: AtomicU64,
    shared_misses: AtomicU64,
    shared_errors: AtomicU64,
    loads: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheTier {
    /// Create a cache tier.
    pub fn new(
        config: CacheTierConfig,
        shared: Arc<dyn SharedCache>,
        hotspot: Arc<HotspotDetector>,
    ) -> Self {
        Self {
            local: LocalCache::new(&config),
            shared,
            hotspot,
            config,
            epochs: DashMap::new(),
            shared_hits: AtomicU64::new(0),
            shared_misses: AtomicU64::new(0),
            shared_errors: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Get the hotspot detector.
    pub fn hotspot(&self) -> &Arc<HotspotDetector> {
        &self.hotspot
    }

    /// Get the local tier.
    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    /// Read a snapshot, loading it with `load` on a miss in both tiers.
    pub async fn get_or_load<F, Fut>(&self, key: &ShardKey, load: F) -> Result<StockCounters>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StockCounters>>,
    {
        let hot = self.hotspot.record_access(key);

        if let Some(value) = self.local.get(key).await {
            return Ok(value);
        }

        let epoch = self.epoch(key);
        let cache_key = key.cache_key();

        match self.shared.get(&cache_key).await {
            Ok(Some(bytes)) => match bincode::deserialize::<StockCounters>(&bytes) {
                Ok(value) => {
                    self.shared_hits.fetch_add(1, Ordering::Relaxed);
                    if hot {
                        self.local.insert(*key, value).await;
                        if self.epoch(key) != epoch {
                            self.local.invalidate(key).await;
                        }
                    }
                    return Ok(value);
                }
                Err(e) => {
                    self.shared_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(shard = %key, error = %e, "Discarding undecodable shared cache entry");
                }
            },
            Ok(None) => {
                self.shared_misses.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.shared_errors.fetch_add(1, Ordering::Relaxed);
                warn!(shard = %key, error = %e, "Shared cache unavailable, reading through");
            }
        }

        let value = load().await?;
        self.loads.fetch_add(1, Ordering::Relaxed);

        match bincode::serialize(&value) {
            Ok(encoded) => {
                if let Err(e) = self
                    .shared
                    .set(&cache_key, Bytes::from(encoded), self.config.shared_ttl)
                    .await
                {
                    self.shared_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(shard = %key, error = %e, "Failed to populate shared cache");
                }
            }
            Err(e) => warn!(shard = %key, error = %e, "Failed to encode shard snapshot"),
        }

        if hot {
            self.local.insert(*key, value).await;
        }

        if self.epoch(key) != epoch {
            debug!(shard = %key, "Refill raced with invalidation, dropping cached snapshot");
            self.evict(key, &cache_key).await;
        }

        Ok(value)
    }

    /// Drop `key` from both tiers after a write.
    ///
    /// Shared tier failures are logged, not returned: the entry then lives
    /// at most until its TTL.
    pub async fn invalidate(&self, key: &ShardKey) {
        *self.epochs.entry(*key).or_insert(0) += 1;
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        self.evict(key, &key.cache_key()).await;
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheTierStats {
        let local = self.local.stats();
        CacheTierStats {
            local_hits: local.hits,
            local_misses: local.misses,
            local_entries: local.entry_count,
            shared_hits: self.shared_hits.load(Ordering::Relaxed),
            shared_misses: self.shared_misses.load(Ordering::Relaxed),
            shared_errors: self.shared_errors.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    fn epoch(&self, key: &ShardKey) -> u64 {
        self.epochs.get(key).map(|e| *e).unwrap_or(0)
    }

    async fn evict(&self, key: &ShardKey, cache_key: &str) {
        self.local.invalidate(key).await;
        if let Err(e) = self.shared.delete(cache_key).await {
            self.shared_errors.fetch_add(1, Ordering::Relaxed);
            warn!(shard = %key, error = %e, "Failed to invalidate shared cache entry");
        }
    }
}

impl std::fmt::Debug for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheTier")
            .field("local", &self.local)
            .field("shared", &self.shared)
            .field("tracked_epochs", &self.epochs.len())
            .finish()
    }
}
