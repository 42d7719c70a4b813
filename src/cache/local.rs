//! Process-local tier for hot shards, backed by moka.

use crate::config::CacheTierConfig;
use crate::types::{ShardKey, StockCounters};
use moka::future::Cache;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Local tier statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalCacheStats {
    pub entry_count: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Snapshots of hot shards, bounded by `local_max_capacity` and expired
/// after `local_ttl` regardless of invalidation.
pub struct LocalCache {
    snapshots: Cache<ShardKey, StockCounters>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LocalCache {
    pub fn new(config: &CacheTierConfig) -> Self {
        Self {
            snapshots: Cache::builder()
                .max_capacity(config.local_max_capacity)
                .time_to_live(config.local_ttl)
                .build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a shard snapshot, counting the hit or miss.
    pub async fn get(&self, shard: &ShardKey) -> Option<StockCounters> {
        let found = self.snapshots.get(shard).await;
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn contains(&self, shard: &ShardKey) -> bool {
        self.snapshots.contains_key(shard)
    }

    pub async fn insert(&self, shard: ShardKey, counters: StockCounters) {
        self.snapshots.insert(shard, counters).await;
    }

    pub async fn invalidate(&self, shard: &ShardKey) {
        self.snapshots.invalidate(shard).await;
    }

    /// Current statistics. `entry_count` lags until moka runs its
    /// housekeeping.
    pub fn stats(&self) -> LocalCacheStats {
        LocalCacheStats {
            entry_count: self.snapshots.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Apply pending evictions and refresh `entry_count`.
    pub async fn run_pending_tasks(&self) {
        self.snapshots.run_pending_tasks().await;
    }
}

impl fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCache")
            .field("entries", &self.snapshots.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn small() -> LocalCache {
        LocalCache::new(
            &CacheTierConfig::default()
                .with_local_max_capacity(100)
                .with_local_ttl(Duration::from_secs(60)),
        )
    }

    #[tokio::test]
    async fn test_insert_then_invalidate() {
        let cache = small();
        let shard = ShardKey::new(1, 1, 0);

        cache.insert(shard, StockCounters::initial(5)).await;
        assert_eq!(cache.get(&shard).await, Some(StockCounters::initial(5)));

        cache.invalidate(&shard).await;
        assert!(!cache.contains(&shard));
        assert_eq!(cache.get(&shard).await, None);
    }

    #[tokio::test]
    async fn test_hits_and_misses_counted() {
        let cache = small();
        let shard = ShardKey::new(1, 1, 0);
        cache.insert(shard, StockCounters::initial(5)).await;
        cache.run_pending_tasks().await;

        assert!(cache.get(&shard).await.is_some());
        assert!(cache.get(&ShardKey::new(1, 1, 1)).await.is_none());
        assert!(cache.get(&ShardKey::new(1, 1, 2)).await.is_none());

        assert_eq!(
            cache.stats(),
            LocalCacheStats {
                entry_count: 1,
                hits: 1,
                misses: 2,
            }
        );
    }
}
