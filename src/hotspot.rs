//! Windowed hotspot detection for shard keys.
//!
//! Every cached read records an access. A key read at least `threshold`
//! times within the current window is classified hot, which makes the cache
//! tier keep it in the local tier. Counters and classifications are cleared
//! when the window rolls over.

use crate::config::HotspotConfig;
use crate::types::ShardKey;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tracing::{debug, info};

/// Rolling per-key access counter.
pub struct HotspotDetector {
    config: HotspotConfig,
    counters: DashMap<ShardKey, u64>,
    hot: DashSet<ShardKey>,
    /// Clock origin for `window_start_ms`.
    base: Instant,
    /// Start of the current window, in ms since `base`. Read without
    /// locking; only a roll takes `rolling`.
    window_start_ms: AtomicU64,
    rolling: Mutex<()>,
    promotions: AtomicU64,
}

impl HotspotDetector {
    /// Create a detector with the given configuration.
    pub fn new(config: HotspotConfig) -> Self {
        Self {
            config,
            counters: DashMap::new(),
            hot: DashSet::new(),
            base: Instant::now(),
            window_start_ms: AtomicU64::new(0),
            rolling: Mutex::new(()),
            promotions: AtomicU64::new(0),
        }
    }

    /// Record one access to `key` and return whether it is hot.
    pub fn record_access(&self, key: &ShardKey) -> bool {
        if self.config.threshold == 0 {
            return true;
        }

        self.roll_if_elapsed();

        let count = {
            let mut entry = self.counters.entry(*key).or_insert(0);
            *entry += 1;
            *entry
        };

        if count < self.config.threshold {
            return self.hot.contains(key);
        }

        if self.hot.insert(*key) {
            self.promotions.fetch_add(1, Ordering::Relaxed);
            info!(
                shard = %key,
                accesses = count,
                window_secs = self.config.window.as_secs(),
                "Promoted hot shard key"
            );
        }
        true
    }

    /// Whether `key` is hot in the current window.
    pub fn is_hot(&self, key: &ShardKey) -> bool {
        self.config.threshold == 0 || self.hot.contains(key)
    }

    /// Accesses to `key` in the current window.
    pub fn access_count(&self, key: &ShardKey) -> u64 {
        self.counters.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Keys currently classified hot.
    pub fn hot_keys(&self) -> Vec<ShardKey> {
        self.hot.iter().map(|k| *k).collect()
    }

    /// Total promotions since creation.
    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    /// Start a new window immediately.
    pub fn rotate(&self) {
        let _rolling = self.rolling.lock();
        self.reset(self.now_ms());
    }

    fn roll_if_elapsed(&self) {
        let now = self.now_ms();
        if !self.window_elapsed(now) {
            return;
        }

        let _rolling = self.rolling.lock();
        // Another reader may have rolled while we waited.
        if self.window_elapsed(now) {
            self.reset(now);
        }
    }

    fn window_elapsed(&self, now_ms: u64) -> bool {
        let start = self.window_start_ms.load(Ordering::Acquire);
        now_ms.saturating_sub(start) >= self.config.window.as_millis() as u64
    }

    fn now_ms(&self) -> u64 {
        self.base.elapsed().as_millis() as u64
    }

    fn reset(&self, now_ms: u64) {
        let tracked = self.counters.len();
        let hot = self.hot.len();
        self.counters.clear();
        self.hot.clear();
        self.window_start_ms.store(now_ms, Ordering::Release);
        debug!(tracked, hot, "Hotspot window rolled over");
    }
}

impl std::fmt::Debug for HotspotDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotspotDetector")
            .field("config", &self.config)
            .field("tracked_keys", &self.counters.len())
            .field("hot_keys", &self.hot.len())
            .finish()
    }
}
