//! Configuration types for the inventory engine.

use crate::error::{Error, Result};
use std::time::Duration;

/// Main configuration for the inventory engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Shard routing and sizing.
    pub routing: RoutingConfig,

    /// Segment lock timeouts.
    pub lock: LockConfig,

    /// Two-tier cache configuration.
    pub cache: CacheTierConfig,

    /// Hotspot detection configuration.
    pub hotspot: HotspotConfig,

    /// Settlement pipeline configuration.
    pub settlement: SettlementConfig,

    /// How long a reservation stays live before it expires.
    pub reservation_ttl: Duration,

    /// Interval of the expired-reservation reaper.
    pub reaper_interval: Duration,

    /// Upper bound on the quantity of a single request.
    pub max_quantity_per_request: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            routing: RoutingConfig::default(),
            lock: LockConfig::default(),
            cache: CacheTierConfig::default(),
            hotspot: HotspotConfig::default(),
            settlement: SettlementConfig::default(),
            reservation_ttl: Duration::from_secs(600), // 10 minutes
            reaper_interval: Duration::from_secs(5),
            max_quantity_per_request: 100,
        }
    }
}

impl EngineConfig {
    /// Create a configuration splitting every ticket type into `shard_count` shards.
    pub fn new(shard_count: u32) -> Self {
        Self {
            routing: RoutingConfig::new(ShardSizing::Fixed(shard_count)),
            ..Default::default()
        }
    }

    /// Set routing configuration.
    pub fn with_routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    /// Set lock configuration.
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Set cache configuration.
    pub fn with_cache(mut self, cache: CacheTierConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set hotspot configuration.
    pub fn with_hotspot(mut self, hotspot: HotspotConfig) -> Self {
        self.hotspot = hotspot;
        self
    }

    /// Set settlement configuration.
    pub fn with_settlement(mut self, settlement: SettlementConfig) -> Self {
        self.settlement = settlement;
        self
    }

    /// Set reservation TTL.
    pub fn with_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = ttl;
        self
    }

    /// Set reaper interval.
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Set the per-request quantity ceiling.
    pub fn with_max_quantity_per_request(mut self, limit: u32) -> Self {
        self.max_quantity_per_request = limit;
        self
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        match self.routing.sizing {
            ShardSizing::Fixed(0) => {
                return Err(Error::Config("shard count must be positive".into()));
            }
            ShardSizing::Capacity { per_shard, max_shards } if per_shard == 0 || max_shards == 0 => {
                return Err(Error::Config(
                    "per-shard capacity and shard limit must be positive".into(),
                ));
            }
            _ => {}
        }
        if self.routing.physical_partitions == 0 {
            return Err(Error::Config("physical partitions must be positive".into()));
        }
        if self.lock.lease_timeout <= self.lock.wait_timeout / 2 {
            return Err(Error::Config(
                "lease timeout must comfortably exceed the lock wait".into(),
            ));
        }
        if self.lock.retry_interval.is_zero() {
            return Err(Error::Config("lock retry interval must be positive".into()));
        }
        if self.settlement.flush_interval.is_zero() {
            return Err(Error::Config("flush interval must be positive".into()));
        }
        if self.settlement.batch_threshold == 0 || self.settlement.channel_capacity == 0 {
            return Err(Error::Config(
                "batch threshold and channel capacity must be positive".into(),
            ));
        }
        if self.hotspot.window.is_zero() {
            return Err(Error::Config("hotspot window must be positive".into()));
        }
        if self.max_quantity_per_request == 0 {
            return Err(Error::Config("quantity limit must be positive".into()));
        }
        Ok(())
    }
}

/// How a ticket type's total is split into shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardSizing {
    /// Always split into this many shards.
    Fixed(u32),

    /// One shard per `per_shard` units, at most `max_shards` shards.
    Capacity { per_shard: u32, max_shards: u32 },
}

/// Shard routing configuration.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Shard sizing policy.
    pub sizing: ShardSizing,

    /// Number of physical storage partitions.
    pub physical_partitions: u32,

    /// Hash seed for the primary-shard mapping.
    pub hash_seed: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            sizing: ShardSizing::Fixed(20),
            physical_partitions: 16,
            hash_seed: 0x5EA7_0F_7AC0,
        }
    }
}

impl RoutingConfig {
    /// Create a routing config with the given sizing.
    pub fn new(sizing: ShardSizing) -> Self {
        Self {
            sizing,
            ..Default::default()
        }
    }

    /// Set the number of physical partitions.
    pub fn with_physical_partitions(mut self, partitions: u32) -> Self {
        self.physical_partitions = partitions;
        self
    }

    /// Set the hash seed.
    pub fn with_hash_seed(mut self, seed: u64) -> Self {
        self.hash_seed = seed;
        self
    }
}

/// Segment lock configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Maximum time to wait for one shard's lock.
    pub wait_timeout: Duration,

    /// Lease after which a held lock becomes reclaimable.
    pub lease_timeout: Duration,

    /// Polling interval while waiting on a networked lock.
    pub retry_interval: Duration,

    /// Overall budget for scanning shards during one acquisition.
    pub scan_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_millis(1000),
            lease_timeout: Duration::from_millis(5000),
            retry_interval: Duration::from_millis(10),
            scan_timeout: Duration::from_secs(3),
        }
    }
}

impl LockConfig {
    /// Set the wait timeout.
    pub fn with_wait_timeout(mut self, wait: Duration) -> Self {
        self.wait_timeout = wait;
        self
    }

    /// Set the lease timeout.
    pub fn with_lease_timeout(mut self, lease: Duration) -> Self {
        self.lease_timeout = lease;
        self
    }

    /// Set the scan timeout.
    pub fn with_scan_timeout(mut self, scan: Duration) -> Self {
        self.scan_timeout = scan;
        self
    }
}

/// Two-tier cache configuration.
#[derive(Debug, Clone)]
pub struct CacheTierConfig {
    /// Maximum number of entries in the local tier.
    pub local_max_capacity: u64,

    /// Time-to-live of local entries.
    pub local_ttl: Duration,

    /// Time-to-live of shared entries.
    pub shared_ttl: Duration,
}

impl Default for CacheTierConfig {
    fn default() -> Self {
        Self {
            local_max_capacity: 10_000,
            local_ttl: Duration::from_secs(30 * 60),
            shared_ttl: Duration::from_secs(300),
        }
    }
}

impl CacheTierConfig {
    /// Set local tier capacity.
    pub fn with_local_max_capacity(mut self, capacity: u64) -> Self {
        self.local_max_capacity = capacity;
        self
    }

    /// Set local tier TTL.
    pub fn with_local_ttl(mut self, ttl: Duration) -> Self {
        self.local_ttl = ttl;
        self
    }

    /// Set shared tier TTL.
    pub fn with_shared_ttl(mut self, ttl: Duration) -> Self {
        self.shared_ttl = ttl;
        self
    }
}

/// Hotspot detection configuration.
#[derive(Debug, Clone)]
pub struct HotspotConfig {
    /// Length of one detection window.
    pub window: Duration,

    /// Accesses within a window that make a key hot. Zero makes every key hot.
    pub threshold: u64,
}

impl Default for HotspotConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            threshold: 1000,
        }
    }
}

impl HotspotConfig {
    /// Create a hotspot config.
    pub fn new(window: Duration, threshold: u64) -> Self {
        Self { window, threshold }
    }
}

/// How `deduct` moves locked stock to sold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementMode {
    /// Apply the ledger update before returning.
    Immediate,

    /// Queue into the batch settlement pipeline.
    Batched,
}

/// Batch settlement configuration.
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Settlement mode used by `deduct`.
    pub mode: SettlementMode,

    /// Period of the flush timer.
    pub flush_interval: Duration,

    /// Buffer size that triggers a flush.
    pub batch_threshold: usize,

    /// Age of the oldest buffered event that forces a flush.
    pub max_linger: Duration,

    /// Capacity of the settlement queue.
    pub channel_capacity: usize,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            mode: SettlementMode::Immediate,
            flush_interval: Duration::from_millis(100),
            batch_threshold: 100,
            max_linger: Duration::from_secs(1),
            channel_capacity: 10_000,
        }
    }
}

impl SettlementConfig {
    /// Batched settlement with default timings.
    pub fn batched() -> Self {
        Self {
            mode: SettlementMode::Batched,
            ..Default::default()
        }
    }

    /// Set the flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the batch threshold.
    pub fn with_batch_threshold(mut self, threshold: usize) -> Self {
        self.batch_threshold = threshold;
        self
    }

    /// Set the maximum linger time.
    pub fn with_max_linger(mut self, linger: Duration) -> Self {
        self.max_linger = linger;
        self
    }

    /// Set the queue capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.routing.sizing, ShardSizing::Fixed(20));
        assert_eq!(config.routing.physical_partitions, 16);
        assert_eq!(config.settlement.mode, SettlementMode::Immediate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new(5)
            .with_lock(LockConfig::default().with_wait_timeout(Duration::from_millis(50)))
            .with_settlement(SettlementConfig::batched().with_batch_threshold(10))
            .with_reservation_ttl(Duration::from_secs(30));

        assert_eq!(config.routing.sizing, ShardSizing::Fixed(5));
        assert_eq!(config.lock.wait_timeout, Duration::from_millis(50));
        assert_eq!(config.settlement.mode, SettlementMode::Batched);
        assert_eq!(config.settlement.batch_threshold, 10);
        assert_eq!(config.reservation_ttl, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(EngineConfig::new(0).validate().is_err());

        let config = EngineConfig::default().with_routing(RoutingConfig::new(ShardSizing::Capacity {
            per_shard: 0,
            max_shards: 10,
        }));
        assert!(config.validate().is_err());

        let config = EngineConfig::default().with_lock(
            LockConfig::default()
                .with_wait_timeout(Duration::from_secs(10))
                .with_lease_timeout(Duration::from_secs(1)),
        );
        assert!(config.validate().is_err());

        let config = EngineConfig::default()
            .with_settlement(SettlementConfig::default().with_batch_threshold(0));
        assert!(config.validate().is_err());
    }
}
