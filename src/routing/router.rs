//! Deterministic mapping from buyers to stock shards.

use crate::config::{RoutingConfig, ShardSizing};
use crate::error::{Result, ValidationError};
use crate::types::{EventId, ShardId, UserId};
use std::fmt;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Physical location of a logical shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Physical storage partition.
    pub partition: u32,
    /// Logical shard within the ticket type.
    pub shard: ShardId,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inventory_db_{}.inventory_shard_{}",
            self.partition, self.shard
        )
    }
}

/// Routes buyers to shards.
///
/// The router is pure: the same inputs always produce the same shard for a
/// given configuration, so a sale must not change its shard count once
/// initialized.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    config: RoutingConfig,
}

impl ShardRouter {
    /// Create a new router.
    pub fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    /// Create with default config.
    pub fn with_defaults() -> Self {
        Self::new(RoutingConfig::default())
    }

    /// Get the routing configuration.
    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Hash a `(user, event)` pair.
    pub fn hash_pair(&self, user_id: UserId, event_id: EventId) -> u64 {
        let mut hasher = XxHash64::with_seed(self.config.hash_seed);
        user_id.hash(&mut hasher);
        event_id.hash(&mut hasher);
        hasher.finish()
    }

    /// Primary shard of a buyer for a ticket type with `shard_count` shards.
    pub fn primary_shard(&self, user_id: UserId, event_id: EventId, shard_count: u32) -> ShardId {
        if shard_count == 0 {
            return 0;
        }
        (self.hash_pair(user_id, event_id) % shard_count as u64) as ShardId
    }

    /// Shards in scan order: the primary shard first, then ascending with
    /// wrap-around. Every shard appears exactly once.
    pub fn scan_order(
        &self,
        user_id: UserId,
        event_id: EventId,
        shard_count: u32,
    ) -> impl Iterator<Item = ShardId> {
        let primary = self.primary_shard(user_id, event_id, shard_count);
        (0..shard_count).map(move |offset| (primary + offset) % shard_count)
    }

    /// Physical partition holding an event's data.
    pub fn partition_for(&self, event_id: EventId) -> u32 {
        (event_id % self.config.physical_partitions.max(1) as u64) as u32
    }

    /// Physical placement of a buyer's primary shard.
    pub fn placement(&self, user_id: UserId, event_id: EventId, shard_count: u32) -> Placement {
        Placement {
            partition: self.partition_for(event_id),
            shard: self.primary_shard(user_id, event_id, shard_count),
        }
    }

    /// Number of shards a ticket type with `total` units is split into.
    pub fn shard_count_for(&self, total: u64) -> Result<u32> {
        if total == 0 {
            return Err(ValidationError::EmptyStock.into());
        }
        match self.config.sizing {
            ShardSizing::Fixed(count) => Ok(count.min(clamp_u32(total))),
            ShardSizing::Capacity {
                per_shard,
                max_shards,
            } => {
                let per_shard = per_shard.max(1) as u64;
                let required = total.div_ceil(per_shard);
                if required > max_shards as u64 {
                    return Err(ValidationError::TooManyShards {
                        total,
                        required,
                        limit: max_shards,
                    }
                    .into());
                }
                Ok(required as u32)
            }
        }
    }

    /// Per-shard totals for a ticket type with `total` units.
    pub fn split(&self, total: u64) -> Result<Vec<u32>> {
        let count = self.shard_count_for(total)?;
        match self.config.sizing {
            ShardSizing::Fixed(_) => split_evenly(total, count),
            ShardSizing::Capacity { per_shard, .. } => {
                let per_shard = per_shard.max(1) as u64;
                Ok((0..count as u64)
                    .map(|i| per_shard.min(total - i * per_shard) as u32)
                    .collect())
            }
        }
    }
}

impl Default for ShardRouter {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Split `total` into `count` parts differing by at most one; the first
/// `total % count` parts get the extra unit.
pub fn split_evenly(total: u64, count: u32) -> Result<Vec<u32>> {
    if count == 0 {
        return Err(ValidationError::EmptyStock.into());
    }
    let base = total / count as u64;
    let remainder = total % count as u64;
    let largest = base + u64::from(remainder > 0);
    if largest > u32::MAX as u64 {
        return Err(ValidationError::TooManyShards {
            total,
            required: total.div_ceil(u32::MAX as u64),
            limit: count,
        }
        .into());
    }
    Ok((0..count as u64)
        .map(|i| (base + u64::from(i < remainder)) as u32)
        .collect())
}

fn clamp_u32(value: u64) -> u32 {
    value.min(u32::MAX as u64) as u32
}
