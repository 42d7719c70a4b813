//! In-memory ledger store.

use super::LedgerStore;
use crate::error::{Error, Result, ValidationError};
use crate::types::{ShardKey, ShardLayout, StockCounters, StockKey};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// In-memory implementation for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    shards: RwLock<HashMap<ShardKey, StockCounters>>,
    layouts: RwLock<HashMap<StockKey, ShardLayout>>,
}

impl InMemoryLedgerStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of shard records.
    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get(&self, shard: &ShardKey) -> Result<Option<StockCounters>> {
        Ok(self.shards.read().get(shard).copied())
    }

    async fn create(&self, shard: &ShardKey, counters: StockCounters) -> Result<bool> {
        let mut shards = self.shards.write();
        if shards.contains_key(shard) {
            return Ok(false);
        }
        shards.insert(*shard, counters);
        Ok(true)
    }

    async fn compare_and_set(
        &self,
        shard: &ShardKey,
        expected_version: u64,
        next: StockCounters,
    ) -> Result<()> {
        let mut shards = self.shards.write();
        let current = shards.get_mut(shard).ok_or(ValidationError::NotInitialized {
            event_id: shard.event_id,
            ticket_type_id: shard.ticket_type_id,
        })?;

        if current.version != expected_version {
            return Err(Error::VersionConflict {
                expected: expected_version,
                actual: current.version,
            });
        }

        *current = next;
        Ok(())
    }

    async fn get_layout(&self, key: &StockKey) -> Result<Option<ShardLayout>> {
        Ok(self.layouts.read().get(key).copied())
    }

    async fn put_layout_if_absent(&self, key: &StockKey, layout: ShardLayout) -> Result<bool> {
        let mut layouts = self.layouts.write();
        if layouts.contains_key(key) {
            return Ok(false);
        }
        layouts.insert(*key, layout);
        Ok(true)
    }
}
