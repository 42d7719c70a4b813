//! Durable per-shard stock counters.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    StockLedger                       │
//! │   read / update(delta, expected_version)             │
//! │        │                                             │
//! │        ▼                                             │
//! │  ┌────────────────┐         ┌────────────────────┐   │
//! │  │  LedgerStore   │         │      Journal       │   │
//! │  │ (records, CAS) │         │ (open write ops)   │   │
//! │  └────────────────┘         └────────────────────┘   │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! The ledger is the only source of truth. Every mutation is a versioned
//! compare-and-set executed under the shard's segment lock; a delta that
//! would drive a counter below zero is rejected, never clamped.

mod journal;
mod memory;

pub use journal::{InMemoryJournal, Journal, JournalEntry, JournalOp};
pub use memory::InMemoryLedgerStore;

use crate::error::{Error, Result, ValidationError};
use crate::types::{ShardKey, ShardLayout, StockCounters, StockDelta, StockKey};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Persistence for shard records and layouts.
#[async_trait]
pub trait LedgerStore: Send + Sync + fmt::Debug {
    /// Load a shard record.
    async fn get(&self, shard: &ShardKey) -> Result<Option<StockCounters>>;

    /// Create a shard record. Returns `false` if it already exists.
    async fn create(&self, shard: &ShardKey, counters: StockCounters) -> Result<bool>;

    /// Replace a shard record if its stored version equals `expected_version`.
    ///
    /// Fails with [`Error::VersionConflict`] otherwise.
    async fn compare_and_set(
        &self,
        shard: &ShardKey,
        expected_version: u64,
        next: StockCounters,
    ) -> Result<()>;

    /// Load a ticket type's layout.
    async fn get_layout(&self, key: &StockKey) -> Result<Option<ShardLayout>>;

    /// Store a layout unless one exists. Returns `false` if it already exists.
    async fn put_layout_if_absent(&self, key: &StockKey, layout: ShardLayout) -> Result<bool>;
}

/// Versioned view over a [`LedgerStore`].
#[derive(Debug, Clone)]
pub struct StockLedger {
    store: Arc<dyn LedgerStore>,
}

impl StockLedger {
    /// Create a ledger over the given store.
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Get the underlying store.
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Split a ticket type into shards with the given per-shard totals.
    ///
    /// The layout is claimed first, so a second initialization of the same
    /// ticket type fails with `AlreadyInitialized` and leaves the shards
    /// untouched.
    pub async fn initialize(&self, key: &StockKey, parts: &[u32]) -> Result<ShardLayout> {
        if parts.is_empty() {
            return Err(ValidationError::EmptyStock.into());
        }

        let layout = ShardLayout {
            shard_count: parts.len() as u32,
            total: parts.iter().map(|&p| p as u64).sum(),
        };

        if !self.store.put_layout_if_absent(key, layout).await? {
            return Err(ValidationError::AlreadyInitialized {
                event_id: key.event_id,
                ticket_type_id: key.ticket_type_id,
            }
            .into());
        }

        for (shard_id, &total) in parts.iter().enumerate() {
            let shard = key.shard(shard_id as u32);
            self.store.create(&shard, StockCounters::initial(total)).await?;
        }

        info!(
            event_id = key.event_id,
            ticket_type_id = key.ticket_type_id,
            total = layout.total,
            shards = layout.shard_count,
            "Initialized inventory shards"
        );

        Ok(layout)
    }

    /// Layout of an initialized ticket type.
    pub async fn layout(&self, key: &StockKey) -> Result<ShardLayout> {
        self.store
            .get_layout(key)
            .await?
            .ok_or_else(|| not_initialized(key))
    }

    /// Read a shard's counters.
    pub async fn read(&self, shard: &ShardKey) -> Result<StockCounters> {
        self.store
            .get(shard)
            .await?
            .ok_or_else(|| not_initialized(&shard.stock_key()))
    }

    /// Apply `delta` to a shard whose current version is `expected_version`.
    ///
    /// Must be called under the shard's segment lock. Returns the new
    /// counters.
    pub async fn update(
        &self,
        shard: &ShardKey,
        delta: StockDelta,
        expected_version: u64,
    ) -> Result<StockCounters> {
        let current = self.read(shard).await?;
        if current.version != expected_version {
            return Err(Error::VersionConflict {
                expected: expected_version,
                actual: current.version,
            });
        }

        let next = current
            .apply(delta)
            .ok_or_else(|| insufficient(&current, &delta))?;

        self.store.compare_and_set(shard, expected_version, next).await?;

        debug!(
            shard = %shard,
            version = next.version,
            available = next.available,
            locked = next.locked,
            sold = next.sold,
            "Ledger updated"
        );

        Ok(next)
    }
}

fn not_initialized(key: &StockKey) -> Error {
    ValidationError::NotInitialized {
        event_id: key.event_id,
        ticket_type_id: key.ticket_type_id,
    }
    .into()
}

/// Describe the first counter the delta would drive negative.
fn insufficient(current: &StockCounters, delta: &StockDelta) -> Error {
    let (requested, available) = if delta.available < 0 {
        (-delta.available, current.available)
    } else if delta.locked < 0 {
        (-delta.locked, current.locked)
    } else {
        (-delta.sold.min(0), current.sold)
    };
    Error::InsufficientStock {
        requested: requested.min(u32::MAX as i64) as u32,
        available,
    }
}
