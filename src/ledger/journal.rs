//! Write-ahead journal for reservation-linked ledger mutations.
//!
//! A shard write touches two records: the shard's counters and the
//! reservation's allocation map. The journal entry is written first under the
//! shard lock and committed once both are updated. An entry still open when
//! the next holder takes the lock is resolved by comparing the shard version
//! with the entry's `base_version`:
//!
//! - equal: the ledger write never landed, the entry is aborted and the
//!   version fenced so the original writer cannot land it late
//! - different: the ledger write landed, the reservation effect is rolled
//!   forward

use crate::error::Result;
use crate::reservation::ReservationKey;
use crate::types::ShardKey;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Kind of journaled shard mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalOp {
    /// Available → locked for one acquisition attempt of a reservation.
    Allocate {
        reservation: ReservationKey,
        attempt: Uuid,
    },

    /// Locked → available for one reservation.
    Release { reservation: ReservationKey },

    /// Locked → sold for a batch of reservations.
    Settle { reservations: Vec<ReservationKey> },
}

/// One open shard mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Unique operation id.
    pub op_id: Uuid,
    /// Shard being mutated.
    pub shard: ShardKey,
    /// What the mutation does.
    pub op: JournalOp,
    /// Units moved on the shard.
    pub quantity: u32,
    /// Shard version the mutation was computed from.
    pub base_version: u64,
}

impl JournalEntry {
    /// Create an entry with a fresh op id.
    pub fn new(shard: ShardKey, op: JournalOp, quantity: u32, base_version: u64) -> Self {
        Self {
            op_id: Uuid::new_v4(),
            shard,
            op,
            quantity,
            base_version,
        }
    }

    /// Serialize for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from storage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Storage for open journal entries.
#[async_trait]
pub trait Journal: Send + Sync + fmt::Debug {
    /// Record an entry before its mutation is applied.
    async fn begin(&self, entry: &JournalEntry) -> Result<()>;

    /// Mark an entry as fully applied.
    async fn commit(&self, shard: &ShardKey, op_id: Uuid) -> Result<()>;

    /// Entries begun but not committed on a shard, oldest first.
    async fn open_entries(&self, shard: &ShardKey) -> Result<Vec<JournalEntry>>;
}

/// In-memory journal.
#[derive(Debug, Default)]
pub struct InMemoryJournal {
    entries: RwLock<HashMap<ShardKey, Vec<JournalEntry>>>,
}

impl InMemoryJournal {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open entries across all shards.
    pub fn open_count(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl Journal for InMemoryJournal {
    async fn begin(&self, entry: &JournalEntry) -> Result<()> {
        self.entries
            .write()
            .entry(entry.shard)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn commit(&self, shard: &ShardKey, op_id: Uuid) -> Result<()> {
        let mut entries = self.entries.write();
        if let Some(open) = entries.get_mut(shard) {
            open.retain(|e| e.op_id != op_id);
            if open.is_empty() {
                entries.remove(shard);
            }
        }
        Ok(())
    }

    async fn open_entries(&self, shard: &ShardKey) -> Result<Vec<JournalEntry>> {
        Ok(self.entries.read().get(shard).cloned().unwrap_or_default())
    }
}
