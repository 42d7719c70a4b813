//! Core types used throughout the inventory engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Event (show/session) identifier.
pub type EventId = u64;

/// Ticket type identifier within an event.
pub type TicketTypeId = u64;

/// Buyer identifier.
pub type UserId = u64;

/// Index of a stock shard within a ticket type, in `[0, shard_count)`.
pub type ShardId = u32;

/// Identity of one stock shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey {
    pub event_id: EventId,
    pub ticket_type_id: TicketTypeId,
    pub shard_id: ShardId,
}

impl ShardKey {
    /// Create a new shard key.
    pub fn new(event_id: EventId, ticket_type_id: TicketTypeId, shard_id: ShardId) -> Self {
        Self {
            event_id,
            ticket_type_id,
            shard_id,
        }
    }

    /// The ticket type this shard belongs to.
    pub fn stock_key(&self) -> StockKey {
        StockKey::new(self.event_id, self.ticket_type_id)
    }

    /// Key of the persisted ledger record.
    pub fn storage_key(&self) -> String {
        format!(
            "inventory:shard:{}:{}:{}",
            self.event_id, self.ticket_type_id, self.shard_id
        )
    }

    /// Key of the segment lock guarding this shard.
    pub fn lock_key(&self) -> String {
        format!(
            "inventory:lock:{}:{}:{}",
            self.event_id, self.ticket_type_id, self.shard_id
        )
    }

    /// Key of the cached counter snapshot.
    pub fn cache_key(&self) -> String {
        format!(
            "inventory:stock:{}:{}:{}",
            self.event_id, self.ticket_type_id, self.shard_id
        )
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.event_id, self.ticket_type_id, self.shard_id)
    }
}

/// Identity of a ticket type's whole stock (all shards).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockKey {
    pub event_id: EventId,
    pub ticket_type_id: TicketTypeId,
}

impl StockKey {
    /// Create a new stock key.
    pub fn new(event_id: EventId, ticket_type_id: TicketTypeId) -> Self {
        Self {
            event_id,
            ticket_type_id,
        }
    }

    /// Key of the shard at `shard_id`.
    pub fn shard(&self, shard_id: ShardId) -> ShardKey {
        ShardKey::new(self.event_id, self.ticket_type_id, shard_id)
    }

    /// Key of the persisted shard layout.
    pub fn layout_key(&self) -> String {
        format!(
            "inventory:shard:count:{}:{}",
            self.event_id, self.ticket_type_id
        )
    }
}

/// Counters of one stock shard.
///
/// `available + locked + sold == total` holds for every value produced by
/// [`StockCounters::initial`] and [`StockCounters::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StockCounters {
    pub total: u32,
    pub available: u32,
    pub locked: u32,
    pub sold: u32,
    pub version: u64,
}

impl StockCounters {
    /// Fresh shard with all stock available.
    pub fn initial(total: u32) -> Self {
        Self {
            total,
            available: total,
            locked: 0,
            sold: 0,
            version: 0,
        }
    }

    /// Whether the conservation invariant holds.
    pub fn is_consistent(&self) -> bool {
        self.available as u64 + self.locked as u64 + self.sold as u64 == self.total as u64
    }

    /// Apply a delta, bumping the version.
    ///
    /// Returns `None` if any counter would go negative or overflow, or if the
    /// delta does not conserve the total.
    pub fn apply(&self, delta: StockDelta) -> Option<Self> {
        if delta.available + delta.locked + delta.sold != 0 {
            return None;
        }
        let next = Self {
            total: self.total,
            available: offset(self.available, delta.available)?,
            locked: offset(self.locked, delta.locked)?,
            sold: offset(self.sold, delta.sold)?,
            version: self.version + 1,
        };
        Some(next)
    }
}

fn offset(value: u32, delta: i64) -> Option<u32> {
    u32::try_from(value as i64 + delta).ok()
}

/// Signed change to a shard's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StockDelta {
    pub available: i64,
    pub locked: i64,
    pub sold: i64,
}

impl StockDelta {
    /// Move `quantity` from available to locked.
    pub fn lock(quantity: u32) -> Self {
        Self {
            available: -(quantity as i64),
            locked: quantity as i64,
            sold: 0,
        }
    }

    /// Move `quantity` from locked back to available.
    pub fn release(quantity: u32) -> Self {
        Self {
            available: quantity as i64,
            locked: -(quantity as i64),
            sold: 0,
        }
    }

    /// Move `quantity` from locked to sold.
    pub fn settle(quantity: u32) -> Self {
        Self {
            available: 0,
            locked: -(quantity as i64),
            sold: quantity as i64,
        }
    }

    /// A delta that only bumps the version.
    pub fn fence() -> Self {
        Self::default()
    }
}

/// Sum of counters across all shards of a ticket type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AggregateStock {
    pub total: u64,
    pub available: u64,
    pub locked: u64,
    pub sold: u64,
}

impl AggregateStock {
    /// Add one shard's counters.
    pub fn add(&mut self, counters: &StockCounters) {
        self.total += counters.total as u64;
        self.available += counters.available as u64;
        self.locked += counters.locked as u64;
        self.sold += counters.sold as u64;
    }
}

/// Persisted shard layout of a ticket type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLayout {
    /// Number of shards the total was split into.
    pub shard_count: u32,
    /// Total stock at initialization.
    pub total: u64,
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
