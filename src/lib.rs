//! Sharded ticket inventory with oversell prevention.
//!
//! This crate splits each ticket type's stock across independently locked
//! shards so that many buyers can reserve concurrently without ever selling
//! more than exists:
//! - **Segment locks** serialize writes per shard, with bounded waits
//! - **A versioned ledger** rejects any update that would go negative
//! - **Two-tier caching** (moka locally, a shared tier remotely) for reads
//! - **Batched settlement** coalesces "sold" updates per shard
//!
//! # Example
//!
//! ```rust,no_run
//! use shardstock::{EngineConfig, InventoryEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 20 shards per ticket type, in-memory backends
//!     let engine = Arc::new(InventoryEngine::in_memory(EngineConfig::new(20))?);
//!     engine.start().await?;
//!
//!     engine.initialize_shards(1, 1, 1000).await?;
//!
//!     // Reserve, then pay
//!     engine.lock(1, 1, 42, 2).await?;
//!     engine.deduct(1, 1, 42, 2).await?;
//!
//!     let stock = engine.query_aggregate(1, 1).await?;
//!     println!("available: {}, sold: {}", stock.available, stock.sold);
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Application Layer                 │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │            InventoryEngine API               │
//! │  • initialize_shards / lock / deduct        │
//! │  • release / query_aggregate / query_shard  │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┬───────────────┐
//!     ▼               ▼               ▼               ▼
//! ┌─────────┐   ┌──────────┐   ┌───────────┐   ┌────────────┐
//! │ Router  │   │ Segment  │   │  Stock    │   │ Cache tier │
//! │         │   │  locks   │   │  ledger   │   │ + hotspots │
//! └─────────┘   └──────────┘   └───────────┘   └────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Ledger**: the only source of truth; every shard keeps
//!   `available + locked + sold == total`
//! - **Cache**: never updated in place, invalidated on every write
//! - **Sold counters**: may lag by the settlement flush interval in batched mode
//!
//! # Backends
//!
//! Every backend is a trait with an in-memory implementation. The `redis`
//! feature adds networked implementations in [`redis`].

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod hotspot;
pub mod ledger;
pub mod lock;
pub mod metrics;
pub mod reservation;
pub mod routing;
pub mod settlement;
pub mod testing;
pub mod types;

#[cfg(feature = "redis")]
pub mod redis;

// Re-exports for convenience
pub use cache::{CacheTier, CacheTierStats, InMemorySharedCache, SharedCache};
pub use config::{
    CacheTierConfig, EngineConfig, HotspotConfig, LockConfig, RoutingConfig, SettlementConfig,
    SettlementMode, ShardSizing,
};
pub use engine::{EngineBuilder, InventoryEngine, ShardOp, ShardWriter};
pub use error::{DependencyError, Error, Result, ValidationError};
pub use hotspot::HotspotDetector;
pub use ledger::{
    InMemoryJournal, InMemoryLedgerStore, Journal, JournalEntry, JournalOp, LedgerStore,
    StockLedger,
};
pub use lock::{with_lock, DistributedLock, InMemoryLock, LockToken};
pub use reservation::{
    InMemoryReservationStore, Reservation, ReservationKey, ReservationState, ReservationStore,
};
pub use routing::{Placement, ShardRouter};
pub use settlement::{BatchSettlementPipeline, FlushReport, SettlementEvent, SettlementHandle};
pub use types::{
    AggregateStock, EventId, ShardId, ShardKey, ShardLayout, StockCounters, StockDelta, StockKey,
    TicketTypeId, UserId,
};

// Metrics
pub use metrics::{EngineMetrics, HealthIssue, HealthReport, MetricsSnapshot, Operation};
