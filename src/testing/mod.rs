//! Testing utilities for the inventory engine.
//!
//! This module provides:
//! - Fault injection wrappers for the lock service and ledger store
//! - Helpers that check the stock invariants straight from the ledger
//! - Scenario tests that drive the engine concurrently
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Testing Framework                          │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐ │
//! │  │                    FaultController                         │ │
//! │  │  - Outages and flaky calls (seeded)                        │ │
//! │  │  - Added latency                                           │ │
//! │  └───────────────────────────────────────────────────────────┘ │
//! │               │                              │                  │
//! │               ▼                              ▼                  │
//! │  ┌──────────────────────┐      ┌──────────────────────────────┐ │
//! │  │      FaultyLock      │      │      FaultyLedgerStore       │ │
//! │  │                      │      │  - lost write acknowledgement│ │
//! │  └──────────────────────┘      └──────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use shardstock::testing::{FaultController, FaultyLock};
//! use shardstock::{EngineConfig, InMemoryLock, InventoryEngine};
//! use std::sync::Arc;
//!
//! let faults = Arc::new(FaultController::outage());
//! let lock = Arc::new(FaultyLock::new(Arc::new(InMemoryLock::new()), faults.clone()));
//! let engine = InventoryEngine::builder(EngineConfig::new(4))
//!     .with_lock(lock)
//!     .build()?;
//!
//! faults.enable();
//! assert!(engine.lock(1, 1, 7, 1).await.is_err());
//! ```

mod faults;

mod engine_tests;

pub use faults::{FaultConfig, FaultController, FaultyLedgerStore, FaultyLock};

use crate::engine::InventoryEngine;
use crate::error::Result;
use crate::types::{AggregateStock, EventId, TicketTypeId};

/// Read every shard of a ticket type from the ledger, bypassing the cache,
/// and check that each one conserves its total.
///
/// Returns the ledger-side aggregate.
pub async fn ledger_aggregate(
    engine: &InventoryEngine,
    event_id: EventId,
    ticket_type_id: TicketTypeId,
) -> Result<AggregateStock> {
    let stock = crate::types::StockKey::new(event_id, ticket_type_id);
    let layout = engine.ledger().layout(&stock).await?;

    let mut aggregate = AggregateStock::default();
    for shard_id in 0..layout.shard_count {
        let counters = engine.ledger().read(&stock.shard(shard_id)).await?;
        assert!(
            counters.is_consistent(),
            "shard {} broke conservation: {:?}",
            shard_id,
            counters
        );
        aggregate.add(&counters);
    }

    assert_eq!(aggregate.total, layout.total);
    assert!(aggregate.available <= layout.total);
    Ok(aggregate)
}
