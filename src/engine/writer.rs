//! Lock-scoped, journaled shard mutations.
//!
//! Every ledger write that touches a reservation goes through
//! [`ShardWriter::apply`]:
//!
//! ```text
//!   acquire segment lock
//!     ├─ resolve open journal entries on the shard
//!     ├─ read counters, compute units to move
//!     ├─ journal begin { op, quantity, base_version }
//!     ├─ ledger CAS from base_version
//!     ├─ apply reservation effect
//!     ├─ journal commit
//!     └─ invalidate cache            (every exit path)
//!   release segment lock
//! ```

use crate::cache::CacheTier;
use crate::config::LockConfig;
use crate::error::{Error, Result, ValidationError};
use crate::ledger::{Journal, JournalEntry, JournalOp, StockLedger};
use crate::lock::{with_lock, DistributedLock};
use crate::reservation::{ReservationKey, ReservationState, ReservationStore};
use crate::types::{ShardKey, StockDelta};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A mutation of one shard on behalf of reservations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardOp {
    /// Lock up to `max_quantity` available units for a reservation.
    Allocate {
        reservation: ReservationKey,
        max_quantity: u32,
    },

    /// Return whatever a reservation holds on this shard.
    Release { reservation: ReservationKey },

    /// Move what each reservation holds on this shard from locked to sold.
    Settle { reservations: Vec<ReservationKey> },
}

/// Applies [`ShardOp`]s under the shard's segment lock.
#[derive(Debug)]
pub struct ShardWriter {
    ledger: StockLedger,
    journal: Arc<dyn Journal>,
    reservations: Arc<dyn ReservationStore>,
    lock: Arc<dyn DistributedLock>,
    cache: Arc<CacheTier>,
    lock_config: LockConfig,
}

impl ShardWriter {
    /// Create a shard writer.
    pub fn new(
        ledger: StockLedger,
        journal: Arc<dyn Journal>,
        reservations: Arc<dyn ReservationStore>,
        lock: Arc<dyn DistributedLock>,
        cache: Arc<CacheTier>,
        lock_config: LockConfig,
    ) -> Self {
        Self {
            ledger,
            journal,
            reservations,
            lock,
            cache,
            lock_config,
        }
    }

    /// Get the ledger.
    pub fn ledger(&self) -> &StockLedger {
        &self.ledger
    }

    /// Apply `op` to `shard`, waiting at most `wait` for the segment lock.
    ///
    /// Returns the number of units moved. Release and settle quantities are
    /// read from the reservations under the lock, so repeating either is a
    /// no-op. An operation that would move zero units writes nothing.
    pub async fn apply(&self, shard: &ShardKey, op: ShardOp, wait: Duration) -> Result<u32> {
        with_lock(
            self.lock.as_ref(),
            &shard.lock_key(),
            wait,
            self.lock_config.lease_timeout,
            || async {
                let outcome = self.apply_locked(shard, op).await;
                self.cache.invalidate(shard).await;
                outcome
            },
        )
        .await
    }

    /// Resolve open journal entries on `shard` under its lock.
    pub async fn recover(&self, shard: &ShardKey, wait: Duration) -> Result<usize> {
        with_lock(
            self.lock.as_ref(),
            &shard.lock_key(),
            wait,
            self.lock_config.lease_timeout,
            || async {
                let resolved = self.recover_locked(shard).await;
                self.cache.invalidate(shard).await;
                resolved
            },
        )
        .await
    }

    async fn apply_locked(&self, shard: &ShardKey, op: ShardOp) -> Result<u32> {
        self.recover_locked(shard).await?;

        let current = self.ledger.read(shard).await?;
        let (journal_op, quantity, delta) = match op {
            ShardOp::Allocate {
                reservation,
                max_quantity,
            } => {
                let Some(owner) = self.reservations.get(&reservation).await? else {
                    return Err(ValidationError::ReservationNotFound {
                        user_id: reservation.user_id,
                    }
                    .into());
                };
                let quantity = max_quantity.min(current.available);
                if quantity == 0 {
                    return Ok(0);
                }
                (
                    JournalOp::Allocate {
                        reservation,
                        attempt: owner.attempt,
                    },
                    quantity,
                    StockDelta::lock(quantity),
                )
            }
            ShardOp::Release { reservation } => {
                let quantity = self.held_on(&reservation, shard).await?;
                if quantity == 0 {
                    return Ok(0);
                }
                (
                    JournalOp::Release { reservation },
                    quantity,
                    StockDelta::release(quantity),
                )
            }
            ShardOp::Settle { reservations } => {
                let mut holders = Vec::with_capacity(reservations.len());
                let mut quantity = 0;
                for reservation in reservations {
                    let held = self.held_on(&reservation, shard).await?;
                    if held > 0 && !holders.contains(&reservation) {
                        holders.push(reservation);
                        quantity += held;
                    }
                }
                if quantity == 0 {
                    return Ok(0);
                }
                (
                    JournalOp::Settle {
                        reservations: holders,
                    },
                    quantity,
                    StockDelta::settle(quantity),
                )
            }
        };

        let entry = JournalEntry::new(*shard, journal_op, quantity, current.version);
        self.journal.begin(&entry).await?;

        if let Err(e) = self.ledger.update(shard, delta, current.version).await {
            // Rejected writes never landed; anything else is left for recovery.
            if matches!(
                e,
                Error::InsufficientStock { .. } | Error::VersionConflict { .. } | Error::Validation(_)
            ) {
                self.journal.commit(shard, entry.op_id).await?;
            }
            return Err(e);
        }

        let attached = self.roll_forward(&entry).await?;
        self.journal.commit(shard, entry.op_id).await?;

        if !attached {
            if let JournalOp::Allocate { reservation, .. } = &entry.op {
                return Err(ValidationError::ReservationNotFound {
                    user_id: reservation.user_id,
                }
                .into());
            }
        }

        debug!(
            shard = %shard,
            quantity,
            base_version = entry.base_version,
            "Applied shard operation"
        );

        Ok(quantity)
    }

    async fn recover_locked(&self, shard: &ShardKey) -> Result<usize> {
        let open = self.journal.open_entries(shard).await?;
        if open.is_empty() {
            return Ok(0);
        }

        for entry in &open {
            let current = self.ledger.read(shard).await?;
            if current.version == entry.base_version {
                // Never landed: fence the version so a late writer cannot land it.
                self.ledger
                    .update(shard, StockDelta::fence(), current.version)
                    .await?;
                info!(
                    shard = %shard,
                    op_id = %entry.op_id,
                    "Aborted interrupted shard operation"
                );
            } else {
                self.roll_forward(entry).await?;
                info!(
                    shard = %shard,
                    op_id = %entry.op_id,
                    "Rolled forward interrupted shard operation"
                );
            }
            self.journal.commit(shard, entry.op_id).await?;
        }

        Ok(open.len())
    }

    /// Apply the reservation side of a landed ledger write. Idempotent.
    ///
    /// Returns `false` for an allocation whose acquisition attempt is gone,
    /// either deleted or replaced by a relock of the same key; the orphaned
    /// units are returned to the shard. One attempt holds at most one
    /// allocation per shard, so replaying an allocation overwrites rather
    /// than adds.
    async fn roll_forward(&self, entry: &JournalEntry) -> Result<bool> {
        match &entry.op {
            JournalOp::Allocate {
                reservation,
                attempt,
            } => {
                let owner = self
                    .reservations
                    .get(reservation)
                    .await?
                    .filter(|r| r.attempt == *attempt);
                match owner {
                    Some(mut r) => {
                        r.allocation.insert(entry.shard.shard_id, entry.quantity);
                        self.reservations.save(&r).await?;
                        Ok(true)
                    }
                    None => {
                        let current = self.ledger.read(&entry.shard).await?;
                        self.ledger
                            .update(
                                &entry.shard,
                                StockDelta::release(entry.quantity),
                                current.version,
                            )
                            .await?;
                        warn!(
                            shard = %entry.shard,
                            reservation = %reservation,
                            quantity = entry.quantity,
                            "Returned units allocated to a stale reservation attempt"
                        );
                        Ok(false)
                    }
                }
            }
            JournalOp::Release { reservation } => {
                self.detach(reservation, entry.shard).await?;
                Ok(true)
            }
            JournalOp::Settle { reservations } => {
                for reservation in reservations {
                    self.detach(reservation, entry.shard).await?;
                }
                Ok(true)
            }
        }
    }

    /// Units `key` currently holds on `shard`.
    async fn held_on(&self, key: &ReservationKey, shard: &ShardKey) -> Result<u32> {
        Ok(self
            .reservations
            .get(key)
            .await?
            .and_then(|r| r.allocation.get(&shard.shard_id).copied())
            .unwrap_or(0))
    }

    /// Drop `shard` from a reservation's allocation, deleting the reservation
    /// once nothing is left and it is past the acquiring stage.
    async fn detach(&self, key: &ReservationKey, shard: ShardKey) -> Result<()> {
        let Some(mut reservation) = self.reservations.get(key).await? else {
            return Ok(());
        };

        if reservation.allocation.remove(&shard.shard_id).is_none() {
            return Ok(());
        }

        if reservation.allocation.is_empty() && reservation.state != ReservationState::Acquiring {
            self.reservations.remove(key).await?;
        } else {
            self.reservations.save(&reservation).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemorySharedCache;
    use crate::config::{CacheTierConfig, HotspotConfig};
    use crate::hotspot::HotspotDetector;
    use crate::ledger::{InMemoryJournal, InMemoryLedgerStore};
    use crate::lock::InMemoryLock;
    use crate::reservation::{InMemoryReservationStore, Reservation};
    use crate::types::StockKey;

    struct Fixture {
        writer: ShardWriter,
        ledger: StockLedger,
        journal: Arc<InMemoryJournal>,
        reservations: Arc<InMemoryReservationStore>,
        lock: Arc<InMemoryLock>,
    }

    const WAIT: Duration = Duration::from_millis(100);

    async fn fixture(parts: &[u32]) -> Fixture {
        let ledger = StockLedger::new(Arc::new(InMemoryLedgerStore::new()));
        ledger.initialize(&StockKey::new(1, 1), parts).await.unwrap();

        let journal = Arc::new(InMemoryJournal::new());
        let reservations = Arc::new(InMemoryReservationStore::new());
        let lock = Arc::new(InMemoryLock::new());
        let cache = Arc::new(CacheTier::new(
            CacheTierConfig::default(),
            Arc::new(InMemorySharedCache::new()),
            Arc::new(HotspotDetector::new(HotspotConfig::default())),
        ));

        let writer = ShardWriter::new(
            ledger.clone(),
            journal.clone(),
            reservations.clone(),
            lock.clone(),
            cache,
            LockConfig::default(),
        );

        Fixture {
            writer,
            ledger,
            journal,
            reservations,
            lock,
        }
    }

    async fn reserve(fx: &Fixture, user_id: u64, quantity: u32) -> ReservationKey {
        let key = ReservationKey::new(1, 1, user_id);
        let r = Reservation::acquiring(key, quantity, Duration::from_secs(60));
        fx.reservations.insert(&r).await.unwrap();
        key
    }

    /// Journal entry for an allocation by `key`'s current attempt.
    async fn allocate_entry(fx: &Fixture, key: ReservationKey, shard: ShardKey, quantity: u32) -> JournalEntry {
        let attempt = fx.reservations.get(&key).await.unwrap().unwrap().attempt;
        JournalEntry::new(
            shard,
            JournalOp::Allocate {
                reservation: key,
                attempt,
            },
            quantity,
            0,
        )
    }

    #[tokio::test]
    async fn test_allocate_takes_what_is_available() {
        let fx = fixture(&[3]).await;
        let key = reserve(&fx, 7, 5).await;
        let shard = ShardKey::new(1, 1, 0);

        let moved = fx
            .writer
            .apply(
                &shard,
                ShardOp::Allocate {
                    reservation: key,
                    max_quantity: 5,
                },
                WAIT,
            )
            .await
            .unwrap();
        assert_eq!(moved, 3);

        let counters = fx.ledger.read(&shard).await.unwrap();
        assert_eq!(counters.available, 0);
        assert_eq!(counters.locked, 3);

        let r = fx.reservations.get(&key).await.unwrap().unwrap();
        assert_eq!(r.allocation.get(&0), Some(&3));
        assert_eq!(fx.journal.open_count(), 0);
        assert!(!fx.lock.is_locked(&shard.lock_key()));
    }

    #[tokio::test]
    async fn test_allocate_on_empty_shard_writes_nothing() {
        let fx = fixture(&[1]).await;
        let first = reserve(&fx, 1, 1).await;
        let second = reserve(&fx, 2, 1).await;
        let shard = ShardKey::new(1, 1, 0);

        let op = |reservation| ShardOp::Allocate {
            reservation,
            max_quantity: 1,
        };
        assert_eq!(fx.writer.apply(&shard, op(first), WAIT).await.unwrap(), 1);
        assert_eq!(fx.writer.apply(&shard, op(second), WAIT).await.unwrap(), 0);

        let counters = fx.ledger.read(&shard).await.unwrap();
        assert_eq!(counters.version, 1);
        let r = fx.reservations.get(&second).await.unwrap().unwrap();
        assert!(r.allocation.is_empty());
    }

    #[tokio::test]
    async fn test_release_detaches_and_deletes_held_reservation() {
        let fx = fixture(&[5]).await;
        let key = reserve(&fx, 7, 2).await;
        let shard = ShardKey::new(1, 1, 0);

        fx.writer
            .apply(
                &shard,
                ShardOp::Allocate {
                    reservation: key,
                    max_quantity: 2,
                },
                WAIT,
            )
            .await
            .unwrap();

        let mut r = fx.reservations.get(&key).await.unwrap().unwrap();
        r.state = ReservationState::Held;
        fx.reservations.save(&r).await.unwrap();

        fx.writer
            .apply(
                &shard,
                ShardOp::Release { reservation: key },
                WAIT,
            )
            .await
            .unwrap();

        assert_eq!(fx.ledger.read(&shard).await.unwrap().available, 5);
        assert!(fx.reservations.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_allocate_for_missing_reservation_writes_nothing() {
        let fx = fixture(&[5]).await;
        let shard = ShardKey::new(1, 1, 0);

        let err = fx
            .writer
            .apply(
                &shard,
                ShardOp::Allocate {
                    reservation: ReservationKey::new(1, 1, 99),
                    max_quantity: 2,
                },
                WAIT,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::ReservationNotFound { user_id: 99 })
        ));

        let counters = fx.ledger.read(&shard).await.unwrap();
        assert_eq!(counters, crate::types::StockCounters::initial(5));
        assert_eq!(fx.journal.open_count(), 0);
    }

    #[tokio::test]
    async fn test_recover_returns_units_of_replaced_attempt() {
        let fx = fixture(&[5]).await;
        let key = reserve(&fx, 7, 3).await;
        let shard = ShardKey::new(1, 1, 0);

        // The first attempt's write landed but its reservation never saw it.
        let entry = allocate_entry(&fx, key, shard, 3).await;
        fx.journal.begin(&entry).await.unwrap();
        fx.ledger.update(&shard, StockDelta::lock(3), 0).await.unwrap();

        // The same buyer locks again under a fresh attempt.
        fx.reservations.remove(&key).await.unwrap();
        reserve(&fx, 7, 2).await;

        assert_eq!(fx.writer.recover(&shard, WAIT).await.unwrap(), 1);

        let r = fx.reservations.get(&key).await.unwrap().unwrap();
        assert!(r.allocation.is_empty());
        let counters = fx.ledger.read(&shard).await.unwrap();
        assert_eq!(counters.available, 5);
        assert_eq!(counters.locked, 0);
    }

    #[tokio::test]
    async fn test_settle_skips_reservations_without_units() {
        let fx = fixture(&[5]).await;
        let key = reserve(&fx, 7, 2).await;
        let shard = ShardKey::new(1, 1, 0);

        let moved = fx
            .writer
            .apply(
                &shard,
                ShardOp::Settle {
                    reservations: vec![key],
                },
                WAIT,
            )
            .await
            .unwrap();
        assert_eq!(moved, 0);
        assert_eq!(fx.journal.open_count(), 0);
        assert_eq!(fx.ledger.read(&shard).await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_settle_is_idempotent() {
        let fx = fixture(&[5]).await;
        let first = reserve(&fx, 7, 2).await;
        let second = reserve(&fx, 8, 1).await;
        let shard = ShardKey::new(1, 1, 0);

        for (key, quantity) in [(first, 2), (second, 1)] {
            fx.writer
                .apply(
                    &shard,
                    ShardOp::Allocate {
                        reservation: key,
                        max_quantity: quantity,
                    },
                    WAIT,
                )
                .await
                .unwrap();
            let mut r = fx.reservations.get(&key).await.unwrap().unwrap();
            r.state = ReservationState::Settling;
            fx.reservations.save(&r).await.unwrap();
        }

        let settle = || ShardOp::Settle {
            reservations: vec![first, second, first],
        };
        assert_eq!(fx.writer.apply(&shard, settle(), WAIT).await.unwrap(), 3);
        assert_eq!(fx.writer.apply(&shard, settle(), WAIT).await.unwrap(), 0);

        let counters = fx.ledger.read(&shard).await.unwrap();
        assert_eq!(counters.sold, 3);
        assert_eq!(counters.locked, 0);
        assert!(fx.reservations.is_empty());
    }

    #[tokio::test]
    async fn test_recover_aborts_unlanded_entry() {
        let fx = fixture(&[5]).await;
        let key = reserve(&fx, 7, 2).await;
        let shard = ShardKey::new(1, 1, 0);

        // Crash after journaling, before the ledger write.
        let entry = allocate_entry(&fx, key, shard, 2).await;
        fx.journal.begin(&entry).await.unwrap();

        assert_eq!(fx.writer.recover(&shard, WAIT).await.unwrap(), 1);

        let counters = fx.ledger.read(&shard).await.unwrap();
        assert_eq!(counters.available, 5);
        assert_eq!(counters.version, 1);
        let r = fx.reservations.get(&key).await.unwrap().unwrap();
        assert!(r.allocation.is_empty());
        assert_eq!(fx.journal.open_count(), 0);
    }

    #[tokio::test]
    async fn test_recover_rolls_forward_landed_entry() {
        let fx = fixture(&[5]).await;
        let key = reserve(&fx, 7, 2).await;
        let shard = ShardKey::new(1, 1, 0);

        // Crash after the ledger write, before the reservation effect.
        let entry = allocate_entry(&fx, key, shard, 2).await;
        fx.journal.begin(&entry).await.unwrap();
        fx.ledger.update(&shard, StockDelta::lock(2), 0).await.unwrap();

        // The next writer on the shard resolves it first.
        let other = reserve(&fx, 8, 1).await;
        fx.writer
            .apply(
                &shard,
                ShardOp::Allocate {
                    reservation: other,
                    max_quantity: 1,
                },
                WAIT,
            )
            .await
            .unwrap();

        let r = fx.reservations.get(&key).await.unwrap().unwrap();
        assert_eq!(r.allocation.get(&0), Some(&2));
        let counters = fx.ledger.read(&shard).await.unwrap();
        assert_eq!(counters.locked, 3);
        assert_eq!(fx.journal.open_count(), 0);
    }

    #[tokio::test]
    async fn test_apply_times_out_on_held_lock() {
        let fx = fixture(&[5]).await;
        let key = reserve(&fx, 7, 1).await;
        let shard = ShardKey::new(1, 1, 0);

        let _held = fx
            .lock
            .acquire(&shard.lock_key(), Duration::ZERO, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        let err = fx
            .writer
            .apply(
                &shard,
                ShardOp::Allocate {
                    reservation: key,
                    max_quantity: 1,
                },
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
        assert_eq!(fx.ledger.read(&shard).await.unwrap(), crate::types::StockCounters::initial(5));
    }
}
