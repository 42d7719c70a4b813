//! The inventory engine: public operations over sharded stock.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         InventoryEngine                           │
//! │                                                                   │
//! │  lock ──► ShardRouter::scan_order ──► ShardWriter::apply(Allocate)│
//! │             (primary shard first)        per shard, under lock    │
//! │                                                                   │
//! │  deduct ─┬─ immediate ──► ShardWriter::apply(Settle) per shard    │
//! │          └─ batched ────► BatchSettlementPipeline                 │
//! │                                                                   │
//! │  release / expiry ──► ShardWriter::apply(Release) per shard       │
//! │                                                                   │
//! │  query ──► CacheTier (local ─► shared ─► StockLedger)             │
//! │                                                                   │
//! │  background: reservation reaper, settlement pipeline              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Operations on the same reservation key are serialized in-process; shard
//! writes are serialized by the distributed segment lock.

mod writer;

pub use writer::{ShardOp, ShardWriter};

use crate::cache::{CacheTier, InMemorySharedCache, SharedCache};
use crate::config::{EngineConfig, SettlementMode};
use crate::error::{Error, Result, ValidationError};
use crate::hotspot::HotspotDetector;
use crate::ledger::{InMemoryJournal, InMemoryLedgerStore, Journal, LedgerStore, StockLedger};
use crate::lock::{DistributedLock, InMemoryLock};
use crate::metrics::{EngineMetrics, HealthReport, Operation};
use crate::reservation::{
    InMemoryReservationStore, Reservation, ReservationKey, ReservationState, ReservationStore,
};
use crate::routing::ShardRouter;
use crate::settlement::{
    BatchSettlementPipeline, FlushReport, SettlementCommand, SettlementEvent, SettlementHandle,
};
use crate::types::{
    now_ms, AggregateStock, EventId, ShardId, ShardKey, StockCounters, StockKey, TicketTypeId,
    UserId,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Builder for [`InventoryEngine`].
///
/// Every backend defaults to its in-memory implementation.
pub struct EngineBuilder {
    config: EngineConfig,
    lock: Option<Arc<dyn DistributedLock>>,
    ledger_store: Option<Arc<dyn LedgerStore>>,
    journal: Option<Arc<dyn Journal>>,
    shared_cache: Option<Arc<dyn SharedCache>>,
    reservations: Option<Arc<dyn ReservationStore>>,
}

impl EngineBuilder {
    /// Create a builder.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            lock: None,
            ledger_store: None,
            journal: None,
            shared_cache: None,
            reservations: None,
        }
    }

    /// Use a distributed lock service.
    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Use a ledger store.
    pub fn with_ledger_store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.ledger_store = Some(store);
        self
    }

    /// Use a shard operation journal.
    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Use a shared cache tier.
    pub fn with_shared_cache(mut self, cache: Arc<dyn SharedCache>) -> Self {
        self.shared_cache = Some(cache);
        self
    }

    /// Use a reservation store.
    pub fn with_reservation_store(mut self, store: Arc<dyn ReservationStore>) -> Self {
        self.reservations = Some(store);
        self
    }

    /// Validate the configuration and assemble the engine.
    ///
    /// Background tasks are not running until [`InventoryEngine::start`].
    pub fn build(self) -> Result<InventoryEngine> {
        self.config.validate()?;

        let config = self.config;
        let lock = self.lock.unwrap_or_else(|| Arc::new(InMemoryLock::new()));
        let ledger = StockLedger::new(
            self.ledger_store
                .unwrap_or_else(|| Arc::new(InMemoryLedgerStore::new())),
        );
        let journal = self
            .journal
            .unwrap_or_else(|| Arc::new(InMemoryJournal::new()));
        let shared = self
            .shared_cache
            .unwrap_or_else(|| Arc::new(InMemorySharedCache::new()));
        let reservations = self
            .reservations
            .unwrap_or_else(|| Arc::new(InMemoryReservationStore::new()));

        let hotspot = Arc::new(HotspotDetector::new(config.hotspot.clone()));
        let cache = Arc::new(CacheTier::new(config.cache.clone(), shared, hotspot));
        let metrics = Arc::new(EngineMetrics::new());

        let writer = Arc::new(ShardWriter::new(
            ledger.clone(),
            journal,
            reservations.clone(),
            lock,
            cache.clone(),
            config.lock.clone(),
        ));

        let (settlement, pipeline) = match config.settlement.mode {
            SettlementMode::Immediate => (None, None),
            SettlementMode::Batched => {
                let (handle, rx) =
                    BatchSettlementPipeline::channel(config.settlement.channel_capacity);
                let pipeline = BatchSettlementPipeline::new(
                    config.settlement.clone(),
                    config.lock.clone(),
                    writer.clone(),
                    reservations.clone(),
                    metrics.clone(),
                );
                (Some(handle), Some((pipeline, rx)))
            }
        };

        Ok(InventoryEngine {
            router: ShardRouter::new(config.routing.clone()),
            config,
            ledger,
            writer,
            reservations,
            cache,
            metrics,
            key_locks: DashMap::new(),
            rollback_epochs: DashMap::new(),
            settlement,
            pipeline: Mutex::new(pipeline),
            started: AtomicBool::new(false),
            shutdown_txs: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

type PendingPipeline = (BatchSettlementPipeline, mpsc::Receiver<SettlementCommand>);

/// Sharded ticket inventory with oversell prevention.
pub struct InventoryEngine {
    config: EngineConfig,
    router: ShardRouter,
    ledger: StockLedger,
    writer: Arc<ShardWriter>,
    reservations: Arc<dyn ReservationStore>,
    cache: Arc<CacheTier>,
    metrics: Arc<EngineMetrics>,

    /// Per-reservation in-process serialization.
    key_locks: DashMap<ReservationKey, Arc<tokio::sync::Mutex<()>>>,
    /// Count of partial-allocation rollbacks per ticket type.
    rollback_epochs: DashMap<StockKey, u64>,

    /// Producer side of the settlement queue (batched mode only).
    settlement: Option<SettlementHandle>,
    /// Pipeline waiting for `start`.
    pipeline: Mutex<Option<PendingPipeline>>,

    started: AtomicBool,
    shutdown_txs: Mutex<Vec<mpsc::Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl InventoryEngine {
    /// Start building an engine.
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Engine with in-memory backends.
    pub fn in_memory(config: EngineConfig) -> Result<Self> {
        EngineBuilder::new(config).build()
    }

    // ==================== Lifecycle ====================

    /// Start the background tasks.
    ///
    /// This will:
    /// 1. Pick up reservations left `Settling` by a previous process
    /// 2. Start the settlement pipeline (batched mode)
    /// 3. Start the expired-reservation reaper
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Internal("engine already started".into()));
        }

        let settling = self
            .reservations
            .list_by_state(ReservationState::Settling)
            .await?;

        let pending = self.pipeline.lock().take();
        match pending {
            Some((mut pipeline, rx)) => {
                for reservation in &settling {
                    pipeline.push(SettlementEvent::new(
                        reservation.key,
                        reservation.allocation.clone(),
                    ));
                }
                let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
                let handle = tokio::spawn(async move {
                    pipeline.run(rx, shutdown_rx).await;
                });
                self.shutdown_txs.lock().push(shutdown_tx);
                self.tasks.lock().push(handle);
            }
            None => {
                for reservation in &settling {
                    if let Err(e) = self.settle_now(reservation).await {
                        warn!(
                            reservation = %reservation.key,
                            error = %e,
                            "Could not finish interrupted settlement"
                        );
                    }
                }
            }
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let engine = Arc::downgrade(self);
        let interval = self.config.reaper_interval;
        let handle = tokio::spawn(async move {
            run_reaper(engine, interval, shutdown_rx).await;
        });
        self.shutdown_txs.lock().push(shutdown_tx);
        self.tasks.lock().push(handle);

        info!(
            settlement = ?self.config.settlement.mode,
            recovered_settling = settling.len(),
            "Inventory engine started"
        );
        Ok(())
    }

    /// Stop the background tasks, flushing buffered settlements.
    pub async fn shutdown(&self) {
        info!("Shutting down inventory engine");

        let senders = std::mem::take(&mut *self.shutdown_txs.lock());
        for tx in senders {
            let _ = tx.send(()).await;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
    }

    // ==================== Operations ====================

    /// Split `total` units of a ticket type across shards.
    ///
    /// Fails with `AlreadyInitialized` if shards already exist.
    pub async fn initialize_shards(
        &self,
        event_id: EventId,
        ticket_type_id: TicketTypeId,
        total: u64,
    ) -> Result<()> {
        let start = Instant::now();
        let result = self
            .initialize_inner(StockKey::new(event_id, ticket_type_id), total)
            .await;
        self.metrics
            .record(Operation::Initialize, &result, start.elapsed());
        result
    }

    /// Reserve `quantity` units for a buyer, gathering them across shards.
    ///
    /// All-or-nothing: on failure every partially allocated unit is returned.
    pub async fn lock(
        &self,
        event_id: EventId,
        ticket_type_id: TicketTypeId,
        user_id: UserId,
        quantity: u32,
    ) -> Result<()> {
        let start = Instant::now();
        let result = self
            .lock_inner(ReservationKey::new(event_id, ticket_type_id, user_id), quantity)
            .await;
        self.metrics.record(Operation::Lock, &result, start.elapsed());
        result
    }

    /// Turn a buyer's reservation into sold stock.
    ///
    /// In batched mode this returns once the settlement is queued; the "sold"
    /// counters follow within the flush lag.
    pub async fn deduct(
        &self,
        event_id: EventId,
        ticket_type_id: TicketTypeId,
        user_id: UserId,
        quantity: u32,
    ) -> Result<()> {
        let start = Instant::now();
        let result = self
            .deduct_inner(ReservationKey::new(event_id, ticket_type_id, user_id), quantity)
            .await;
        self.metrics
            .record(Operation::Deduct, &result, start.elapsed());
        result
    }

    /// Return a buyer's reserved units to the shards they came from.
    pub async fn release(
        &self,
        event_id: EventId,
        ticket_type_id: TicketTypeId,
        user_id: UserId,
        quantity: u32,
    ) -> Result<()> {
        let start = Instant::now();
        let result = self
            .release_inner(ReservationKey::new(event_id, ticket_type_id, user_id), quantity)
            .await;
        self.metrics
            .record(Operation::Release, &result, start.elapsed());
        result
    }

    /// Sum of counters across every shard of a ticket type.
    pub async fn query_aggregate(
        &self,
        event_id: EventId,
        ticket_type_id: TicketTypeId,
    ) -> Result<AggregateStock> {
        let start = Instant::now();
        let result = self
            .aggregate_inner(StockKey::new(event_id, ticket_type_id))
            .await;
        self.metrics.record(Operation::Query, &result, start.elapsed());
        result
    }

    /// Counters of one shard.
    pub async fn query_shard(
        &self,
        event_id: EventId,
        ticket_type_id: TicketTypeId,
        shard_id: ShardId,
    ) -> Result<StockCounters> {
        let start = Instant::now();
        let result = self
            .shard_inner(StockKey::new(event_id, ticket_type_id), shard_id)
            .await;
        self.metrics.record(Operation::Query, &result, start.elapsed());
        result
    }

    /// Read every shard of a ticket type through the cache, warming it.
    ///
    /// Returns the number of shards read.
    pub async fn preload(&self, event_id: EventId, ticket_type_id: TicketTypeId) -> Result<usize> {
        let stock = StockKey::new(event_id, ticket_type_id);
        let layout = self.ledger.layout(&stock).await?;
        for shard_id in 0..layout.shard_count {
            self.read_shard(&stock.shard(shard_id)).await?;
        }
        info!(
            event_id,
            ticket_type_id,
            shards = layout.shard_count,
            "Preloaded shard snapshots"
        );
        Ok(layout.shard_count as usize)
    }

    /// Release every expired reservation that is not settling.
    ///
    /// Returns the number released. Individual failures are logged and left
    /// for the next pass.
    pub async fn expire_reservations(&self) -> Result<usize> {
        let start = Instant::now();
        let result = self.expire_inner().await;
        self.metrics.record(Operation::Expire, &result, start.elapsed());
        result
    }

    /// Resolve interrupted shard operations of a ticket type.
    ///
    /// Returns the number of journal entries resolved.
    pub async fn recover(&self, event_id: EventId, ticket_type_id: TicketTypeId) -> Result<usize> {
        let stock = StockKey::new(event_id, ticket_type_id);
        let layout = self.ledger.layout(&stock).await?;
        let mut resolved = 0;
        for shard_id in 0..layout.shard_count {
            resolved += self
                .writer
                .recover(&stock.shard(shard_id), self.config.lock.wait_timeout)
                .await?;
        }
        if resolved > 0 {
            info!(event_id, ticket_type_id, resolved, "Recovered shard operations");
        }
        Ok(resolved)
    }

    /// Flush buffered settlements now (no-op in immediate mode).
    pub async fn flush_settlements(&self) -> Result<FlushReport> {
        match &self.settlement {
            Some(handle) => handle.flush().await,
            None => Ok(FlushReport::default()),
        }
    }

    /// Look up a buyer's reservation.
    pub async fn reservation(
        &self,
        event_id: EventId,
        ticket_type_id: TicketTypeId,
        user_id: UserId,
    ) -> Result<Option<Reservation>> {
        self.reservations
            .get(&ReservationKey::new(event_id, ticket_type_id, user_id))
            .await
    }

    // ==================== Accessors ====================

    /// Get the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get the shard router.
    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    /// Get the ledger.
    pub fn ledger(&self) -> &StockLedger {
        &self.ledger
    }

    /// Get the cache tier.
    pub fn cache(&self) -> &Arc<CacheTier> {
        &self.cache
    }

    /// Get the metrics.
    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Metrics in Prometheus text format.
    pub fn metrics_text(&self) -> String {
        self.refresh_cache_metrics();
        self.metrics.to_prometheus()
    }

    /// Check latency and success-rate thresholds.
    pub fn health(&self) -> HealthReport {
        self.refresh_cache_metrics();
        self.metrics.check_health()
    }

    fn refresh_cache_metrics(&self) {
        let hotspot = self.cache.hotspot();
        self.metrics.update_cache_stats(
            &self.cache.stats(),
            hotspot.hot_keys().len(),
            hotspot.promotions(),
        );
    }

    // ==================== Internals ====================

    async fn initialize_inner(&self, stock: StockKey, total: u64) -> Result<()> {
        let parts = self.router.split(total)?;
        let layout = self.ledger.initialize(&stock, &parts).await?;
        for shard_id in 0..layout.shard_count {
            self.cache.invalidate(&stock.shard(shard_id)).await;
        }
        Ok(())
    }

    async fn lock_inner(&self, key: ReservationKey, quantity: u32) -> Result<()> {
        self.validate_quantity(quantity)?;
        let stock = key.stock_key();
        let layout = self.ledger.layout(&stock).await?;
        let _guard = self.key_guard(key).await;

        if let Some(existing) = self.reservations.get(&key).await? {
            if existing.state == ReservationState::Settling || !existing.is_expired(now_ms()) {
                return Err(ValidationError::DuplicateReservation {
                    user_id: key.user_id,
                }
                .into());
            }
            self.release_reservation(&existing).await?;
            self.metrics.reservations_expired.inc();
            debug!(reservation = %key, "Released expired reservation before relocking");
        }

        let reservation = Reservation::acquiring(key, quantity, self.config.reservation_ttl);
        if !self.reservations.insert(&reservation).await? {
            return Err(ValidationError::DuplicateReservation {
                user_id: key.user_id,
            }
            .into());
        }

        let deadline = Instant::now() + self.config.lock.scan_timeout;
        loop {
            let epoch = self.rollback_epoch(&stock);
            let scan = self
                .scan_shards(key, quantity, layout.shard_count, deadline)
                .await;

            if scan.remaining == 0 {
                let mut held = self
                    .reservations
                    .get(&key)
                    .await?
                    .ok_or_else(|| Error::Internal(format!("reservation {} vanished", key)))?;
                held.state = ReservationState::Held;
                self.reservations.save(&held).await?;
                return Ok(());
            }

            // Bumped on both sides of the rollback so a concurrent scan
            // sees it whether it finishes before or after the units land.
            let allocated = quantity - scan.remaining;
            let mut own_bumps = 0;
            if allocated > 0 {
                self.bump_rollback_epoch(stock);
                own_bumps += 1;
            }
            let returned = match self.compensate(&key).await {
                Ok(returned) => returned,
                Err(e) => {
                    self.metrics.compensation_failures.inc();
                    error!(
                        reservation = %key,
                        allocated,
                        error = %e,
                        "Failed to roll back partial allocation, leaving it to expiry"
                    );
                    return Err(e);
                }
            };

            if returned > 0 {
                self.bump_rollback_epoch(stock);
                own_bumps += 1;
            }

            // Units another lock rolled back during this scan may have been
            // missed; rescan instead of reporting a false shortage.
            let others = self.rollback_epoch(&stock) - epoch - own_bumps;
            let shortage = scan.failure.is_none() && scan.timeout.is_none();
            if shortage && others > 0 && Instant::now() < deadline {
                debug!(reservation = %key, "Scan raced with a rollback, rescanning");
                continue;
            }

            self.reservations.remove(&key).await?;
            return Err(scan.failure.or(scan.timeout).unwrap_or(Error::InsufficientStock {
                requested: quantity,
                available: allocated,
            }));
        }
    }

    /// Allocate from shards in scan order until `quantity` is covered, the
    /// shards are exhausted, or the deadline passes.
    async fn scan_shards(
        &self,
        key: ReservationKey,
        quantity: u32,
        shard_count: u32,
        deadline: Instant,
    ) -> ScanOutcome {
        let stock = key.stock_key();
        let mut outcome = ScanOutcome {
            remaining: quantity,
            timeout: None,
            failure: None,
        };

        for shard_id in self.router.scan_order(key.user_id, key.event_id, shard_count) {
            if outcome.remaining == 0 {
                break;
            }
            let shard = stock.shard(shard_id);
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                outcome.timeout = Some(Error::LockTimeout {
                    key: shard.lock_key(),
                });
                break;
            }

            let op = ShardOp::Allocate {
                reservation: key,
                max_quantity: outcome.remaining,
            };
            match self
                .writer
                .apply(&shard, op, self.config.lock.wait_timeout.min(left))
                .await
            {
                Ok(taken) => {
                    outcome.remaining -= taken;
                    debug!(
                        event_id = key.event_id,
                        ticket_type_id = key.ticket_type_id,
                        shard_id,
                        user_id = key.user_id,
                        quantity = taken,
                        "Allocated from shard"
                    );
                }
                Err(e @ Error::LockTimeout { .. }) => {
                    debug!(shard = %shard, "Shard lock busy, skipping");
                    outcome.timeout = Some(e);
                }
                Err(e) => {
                    outcome.failure = Some(e);
                    break;
                }
            }
        }

        outcome
    }

    /// Return every unit a failed scan allocated. The reservation itself is
    /// kept. Returns the number of units returned.
    async fn compensate(&self, key: &ReservationKey) -> Result<u32> {
        let Some(reservation) = self.reservations.get(key).await? else {
            return Ok(0);
        };

        let mut returned = 0;
        for &shard_id in reservation.allocation.keys() {
            let shard = key.stock_key().shard(shard_id);
            let quantity = self
                .writer
                .apply(
                    &shard,
                    ShardOp::Release { reservation: *key },
                    self.config.lock.wait_timeout,
                )
                .await?;
            returned += quantity;
            self.metrics.compensations.inc();
            warn!(shard = %shard, quantity, reservation = %key, "Compensated partial allocation");
        }

        Ok(returned)
    }

    fn rollback_epoch(&self, stock: &StockKey) -> u64 {
        self.rollback_epochs.get(stock).map(|e| *e).unwrap_or(0)
    }

    fn bump_rollback_epoch(&self, stock: StockKey) {
        *self.rollback_epochs.entry(stock).or_insert(0) += 1;
    }

    async fn release_inner(&self, key: ReservationKey, quantity: u32) -> Result<()> {
        if quantity == 0 {
            return Err(ValidationError::ZeroQuantity.into());
        }
        let _guard = self.key_guard(key).await;

        let reservation = self.live_reservation(&key, quantity).await?;
        if reservation.state == ReservationState::Settling {
            return Err(ValidationError::ReservationSettling {
                user_id: key.user_id,
            }
            .into());
        }

        self.release_reservation(&reservation).await
    }

    async fn deduct_inner(&self, key: ReservationKey, quantity: u32) -> Result<()> {
        if quantity == 0 {
            return Err(ValidationError::ZeroQuantity.into());
        }
        let _guard = self.key_guard(key).await;

        let mut reservation = self.live_reservation(&key, quantity).await?;

        match &self.settlement {
            None => {
                if reservation.state != ReservationState::Settling {
                    reservation.state = ReservationState::Settling;
                    self.reservations.save(&reservation).await?;
                }
                self.settle_now(&reservation).await
            }
            Some(handle) => {
                if reservation.state == ReservationState::Settling {
                    return Err(ValidationError::ReservationSettling {
                        user_id: key.user_id,
                    }
                    .into());
                }
                reservation.state = ReservationState::Settling;
                self.reservations.save(&reservation).await?;

                let event = SettlementEvent::new(key, reservation.allocation.clone());
                if let Err(e) = handle.try_enqueue(event) {
                    reservation.state = ReservationState::Held;
                    if let Err(revert) = self.reservations.save(&reservation).await {
                        error!(
                            reservation = %key,
                            error = %revert,
                            "Failed to return unqueued reservation to held"
                        );
                    }
                    return Err(e);
                }
                debug!(reservation = %key, quantity, "Queued settlement");
                Ok(())
            }
        }
    }

    /// Settle every shard of a reservation inline, then drop it.
    async fn settle_now(&self, reservation: &Reservation) -> Result<()> {
        let stock = reservation.key.stock_key();
        for &shard_id in reservation.allocation.keys() {
            self.writer
                .apply(
                    &stock.shard(shard_id),
                    ShardOp::Settle {
                        reservations: vec![reservation.key],
                    },
                    self.config.lock.wait_timeout,
                )
                .await?;
        }
        self.reservations.remove(&reservation.key).await?;
        Ok(())
    }

    /// Load a reservation that `deduct`/`release` may act on.
    async fn live_reservation(&self, key: &ReservationKey, quantity: u32) -> Result<Reservation> {
        let reservation = match self.reservations.get(key).await? {
            Some(r) if r.state != ReservationState::Acquiring => r,
            _ => {
                return Err(ValidationError::ReservationNotFound {
                    user_id: key.user_id,
                }
                .into())
            }
        };

        if reservation.quantity != quantity {
            return Err(ValidationError::QuantityMismatch {
                reserved: reservation.quantity,
                requested: quantity,
            }
            .into());
        }
        Ok(reservation)
    }

    /// Return a reservation's units and delete it.
    async fn release_reservation(&self, reservation: &Reservation) -> Result<()> {
        let stock = reservation.key.stock_key();
        for &shard_id in reservation.allocation.keys() {
            self.writer
                .apply(
                    &stock.shard(shard_id),
                    ShardOp::Release {
                        reservation: reservation.key,
                    },
                    self.config.lock.wait_timeout,
                )
                .await?;
        }
        self.reservations.remove(&reservation.key).await?;
        Ok(())
    }

    async fn expire_inner(&self) -> Result<usize> {
        let expired = self.reservations.list_expired(now_ms()).await?;
        let mut released = 0;

        for candidate in expired {
            if candidate.state == ReservationState::Settling {
                continue;
            }
            let key = candidate.key;
            let _guard = self.key_guard(key).await;

            // Re-check under the key guard.
            let current = match self.reservations.get(&key).await {
                Ok(Some(r)) => r,
                Ok(None) => continue,
                Err(e) => {
                    warn!(reservation = %key, error = %e, "Failed to load expired reservation");
                    continue;
                }
            };
            if current.state == ReservationState::Settling || !current.is_expired(now_ms()) {
                continue;
            }

            match self.release_reservation(&current).await {
                Ok(()) => {
                    released += 1;
                    self.metrics.reservations_expired.inc();
                    debug!(reservation = %key, quantity = current.quantity, "Expired reservation");
                }
                Err(e) => {
                    warn!(reservation = %key, error = %e, "Failed to release expired reservation");
                }
            }
        }

        Ok(released)
    }

    async fn aggregate_inner(&self, stock: StockKey) -> Result<AggregateStock> {
        let layout = self.ledger.layout(&stock).await?;
        let mut aggregate = AggregateStock::default();
        for shard_id in 0..layout.shard_count {
            aggregate.add(&self.read_shard(&stock.shard(shard_id)).await?);
        }
        Ok(aggregate)
    }

    async fn shard_inner(&self, stock: StockKey, shard_id: ShardId) -> Result<StockCounters> {
        let layout = self.ledger.layout(&stock).await?;
        if shard_id >= layout.shard_count {
            return Err(ValidationError::ShardOutOfRange {
                shard_id,
                shard_count: layout.shard_count,
            }
            .into());
        }
        self.read_shard(&stock.shard(shard_id)).await
    }

    async fn read_shard(&self, shard: &ShardKey) -> Result<StockCounters> {
        self.cache
            .get_or_load(shard, || self.ledger.read(shard))
            .await
    }

    fn validate_quantity(&self, quantity: u32) -> Result<()> {
        if quantity == 0 {
            return Err(ValidationError::ZeroQuantity.into());
        }
        let limit = self.config.max_quantity_per_request;
        if quantity > limit {
            return Err(ValidationError::QuantityTooLarge { quantity, limit }.into());
        }
        Ok(())
    }

    async fn key_guard(&self, key: ReservationKey) -> KeyGuard<'_> {
        let mutex = self.key_locks.entry(key).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: &self.key_locks,
            key,
            guard: Some(guard),
        }
    }
}

impl std::fmt::Debug for InventoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryEngine")
            .field("config", &self.config)
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("active_keys", &self.key_locks.len())
            .finish_non_exhaustive()
    }
}

/// Result of one pass over the shards.
struct ScanOutcome {
    remaining: u32,
    timeout: Option<Error>,
    failure: Option<Error>,
}

/// Holds a reservation key's in-process mutex; drops the map entry when
/// nobody else is waiting on it.
struct KeyGuard<'a> {
    locks: &'a DashMap<ReservationKey, Arc<tokio::sync::Mutex<()>>>,
    key: ReservationKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Periodically release expired reservations until shutdown or until the
/// engine is dropped.
async fn run_reaper(
    engine: Weak<InventoryEngine>,
    period: Duration,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                match engine.expire_reservations().await {
                    Ok(0) => {}
                    Ok(released) => info!(released, "Released expired reservations"),
                    Err(e) => warn!(error = %e, "Reservation reaper pass failed"),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Reservation reaper shutting down");
                break;
            }
        }
    }
}
