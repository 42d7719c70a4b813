//! Asynchronous batch settlement.
//!
//! `deduct` in batched mode marks the reservation `Settling` and queues a
//! [`SettlementEvent`]. One consumer task buffers events per ticket type and,
//! on a fixed timer, flushes every buffer that reached the batch threshold or
//! whose oldest event has lingered too long:
//!
//! ```text
//!   deduct ──try_send──► [ bounded queue ] ──► buffers: StockKey → events
//!                                                   │  tick
//!                                                   ▼
//!                         coalesce by shard: Σ quantity, reservations
//!                                                   │
//!                                                   ▼
//!                         ShardWriter::apply(Settle) under the shard lock
//! ```
//!
//! Only the "sold" counter lags; "available" and "locked" were already
//! updated when the stock was locked.

use crate::config::{LockConfig, SettlementConfig};
use crate::engine::{ShardOp, ShardWriter};
use crate::error::{DependencyError, Error, Result};
use crate::metrics::EngineMetrics;
use crate::reservation::{ReservationKey, ReservationState, ReservationStore};
use crate::types::{ShardId, StockKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// A reservation's locked units waiting to become sold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub reservation: ReservationKey,
    /// Units to settle per shard.
    pub allocation: BTreeMap<ShardId, u32>,
}

impl SettlementEvent {
    /// Create a settlement event.
    pub fn new(reservation: ReservationKey, allocation: BTreeMap<ShardId, u32>) -> Self {
        Self {
            reservation,
            allocation,
        }
    }

    /// Total units across shards.
    pub fn quantity(&self) -> u32 {
        self.allocation.values().sum()
    }

    /// Serialize for a durable channel.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from a durable channel.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Coalesced shard updates applied.
    pub shards_applied: usize,
    /// Reservation/shard pairs settled.
    pub allocations_settled: usize,
    /// Units moved from locked to sold.
    pub units_settled: u64,
    /// Shard updates that failed and were kept for the next flush.
    pub shards_failed: usize,
}

impl FlushReport {
    fn merge(&mut self, other: FlushReport) {
        self.shards_applied += other.shards_applied;
        self.allocations_settled += other.allocations_settled;
        self.units_settled += other.units_settled;
        self.shards_failed += other.shards_failed;
    }
}

/// Message consumed by the pipeline task.
#[derive(Debug)]
pub enum SettlementCommand {
    /// Buffer an event.
    Settle(SettlementEvent),
    /// Flush every buffer now and report.
    Flush(oneshot::Sender<FlushReport>),
}

/// Producer side of the settlement queue.
#[derive(Debug, Clone)]
pub struct SettlementHandle {
    tx: mpsc::Sender<SettlementCommand>,
    capacity: usize,
}

impl SettlementHandle {
    /// Queue an event without waiting.
    ///
    /// Fails with [`Error::Backpressure`] when the queue is full.
    pub fn try_enqueue(&self, event: SettlementEvent) -> Result<()> {
        match self.tx.try_send(SettlementCommand::Settle(event)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::Backpressure {
                pending: self.pending(),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(channel_closed()),
        }
    }

    /// Flush every buffer and wait for the result.
    pub async fn flush(&self) -> Result<FlushReport> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SettlementCommand::Flush(reply_tx))
            .await
            .map_err(|_| channel_closed())?;
        reply_rx.await.map_err(|_| channel_closed())
    }

    /// Commands waiting in the queue.
    pub fn pending(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }
}

fn channel_closed() -> Error {
    DependencyError::Channel("settlement pipeline stopped".into()).into()
}

#[derive(Debug)]
struct Buffer {
    events: Vec<SettlementEvent>,
    oldest: Instant,
}

/// Consumer task that buffers, coalesces and applies settlements.
#[derive(Debug)]
pub struct BatchSettlementPipeline {
    config: SettlementConfig,
    lock_config: LockConfig,
    writer: Arc<ShardWriter>,
    reservations: Arc<dyn ReservationStore>,
    metrics: Arc<EngineMetrics>,
    buffers: HashMap<StockKey, Buffer>,
}

impl BatchSettlementPipeline {
    /// Create the bounded queue feeding a pipeline.
    pub fn channel(capacity: usize) -> (SettlementHandle, mpsc::Receiver<SettlementCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            SettlementHandle {
                tx,
                capacity: capacity.max(1),
            },
            rx,
        )
    }

    /// Create a pipeline.
    pub fn new(
        config: SettlementConfig,
        lock_config: LockConfig,
        writer: Arc<ShardWriter>,
        reservations: Arc<dyn ReservationStore>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            config,
            lock_config,
            writer,
            reservations,
            metrics,
            buffers: HashMap::new(),
        }
    }

    /// Events currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffers.values().map(|b| b.events.len()).sum()
    }

    /// Run until `shutdown_rx` fires or every producer is dropped, then
    /// drain the queue and flush everything.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<SettlementCommand>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(self.config.flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            batch_threshold = self.config.batch_threshold,
            "Settlement pipeline started"
        );

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        info!("Settlement queue closed");
                        break;
                    }
                },
                _ = interval.tick() => {
                    self.flush_due().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Settlement pipeline shutting down");
                    while let Ok(command) = rx.try_recv() {
                        self.handle(command).await;
                    }
                    break;
                }
            }
        }

        self.flush_all().await;
        let left = self.buffered();
        if left > 0 {
            error!(
                events = left,
                "Settlement pipeline stopped with unflushed events; reservations stay settling"
            );
        }
    }

    async fn handle(&mut self, command: SettlementCommand) {
        match command {
            SettlementCommand::Settle(event) => self.push(event),
            SettlementCommand::Flush(reply) => {
                let report = self.flush_all().await;
                let _ = reply.send(report);
            }
        }
    }

    /// Buffer an event under its ticket type.
    pub fn push(&mut self, event: SettlementEvent) {
        let key = event.reservation.stock_key();
        self.buffers
            .entry(key)
            .or_insert_with(|| Buffer {
                events: Vec::new(),
                oldest: Instant::now(),
            })
            .events
            .push(event);
        self.update_pending();
    }

    /// Flush buffers that reached the threshold or lingered too long.
    pub async fn flush_due(&mut self) -> FlushReport {
        let due: Vec<StockKey> = self
            .buffers
            .iter()
            .filter(|(_, b)| {
                b.events.len() >= self.config.batch_threshold
                    || b.oldest.elapsed() >= self.config.max_linger
            })
            .map(|(k, _)| *k)
            .collect();

        self.flush_keys(due).await
    }

    /// Flush every buffer.
    pub async fn flush_all(&mut self) -> FlushReport {
        let keys: Vec<StockKey> = self.buffers.keys().copied().collect();
        self.flush_keys(keys).await
    }

    async fn flush_keys(&mut self, keys: Vec<StockKey>) -> FlushReport {
        let mut report = FlushReport::default();
        if keys.is_empty() {
            return report;
        }

        let start = Instant::now();
        for key in keys {
            report.merge(self.flush_key(key).await);
        }
        self.metrics.flush_latency.observe_duration([], start.elapsed());
        self.update_pending();

        if report.shards_applied > 0 || report.shards_failed > 0 {
            info!(
                shards = report.shards_applied,
                allocations = report.allocations_settled,
                units = report.units_settled,
                failed = report.shards_failed,
                "Flushed settlement batch"
            );
        }
        report
    }

    async fn flush_key(&mut self, key: StockKey) -> FlushReport {
        let mut report = FlushReport::default();
        let Some(buffer) = self.buffers.remove(&key) else {
            return report;
        };

        let groups = match self.coalesce(buffer.events.clone()).await {
            Ok(groups) => groups,
            Err(e) => {
                warn!(
                    event_id = key.event_id,
                    ticket_type_id = key.ticket_type_id,
                    error = %e,
                    "Could not load reservations for settlement, retrying next flush"
                );
                self.buffers.insert(key, buffer);
                report.shards_failed += 1;
                return report;
            }
        };

        let mut retry = Vec::new();
        for (shard_id, members) in groups {
            let reservations: Vec<ReservationKey> = members.iter().map(|(r, _)| *r).collect();
            let shard = key.shard(shard_id);

            let result = self
                .writer
                .apply(
                    &shard,
                    ShardOp::Settle { reservations },
                    self.lock_config.wait_timeout,
                )
                .await;

            match result {
                Ok(quantity) => {
                    self.metrics.settlement_batches.inc();
                    self.metrics.settlement_events.inc_by(members.len() as u64);
                    report.shards_applied += 1;
                    report.allocations_settled += members.len();
                    report.units_settled += quantity as u64;
                    debug!(shard = %shard, quantity, "Settled shard batch");
                }
                Err(e) if e.is_retryable() || matches!(e, Error::DependencyUnavailable(_)) => {
                    self.metrics.settlement_failures.inc();
                    report.shards_failed += 1;
                    warn!(shard = %shard, error = %e, "Shard settlement failed, re-buffering");
                    retry.extend(members.into_iter().map(|(reservation, q)| {
                        SettlementEvent::new(reservation, BTreeMap::from([(shard_id, q)]))
                    }));
                }
                Err(e) => {
                    report.shards_failed += 1;
                    error!(
                        shard = %shard,
                        reservations = members.len(),
                        error = %e,
                        "Dropping unsettleable shard batch"
                    );
                    for (reservation, _) in members {
                        self.return_to_held(reservation).await;
                    }
                }
            }
        }

        if !retry.is_empty() {
            self.buffers.insert(
                key,
                Buffer {
                    events: retry,
                    oldest: buffer.oldest,
                },
            );
        }

        report
    }

    /// Hand a dropped reservation back to `Held` so `deduct` can be retried
    /// and the reaper reclaims it on expiry.
    async fn return_to_held(&self, key: ReservationKey) {
        let result = match self.reservations.get(&key).await {
            Ok(Some(mut reservation)) if reservation.state == ReservationState::Settling => {
                reservation.state = ReservationState::Held;
                self.reservations.save(&reservation).await.map(|_| true)
            }
            Ok(_) => Ok(false),
            Err(e) => Err(e),
        };

        match result {
            Ok(true) => {
                self.metrics.settlement_dropped.inc();
                warn!(reservation = %key, "Returned unsettled reservation to held");
            }
            Ok(false) => {}
            Err(e) => error!(
                reservation = %key,
                error = %e,
                "Failed to return unsettled reservation to held"
            ),
        }
    }

    /// Group events by shard, keeping only allocations the reservation still
    /// holds. Duplicate events collapse into one.
    async fn coalesce(
        &self,
        events: Vec<SettlementEvent>,
    ) -> Result<BTreeMap<ShardId, Vec<(ReservationKey, u32)>>> {
        let mut groups: BTreeMap<ShardId, Vec<(ReservationKey, u32)>> = BTreeMap::new();

        for event in events {
            let Some(reservation) = self.reservations.get(&event.reservation).await? else {
                continue;
            };
            if reservation.state != ReservationState::Settling {
                continue;
            }
            for (shard_id, quantity) in event.allocation {
                if reservation.allocation.get(&shard_id) != Some(&quantity) {
                    continue;
                }
                let members = groups.entry(shard_id).or_default();
                if !members.iter().any(|(r, _)| *r == event.reservation) {
                    members.push((event.reservation, quantity));
                }
            }
        }

        Ok(groups)
    }

    fn update_pending(&self) {
        self.metrics.settlement_pending.set(self.buffered() as i64);
    }
}
