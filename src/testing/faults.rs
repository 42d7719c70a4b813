//! Fault injection for backend dependencies.
//!
//! Wrappers around the backend traits that fail on demand, driven by a shared
//! [`FaultController`]. Faults are off until [`FaultController::enable`].

use crate::error::{DependencyError, Error, Result};
use crate::ledger::LedgerStore;
use crate::lock::{DistributedLock, LockToken};
use crate::types::{ShardKey, ShardLayout, StockCounters, StockKey};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for fault injection.
#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// Probability that a call fails (0.0 - 1.0).
    pub failure_probability: f64,

    /// Delay added to every call while enabled.
    pub delay: Option<Duration>,

    /// Random seed for reproducibility.
    pub seed: Option<u64>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            failure_probability: 0.0,
            delay: None,
            seed: None,
        }
    }
}

impl FaultConfig {
    /// Every call fails.
    pub fn outage() -> Self {
        Self {
            failure_probability: 1.0,
            ..Default::default()
        }
    }

    /// Calls fail with the given probability.
    pub fn flaky(probability: f64, seed: u64) -> Self {
        Self {
            failure_probability: probability,
            seed: Some(seed),
            ..Default::default()
        }
    }

    /// No failures, only latency.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }
}

/// Decides when wrapped backends fail.
#[derive(Debug)]
pub struct FaultController {
    config: Mutex<FaultConfig>,
    enabled: AtomicBool,
    rng: Mutex<StdRng>,
    injected: AtomicU64,
}

impl FaultController {
    /// Create a disabled controller.
    pub fn new(config: FaultConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config: Mutex::new(config),
            enabled: AtomicBool::new(false),
            rng: Mutex::new(rng),
            injected: AtomicU64::new(0),
        }
    }

    /// Controller that fails every call once enabled.
    pub fn outage() -> Self {
        Self::new(FaultConfig::outage())
    }

    /// Start injecting faults.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Stop injecting faults.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Whether faults are being injected.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Replace the configuration.
    pub fn set_config(&self, config: FaultConfig) {
        *self.config.lock() = config;
    }

    /// Number of faults injected so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    /// Sleep for the configured delay, then decide whether this call fails.
    pub async fn check(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let (delay, probability) = {
            let config = self.config.lock();
            (config.delay, config.failure_probability)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fail = probability > 0.0 && self.rng.lock().gen_bool(probability.min(1.0));
        if fail {
            self.injected.fetch_add(1, Ordering::Relaxed);
        }
        fail
    }
}

/// A lock service that fails on demand.
#[derive(Debug)]
pub struct FaultyLock {
    inner: Arc<dyn DistributedLock>,
    faults: Arc<FaultController>,
}

impl FaultyLock {
    /// Wrap a lock.
    pub fn new(inner: Arc<dyn DistributedLock>, faults: Arc<FaultController>) -> Self {
        Self { inner, faults }
    }
}

fn lock_down() -> Error {
    DependencyError::Lock("injected fault".into()).into()
}

#[async_trait]
impl DistributedLock for FaultyLock {
    async fn acquire_as(
        &self,
        key: &str,
        owner: &LockToken,
        wait: Duration,
        lease: Duration,
    ) -> Result<bool> {
        if self.faults.check().await {
            return Err(lock_down());
        }
        self.inner.acquire_as(key, owner, wait, lease).await
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        // Release always reaches the inner lock so a fault never strands it.
        self.inner.release(key, token).await
    }

    async fn is_held(&self, key: &str, token: &LockToken) -> Result<bool> {
        if self.faults.check().await {
            return Err(lock_down());
        }
        self.inner.is_held(key, token).await
    }
}

/// A ledger store that fails on demand.
///
/// Besides outright failures it can lose the acknowledgement of the next
/// write: the write lands but the caller sees an error, as after a crash
/// between the store write and the reply.
#[derive(Debug)]
pub struct FaultyLedgerStore {
    inner: Arc<dyn LedgerStore>,
    faults: Arc<FaultController>,
    lose_next_ack: AtomicBool,
}

impl FaultyLedgerStore {
    /// Wrap a ledger store.
    pub fn new(inner: Arc<dyn LedgerStore>, faults: Arc<FaultController>) -> Self {
        Self {
            inner,
            faults,
            lose_next_ack: AtomicBool::new(false),
        }
    }

    /// Make the next successful compare-and-set report a failure.
    pub fn lose_next_ack(&self) {
        self.lose_next_ack.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerStore for FaultyLedgerStore {
    async fn get(&self, shard: &ShardKey) -> Result<Option<StockCounters>> {
        if self.faults.check().await {
            return Err(Error::store("injected fault"));
        }
        self.inner.get(shard).await
    }

    async fn create(&self, shard: &ShardKey, counters: StockCounters) -> Result<bool> {
        if self.faults.check().await {
            return Err(Error::store("injected fault"));
        }
        self.inner.create(shard, counters).await
    }

    async fn compare_and_set(
        &self,
        shard: &ShardKey,
        expected_version: u64,
        next: StockCounters,
    ) -> Result<()> {
        if self.faults.check().await {
            return Err(Error::store("injected fault"));
        }
        self.inner
            .compare_and_set(shard, expected_version, next)
            .await?;
        if self.lose_next_ack.swap(false, Ordering::SeqCst) {
            return Err(Error::store("injected lost acknowledgement"));
        }
        Ok(())
    }

    async fn get_layout(&self, key: &StockKey) -> Result<Option<ShardLayout>> {
        if self.faults.check().await {
            return Err(Error::store("injected fault"));
        }
        self.inner.get_layout(key).await
    }

    async fn put_layout_if_absent(&self, key: &StockKey, layout: ShardLayout) -> Result<bool> {
        if self.faults.check().await {
            return Err(Error::store("injected fault"));
        }
        self.inner.put_layout_if_absent(key, layout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedgerStore;
    use crate::lock::InMemoryLock;

    #[tokio::test]
    async fn test_disabled_controller_never_fails() {
        let faults = FaultController::outage();
        assert!(!faults.check().await);
        faults.enable();
        assert!(faults.check().await);
        faults.disable();
        assert!(!faults.check().await);
        assert_eq!(faults.injected(), 1);
    }

    #[tokio::test]
    async fn test_faulty_lock() {
        let faults = Arc::new(FaultController::outage());
        let lock = FaultyLock::new(Arc::new(InMemoryLock::new()), faults.clone());

        let token = lock
            .acquire("k", Duration::ZERO, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        faults.enable();
        let err = lock
            .acquire("k2", Duration::ZERO, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "dependency_unavailable");
        assert!(lock.release("k", &token).await.unwrap());
    }

    #[tokio::test]
    async fn test_lost_ack_still_writes() {
        let inner = Arc::new(InMemoryLedgerStore::new());
        let store = FaultyLedgerStore::new(inner.clone(), Arc::new(FaultController::outage()));
        let shard = ShardKey::new(1, 1, 0);
        store.create(&shard, StockCounters::initial(5)).await.unwrap();

        let next = StockCounters::initial(5)
            .apply(crate::types::StockDelta::lock(1))
            .unwrap();
        store.lose_next_ack();
        assert!(store.compare_and_set(&shard, 0, next).await.is_err());
        assert_eq!(inner.get(&shard).await.unwrap(), Some(next));

        let again = next.apply(crate::types::StockDelta::lock(1)).unwrap();
        store.compare_and_set(&shard, 1, again).await.unwrap();
    }
}
