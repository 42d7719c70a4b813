//! Segment locks guarding individual stock shards.
//!
//! A [`DistributedLock`] provides fleet-wide mutual exclusion per key with a
//! bounded wait and a lease. An expired lease can be taken over by another
//! caller without an explicit release. Failing to acquire within the wait is
//! reported as `Ok(None)`; `Err` is reserved for an unreachable lock service.
//!
//! [`with_lock`] runs a body under a lock and always releases it afterwards.
//!
//! Locks are reentrant per owner: [`DistributedLock::acquire_as`] with a
//! token that already holds the key succeeds at once and adds a hold, and
//! the key is freed when every hold has been released. Across owners the
//! lock is exclusive. [`DistributedLock::acquire`] mints a fresh owner, so
//! two plain acquires of one key never nest.

mod memory;

pub use memory::InMemoryLock;

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Proof of ownership returned by a successful acquire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Generate a fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Token as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mutual exclusion per key with bounded wait and lease.
#[async_trait]
pub trait DistributedLock: Send + Sync + fmt::Debug {
    /// Acquire `key`, waiting at most `wait`. The lock is released
    /// automatically once `lease` elapses.
    ///
    /// Returns `Ok(None)` if the lock could not be acquired in time.
    async fn acquire(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockToken>> {
        let owner = LockToken::generate();
        Ok(self
            .acquire_as(key, &owner, wait, lease)
            .await?
            .then_some(owner))
    }

    /// Acquire `key` on behalf of `owner`, waiting at most `wait`.
    ///
    /// If `owner` already holds `key` this adds a hold and renews the lease
    /// without waiting. Returns `false` if the lock could not be acquired
    /// in time.
    async fn acquire_as(
        &self,
        key: &str,
        owner: &LockToken,
        wait: Duration,
        lease: Duration,
    ) -> Result<bool>;

    /// Drop one hold of `key` by `token`; the key is free once none remain.
    ///
    /// Returns `false` if the lease had already expired or was taken over.
    async fn release(&self, key: &str, token: &LockToken) -> Result<bool>;

    /// Whether `key` is currently held by `token`.
    async fn is_held(&self, key: &str, token: &LockToken) -> Result<bool>;
}

/// Run `body` while holding `key`.
///
/// Returns [`Error::LockTimeout`] without running the body if the lock is not
/// acquired within `wait`. The lock is released on every exit path of the
/// body; a failed release is logged, since the lease bounds how long the key
/// stays blocked.
pub async fn with_lock<L, F, Fut, T>(
    lock: &L,
    key: &str,
    wait: Duration,
    lease: Duration,
    body: F,
) -> Result<T>
where
    L: DistributedLock + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let token = match lock.acquire(key, wait, lease).await? {
        Some(token) => token,
        None => {
            return Err(Error::LockTimeout {
                key: key.to_string(),
            })
        }
    };

    let result = body().await;

    match lock.release(key, &token).await {
        Ok(true) => {}
        Ok(false) => warn!(key, "Lock lease expired before release"),
        Err(e) => warn!(key, error = %e, "Failed to release lock"),
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_with_lock_runs_body_and_releases() {
        let lock = InMemoryLock::new();
        let value = with_lock(&lock, "k", Duration::from_millis(50), Duration::from_secs(1), || async {
            Ok(7)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);

        let token = lock
            .acquire("k", Duration::from_millis(10), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(token.is_some());
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let lock = InMemoryLock::new();
        let result: Result<()> =
            with_lock(&lock, "k", Duration::from_millis(50), Duration::from_secs(1), || async {
                Err(Error::Internal("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(!lock.is_locked("k"));
    }

    #[tokio::test]
    async fn test_with_lock_timeout_skips_body() {
        let lock = InMemoryLock::new();
        let _held = lock
            .acquire("k", Duration::from_millis(10), Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        let ran = AtomicBool::new(false);
        let result = with_lock(&lock, "k", Duration::from_millis(20), Duration::from_secs(1), || async {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(Error::LockTimeout { ref key }) if key == "k"));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_nested_with_lock_under_same_owner() {
        let lock = InMemoryLock::new();
        let owner = LockToken::generate();
        assert!(lock
            .acquire_as("k", &owner, Duration::ZERO, Duration::from_secs(1))
            .await
            .unwrap());

        // A different owner still times out while the outer hold is live.
        let result = with_lock(&lock, "k", Duration::from_millis(20), Duration::from_secs(1), || async {
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::LockTimeout { .. })));

        assert!(lock
            .acquire_as("k", &owner, Duration::ZERO, Duration::from_secs(1))
            .await
            .unwrap());
        assert!(lock.release("k", &owner).await.unwrap());
        assert!(lock.is_locked("k"));
        assert!(lock.release("k", &owner).await.unwrap());
        assert!(!lock.is_locked("k"));
    }
}
