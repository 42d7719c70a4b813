//! In-process segment lock.

use super::{DistributedLock, LockToken};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct Holder {
    token: LockToken,
    holds: u32,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LockSlot {
    holder: Option<Holder>,
    notify: Arc<Notify>,
}

impl LockSlot {
    fn live_holder(&self, now: Instant) -> Option<&Holder> {
        self.holder.as_ref().filter(|h| h.expires_at > now)
    }
}

/// Lock table shared by every task in one process.
///
/// Waiters park on a per-key [`Notify`] and wake either on release or when
/// the current lease runs out, whichever comes first.
#[derive(Debug, Default)]
pub struct InMemoryLock {
    slots: Mutex<HashMap<String, LockSlot>>,
}

impl InMemoryLock {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is held by anyone with a live lease.
    pub fn is_locked(&self, key: &str) -> bool {
        self.slots
            .lock()
            .get(key)
            .is_some_and(|slot| slot.live_holder(Instant::now()).is_some())
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn acquire_as(
        &self,
        key: &str,
        owner: &LockToken,
        wait: Duration,
        lease: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + wait;

        loop {
            let (notify, lease_end) = {
                let mut slots = self.slots.lock();
                let slot = slots.entry(key.to_string()).or_default();
                let now = Instant::now();
                let live = slot
                    .live_holder(now)
                    .map(|h| (&h.token == owner, h.expires_at));
                match live {
                    Some((true, _)) => {
                        if let Some(holder) = slot.holder.as_mut() {
                            holder.holds += 1;
                            holder.expires_at = now + lease;
                        }
                        return Ok(true);
                    }
                    Some((false, expires_at)) => (slot.notify.clone(), expires_at),
                    None => {
                        slot.holder = Some(Holder {
                            token: owner.clone(),
                            holds: 1,
                            expires_at: now + lease,
                        });
                        return Ok(true);
                    }
                }
            };

            if Instant::now() >= deadline {
                return Ok(false);
            }

            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep_until(deadline.min(lease_end)) => {}
            }
        }
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            return Ok(false);
        };

        let owned = slot.holder.as_ref().is_some_and(|h| &h.token == token);
        if !owned {
            return Ok(false);
        }

        if slot.live_holder(Instant::now()).is_none() {
            slot.holder = None;
            slot.notify.notify_one();
            return Ok(false);
        }

        if let Some(holder) = slot.holder.as_mut() {
            holder.holds -= 1;
            if holder.holds > 0 {
                return Ok(true);
            }
        }
        slot.holder = None;
        slot.notify.notify_one();
        Ok(true)
    }

    async fn is_held(&self, key: &str, token: &LockToken) -> Result<bool> {
        Ok(self
            .slots
            .lock()
            .get(key)
            .and_then(|slot| slot.live_holder(Instant::now()))
            .is_some_and(|h| &h.token == token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_acquire_and_release() {
        let lock = InMemoryLock::new();
        let token = lock
            .acquire("a", Duration::from_millis(10), LEASE)
            .await
            .unwrap()
            .unwrap();

        assert!(lock.is_held("a", &token).await.unwrap());
        assert!(lock.is_locked("a"));
        assert!(lock.release("a", &token).await.unwrap());
        assert!(!lock.is_locked("a"));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let lock = InMemoryLock::new();
        let a = lock.acquire("a", Duration::ZERO, LEASE).await.unwrap();
        let b = lock.acquire("b", Duration::ZERO, LEASE).await.unwrap();
        assert!(a.is_some());
        assert!(b.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let lock = InMemoryLock::new();
        let _token = lock.acquire("a", Duration::ZERO, LEASE).await.unwrap().unwrap();

        let start = Instant::now();
        let second = lock
            .acquire("a", Duration::from_millis(100), LEASE)
            .await
            .unwrap();
        assert!(second.is_none());
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < LEASE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_reclaimable() {
        let lock = InMemoryLock::new();
        let stale = lock
            .acquire("a", Duration::ZERO, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();

        let fresh = lock
            .acquire("a", Duration::from_millis(200), LEASE)
            .await
            .unwrap()
            .unwrap();

        assert_ne!(stale, fresh);
        assert!(!lock.is_held("a", &stale).await.unwrap());
        assert!(!lock.release("a", &stale).await.unwrap());
        assert!(lock.is_held("a", &fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let lock = Arc::new(InMemoryLock::new());
        let token = lock.acquire("a", Duration::ZERO, LEASE).await.unwrap().unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire("a", Duration::from_secs(2), LEASE).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lock.release("a", &token).await.unwrap());

        let acquired = waiter.await.unwrap().unwrap();
        assert!(acquired.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_reenters_other_owner_waits() {
        let lock = InMemoryLock::new();
        let owner = LockToken::generate();
        assert!(lock.acquire_as("a", &owner, Duration::ZERO, LEASE).await.unwrap());
        assert!(lock.acquire_as("a", &owner, Duration::ZERO, LEASE).await.unwrap());

        let other = LockToken::generate();
        assert!(!lock
            .acquire_as("a", &other, Duration::from_millis(50), LEASE)
            .await
            .unwrap());

        // The outer hold keeps the key after the inner one is dropped.
        assert!(lock.release("a", &owner).await.unwrap());
        assert!(lock.is_held("a", &owner).await.unwrap());
        assert!(!lock
            .acquire_as("a", &other, Duration::from_millis(50), LEASE)
            .await
            .unwrap());

        assert!(lock.release("a", &owner).await.unwrap());
        assert!(!lock.is_locked("a"));
        assert!(lock.acquire_as("a", &other, Duration::ZERO, LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_with_wrong_token() {
        let lock = InMemoryLock::new();
        let _token = lock.acquire("a", Duration::ZERO, LEASE).await.unwrap().unwrap();
        assert!(!lock.release("a", &LockToken::generate()).await.unwrap());
        assert!(lock.is_locked("a"));
    }
}
