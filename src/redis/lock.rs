//! Segment locks over a redis hash of owner to hold count.

use crate::error::{DependencyError, Error, Result};
use crate::lock::{DistributedLock, LockToken};
use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Take or re-enter the lock and renew its lease.
///
/// ARGV: owner token, lease ms. Returns 1 if the owner now holds the key.
const ACQUIRE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 or redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
    redis.call('HINCRBY', KEYS[1], ARGV[1], 1)
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

/// Drop one hold; delete the key when the last one goes.
///
/// ARGV: owner token. Returns 1 if the owner held the key.
const RELEASE_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then
    return 0
end
if redis.call('HINCRBY', KEYS[1], ARGV[1], -1) <= 0 then
    redis.call('DEL', KEYS[1])
end
return 1
"#;

/// Lock whose lease lives in redis, so it survives the holder's process.
///
/// Acquisition polls every `retry_interval` plus up to half of it again in
/// random jitter, until the wait budget runs out.
pub struct RedisLock {
    conn: ConnectionManager,
    retry_interval: Duration,
    acquire: Script,
    release: Script,
}

impl RedisLock {
    /// Create a lock client.
    pub fn new(conn: ConnectionManager, retry_interval: Duration) -> Self {
        Self {
            conn,
            retry_interval,
            acquire: Script::new(ACQUIRE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    async fn try_acquire(&self, key: &str, token: &LockToken, lease: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let taken: i64 = self
            .acquire
            .key(key)
            .arg(token.as_str())
            .arg(lease_ms(lease))
            .invoke_async(&mut conn)
            .await
            .map_err(lock_error)?;
        Ok(taken == 1)
    }

    fn backoff(&self) -> Duration {
        let jitter_ceiling = (self.retry_interval.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
        self.retry_interval + Duration::from_millis(jitter)
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire_as(
        &self,
        key: &str,
        owner: &LockToken,
        wait: Duration,
        lease: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + wait;

        loop {
            if self.try_acquire(key, owner, lease).await? {
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                trace!(key = %key, "Lock wait budget exhausted");
                return Ok(false);
            }
            tokio::time::sleep(self.backoff().min(deadline - now)).await;
        }
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        let mut conn = self.conn.clone();
        let held: i64 = self
            .release
            .key(key)
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(lock_error)?;
        Ok(held == 1)
    }

    async fn is_held(&self, key: &str, token: &LockToken) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.hexists(key, token.as_str()).await.map_err(lock_error)
    }
}

impl fmt::Debug for RedisLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLock")
            .field("retry_interval", &self.retry_interval)
            .finish_non_exhaustive()
    }
}

/// Lease in milliseconds, never zero (redis rejects `PX 0`).
fn lease_ms(lease: Duration) -> u64 {
    (lease.as_millis() as u64).max(1)
}

fn lock_error(e: RedisError) -> Error {
    Error::DependencyUnavailable(DependencyError::Lock(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_never_zero() {
        assert_eq!(lease_ms(Duration::ZERO), 1);
        assert_eq!(lease_ms(Duration::from_millis(500)), 500);
        assert_eq!(lease_ms(Duration::from_secs(5)), 5000);
    }

    #[test]
    fn test_lock_error_is_lock_dependency() {
        let err = lock_error(RedisError::from((redis::ErrorKind::IoError, "down")));
        assert!(matches!(
            err,
            Error::DependencyUnavailable(DependencyError::Lock(_))
        ));
    }
}
