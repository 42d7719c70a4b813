//! Reservation store over redis strings with expiry and state indexes.

use crate::error::Result;
use crate::reservation::{Reservation, ReservationKey, ReservationState, ReservationStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::fmt;

const EXPIRY_INDEX: &str = "inventory:reservations:expiry";

const STATES: [ReservationState; 3] = [
    ReservationState::Acquiring,
    ReservationState::Held,
    ReservationState::Settling,
];

/// Write the record and move it to its state set.
///
/// KEYS: record, expiry zset, then one set per state.
/// ARGV: bytes, expiry ms, 1-based index of the target state set,
/// "nx" to refuse overwriting. Returns 1 if written.
const SAVE_SCRIPT: &str = r#"
if ARGV[4] == 'nx' and redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[2], KEYS[1])
for i = 3, #KEYS do
    redis.call('SREM', KEYS[i], KEYS[1])
end
redis.call('SADD', KEYS[2 + tonumber(ARGV[3])], KEYS[1])
return 1
"#;

/// Delete the record and its index entries. Returns 1 if it existed.
const REMOVE_SCRIPT: &str = r#"
local existed = redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], KEYS[1])
for i = 3, #KEYS do
    redis.call('SREM', KEYS[i], KEYS[1])
end
return existed
"#;

/// [`ReservationStore`] keeping bincode records plus two indexes: a sorted
/// set by expiry for the reaper and one set per state for restart recovery.
pub struct RedisReservationStore {
    conn: ConnectionManager,
    save: Script,
    remove: Script,
}

impl RedisReservationStore {
    /// Create a reservation store client.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            save: Script::new(SAVE_SCRIPT),
            remove: Script::new(REMOVE_SCRIPT),
        }
    }

    async fn write(&self, reservation: &Reservation, only_if_absent: bool) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.save.prepare_invoke();
        invocation
            .key(reservation.key.storage_key())
            .key(EXPIRY_INDEX);
        for state in STATES {
            invocation.key(state_key(state));
        }
        let written: i64 = invocation
            .arg(reservation.to_bytes()?)
            .arg(reservation.expires_at_ms)
            .arg(state_slot(reservation.state))
            .arg(if only_if_absent { "nx" } else { "" })
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    /// Load the records behind a list of record keys, skipping any that
    /// were removed after the index was read.
    async fn load_all(&self, record_keys: Vec<String>) -> Result<Vec<Reservation>> {
        if record_keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let records: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(&record_keys)
            .query_async(&mut conn)
            .await?;
        records
            .into_iter()
            .flatten()
            .map(|bytes| Reservation::from_bytes(&bytes))
            .collect()
    }
}

#[async_trait]
impl ReservationStore for RedisReservationStore {
    async fn insert(&self, reservation: &Reservation) -> Result<bool> {
        self.write(reservation, true).await
    }

    async fn get(&self, key: &ReservationKey) -> Result<Option<Reservation>> {
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = conn.get(key.storage_key()).await?;
        bytes.map(|b| Reservation::from_bytes(&b)).transpose()
    }

    async fn save(&self, reservation: &Reservation) -> Result<()> {
        self.write(reservation, false).await?;
        Ok(())
    }

    async fn remove(&self, key: &ReservationKey) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.remove.prepare_invoke();
        invocation.key(key.storage_key()).key(EXPIRY_INDEX);
        for state in STATES {
            invocation.key(state_key(state));
        }
        let existed: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(existed == 1)
    }

    async fn list_expired(&self, now_ms: u64) -> Result<Vec<Reservation>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.zrangebyscore(EXPIRY_INDEX, 0, now_ms).await?;
        let reservations = self.load_all(keys).await?;
        Ok(reservations
            .into_iter()
            .filter(|r| r.is_expired(now_ms))
            .collect())
    }

    async fn list_by_state(&self, state: ReservationState) -> Result<Vec<Reservation>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.smembers(state_key(state)).await?;
        let reservations = self.load_all(keys).await?;
        Ok(reservations.into_iter().filter(|r| r.state == state).collect())
    }
}

impl fmt::Debug for RedisReservationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisReservationStore").finish_non_exhaustive()
    }
}

fn state_key(state: ReservationState) -> String {
    let name = match state {
        ReservationState::Acquiring => "acquiring",
        ReservationState::Held => "held",
        ReservationState::Settling => "settling",
    };
    format!("inventory:reservations:state:{}", name)
}

/// 1-based position of the state's set among the script's state keys.
fn state_slot(state: ReservationState) -> usize {
    STATES.iter().position(|s| *s == state).unwrap_or(0) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_slots_match_key_order() {
        for (i, state) in STATES.iter().enumerate() {
            assert_eq!(state_slot(*state), i + 1);
        }
    }

    #[test]
    fn test_state_keys_distinct() {
        assert_eq!(
            state_key(ReservationState::Settling),
            "inventory:reservations:state:settling"
        );
        assert_ne!(
            state_key(ReservationState::Held),
            state_key(ReservationState::Acquiring)
        );
    }
}
