//! Stock ledger over redis hashes.

use crate::error::{Error, Result, ValidationError};
use crate::ledger::LedgerStore;
use crate::types::{ShardKey, ShardLayout, StockCounters, StockKey};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::fmt;

/// Create the hash only if the key is free. Returns 1 on create.
const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'total', ARGV[1], 'available', ARGV[2],
    'locked', ARGV[3], 'sold', ARGV[4], 'version', ARGV[5])
return 1
"#;

/// Replace the hash if its version matches ARGV[1].
///
/// Replies `{0}` on success, `{1, actual}` on conflict, `{2}` if missing.
const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current then
    return {2}
end
if current ~= ARGV[1] then
    return {1, tonumber(current)}
end
redis.call('HSET', KEYS[1], 'total', ARGV[2], 'available', ARGV[3],
    'locked', ARGV[4], 'sold', ARGV[5], 'version', ARGV[6])
return {0}
"#;

/// [`LedgerStore`] keeping one hash per shard, readable with `HGETALL`.
pub struct RedisLedgerStore {
    conn: ConnectionManager,
    create: Script,
    cas: Script,
}

impl RedisLedgerStore {
    /// Create a ledger store client.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            create: Script::new(CREATE_SCRIPT),
            cas: Script::new(CAS_SCRIPT),
        }
    }
}

#[async_trait]
impl LedgerStore for RedisLedgerStore {
    async fn get(&self, shard: &ShardKey) -> Result<Option<StockCounters>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, u64> = conn.hgetall(shard.storage_key()).await?;
        decode_counters(shard, &fields)
    }

    async fn create(&self, shard: &ShardKey, counters: StockCounters) -> Result<bool> {
        let mut conn = self.conn.clone();
        let created: i64 = self
            .create
            .key(shard.storage_key())
            .arg(counters.total)
            .arg(counters.available)
            .arg(counters.locked)
            .arg(counters.sold)
            .arg(counters.version)
            .invoke_async(&mut conn)
            .await?;
        Ok(created == 1)
    }

    async fn compare_and_set(
        &self,
        shard: &ShardKey,
        expected_version: u64,
        next: StockCounters,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let reply: Vec<u64> = self
            .cas
            .key(shard.storage_key())
            .arg(expected_version)
            .arg(next.total)
            .arg(next.available)
            .arg(next.locked)
            .arg(next.sold)
            .arg(next.version)
            .invoke_async(&mut conn)
            .await?;

        match reply.as_slice() {
            [0] => Ok(()),
            [1, actual] => Err(Error::VersionConflict {
                expected: expected_version,
                actual: *actual,
            }),
            [2] => Err(ValidationError::NotInitialized {
                event_id: shard.event_id,
                ticket_type_id: shard.ticket_type_id,
            }
            .into()),
            other => Err(Error::store(format!(
                "unexpected compare-and-set reply for {}: {:?}",
                shard, other
            ))),
        }
    }

    async fn get_layout(&self, key: &StockKey) -> Result<Option<ShardLayout>> {
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = conn.get(key.layout_key()).await?;
        match bytes {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_layout_if_absent(&self, key: &StockKey, layout: ShardLayout) -> Result<bool> {
        let mut conn = self.conn.clone();
        let bytes = bincode::serialize(&layout)?;
        let created: bool = conn.set_nx(key.layout_key(), bytes).await?;
        Ok(created)
    }
}

impl fmt::Debug for RedisLedgerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLedgerStore").finish_non_exhaustive()
    }
}

/// Rebuild counters from a shard hash. An empty hash is a missing shard.
fn decode_counters(
    shard: &ShardKey,
    fields: &HashMap<String, u64>,
) -> Result<Option<StockCounters>> {
    if fields.is_empty() {
        return Ok(None);
    }

    let field = |name: &str| -> Result<u64> {
        fields
            .get(name)
            .copied()
            .ok_or_else(|| Error::store(format!("shard {} is missing field {}", shard, name)))
    };
    let counter = |name: &str| -> Result<u32> {
        u32::try_from(field(name)?)
            .map_err(|_| Error::store(format!("shard {} field {} overflows", shard, name)))
    };

    let counters = StockCounters {
        total: counter("total")?,
        available: counter("available")?,
        locked: counter("locked")?,
        sold: counter("sold")?,
        version: field("version")?,
    };
    if !counters.is_consistent() {
        return Err(Error::Internal(format!(
            "shard {} breaks conservation: {:?}",
            shard, counters
        )));
    }
    Ok(Some(counters))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_decode_missing_shard() {
        let shard = ShardKey::new(1, 1, 0);
        assert_eq!(decode_counters(&shard, &HashMap::new()).unwrap(), None);
    }

    #[test]
    fn test_decode_counters() {
        let shard = ShardKey::new(1, 1, 0);
        let hash = fields(&[
            ("total", 10),
            ("available", 6),
            ("locked", 3),
            ("sold", 1),
            ("version", 4),
        ]);
        let counters = decode_counters(&shard, &hash).unwrap().unwrap();
        assert_eq!(counters.available, 6);
        assert_eq!(counters.version, 4);
    }

    #[test]
    fn test_decode_rejects_partial_hash() {
        let shard = ShardKey::new(1, 1, 0);
        let hash = fields(&[("total", 10), ("available", 10)]);
        assert!(decode_counters(&shard, &hash).is_err());
    }

    #[test]
    fn test_decode_rejects_broken_conservation() {
        let shard = ShardKey::new(1, 1, 0);
        let hash = fields(&[
            ("total", 10),
            ("available", 10),
            ("locked", 1),
            ("sold", 0),
            ("version", 1),
        ]);
        assert!(matches!(
            decode_counters(&shard, &hash),
            Err(Error::Internal(_))
        ));
    }
}
