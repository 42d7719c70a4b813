//! Shard journal over redis hashes.

use crate::error::Result;
use crate::ledger::{Journal, JournalEntry};
use crate::types::ShardKey;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::fmt;
use uuid::Uuid;

/// [`Journal`] with one hash per shard, keyed by op id.
#[derive(Clone)]
pub struct RedisJournal {
    conn: ConnectionManager,
}

impl RedisJournal {
    /// Create a journal client.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

fn journal_key(shard: &ShardKey) -> String {
    format!(
        "inventory:journal:{}:{}:{}",
        shard.event_id, shard.ticket_type_id, shard.shard_id
    )
}

#[async_trait]
impl Journal for RedisJournal {
    async fn begin(&self, entry: &JournalEntry) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(
                journal_key(&entry.shard),
                entry.op_id.to_string(),
                entry.to_bytes()?,
            )
            .await?;
        Ok(())
    }

    async fn commit(&self, shard: &ShardKey, op_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(journal_key(shard), op_id.to_string()).await?;
        Ok(())
    }

    async fn open_entries(&self, shard: &ShardKey) -> Result<Vec<JournalEntry>> {
        let mut conn = self.conn.clone();
        let values: Vec<Vec<u8>> = conn.hvals(journal_key(shard)).await?;

        values
            .iter()
            .map(|bytes| JournalEntry::from_bytes(bytes))
            .collect()
    }
}

impl fmt::Debug for RedisJournal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisJournal").finish_non_exhaustive()
    }
}
