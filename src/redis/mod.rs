//! Redis-backed implementations of the engine's backends.
//!
//! All backends share one [`ConnectionManager`], which multiplexes commands
//! over a single connection and reconnects on failure. Atomic read-modify-write
//! steps (lock release, ledger compare-and-set, reservation insert) run as Lua
//! scripts so no other client can interleave.
//!
//! # Key layout
//!
//! ```text
//! inventory:lock:{event}:{type}:{shard}          hash    owner token -> holds (PEXPIRE lease)
//! inventory:shard:{event}:{type}:{shard}         hash    total/available/locked/sold/version
//! inventory:shard:count:{event}:{type}           string  bincode ShardLayout
//! inventory:stock:{event}:{type}:{shard}         string  cached snapshot (EX ttl)
//! inventory:reservation:{event}:{type}:{user}    string  bincode Reservation
//! inventory:reservations:expiry                  zset    reservation key by expiry ms
//! inventory:reservations:state:{state}           set     reservation keys per state
//! inventory:journal:{event}:{type}:{shard}       hash    op id -> bincode JournalEntry
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use shardstock::redis::RedisBackends;
//! use shardstock::{EngineConfig, InventoryEngine};
//!
//! # async fn example() -> shardstock::Result<()> {
//! let config = EngineConfig::new(20);
//! let backends = RedisBackends::connect("redis://127.0.0.1:6379", &config).await?;
//! let engine = backends.install(InventoryEngine::builder(config)).build()?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod journal;
mod ledger;
mod lock;
mod reservation;

pub use cache::RedisSharedCache;
pub use journal::RedisJournal;
pub use ledger::RedisLedgerStore;
pub use lock::RedisLock;
pub use reservation::RedisReservationStore;

use crate::config::EngineConfig;
use crate::engine::EngineBuilder;
use crate::error::{Error, Result};
use redis::aio::ConnectionManager;
use redis::Client;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Open a connection manager for `redis_url`.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager> {
    let client = Client::open(redis_url)
        .map_err(|e| Error::Config(format!("invalid redis url {}: {}", redis_url, e)))?;
    let manager = ConnectionManager::new(client).await?;
    info!(url = %redis_url, "Connected to redis");
    Ok(manager)
}

/// Every backend the engine needs, sharing one connection.
#[derive(Clone)]
pub struct RedisBackends {
    pub lock: Arc<RedisLock>,
    pub ledger: Arc<RedisLedgerStore>,
    pub journal: Arc<RedisJournal>,
    pub cache: Arc<RedisSharedCache>,
    pub reservations: Arc<RedisReservationStore>,
}

impl RedisBackends {
    /// Connect and build all backends. Lock retries follow `config.lock`.
    pub async fn connect(redis_url: &str, config: &EngineConfig) -> Result<Self> {
        let conn = connect(redis_url).await?;
        Ok(Self::from_connection(conn, config))
    }

    /// Build all backends over an existing connection.
    pub fn from_connection(conn: ConnectionManager, config: &EngineConfig) -> Self {
        Self {
            lock: Arc::new(RedisLock::new(conn.clone(), config.lock.retry_interval)),
            ledger: Arc::new(RedisLedgerStore::new(conn.clone())),
            journal: Arc::new(RedisJournal::new(conn.clone())),
            cache: Arc::new(RedisSharedCache::new(conn.clone())),
            reservations: Arc::new(RedisReservationStore::new(conn)),
        }
    }

    /// Plug every backend into an engine builder.
    pub fn install(&self, builder: EngineBuilder) -> EngineBuilder {
        builder
            .with_lock(self.lock.clone())
            .with_ledger_store(self.ledger.clone())
            .with_journal(self.journal.clone())
            .with_shared_cache(self.cache.clone())
            .with_reservation_store(self.reservations.clone())
    }
}

impl fmt::Debug for RedisBackends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackends").finish_non_exhaustive()
    }
}
