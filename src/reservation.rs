//! Reservations: stock held for one buyer of one ticket type.
//!
//! A reservation records the exact shard → quantity allocation a successful
//! `lock` produced, so `release` and `deduct` reverse or commit precisely
//! those amounts.
//!
//! ```text
//!            lock                  deduct (batched)
//!   Acquiring ────► Held ──────────────────────► Settling ──► (removed)
//!       │            │  release / expiry / deduct (immediate)
//!       └────────────┴──────────────────────────────────────► (removed)
//! ```

use crate::error::Result;
use crate::types::{now_ms, EventId, ShardId, StockKey, TicketTypeId, UserId};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Identity of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationKey {
    pub event_id: EventId,
    pub ticket_type_id: TicketTypeId,
    pub user_id: UserId,
}

impl ReservationKey {
    /// Create a new reservation key.
    pub fn new(event_id: EventId, ticket_type_id: TicketTypeId, user_id: UserId) -> Self {
        Self {
            event_id,
            ticket_type_id,
            user_id,
        }
    }

    /// The ticket type reserved from.
    pub fn stock_key(&self) -> StockKey {
        StockKey::new(self.event_id, self.ticket_type_id)
    }

    /// Key of the persisted reservation record.
    pub fn storage_key(&self) -> String {
        format!(
            "inventory:reservation:{}:{}:{}",
            self.event_id, self.ticket_type_id, self.user_id
        )
    }
}

impl fmt::Display for ReservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/user:{}", self.event_id, self.ticket_type_id, self.user_id)
    }
}

/// Lifecycle state of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationState {
    /// Written before any shard lock is taken; allocation may be partial.
    Acquiring,
    /// Fully allocated and waiting for deduct or release.
    Held,
    /// Queued for batch settlement.
    Settling,
}

/// Stock held for one buyer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub key: ReservationKey,
    /// Identity of this acquisition. A relock of the same key gets a new one.
    pub attempt: Uuid,
    /// Requested quantity.
    pub quantity: u32,
    /// Units held per shard.
    pub allocation: BTreeMap<ShardId, u32>,
    pub state: ReservationState,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

impl Reservation {
    /// New reservation in the `Acquiring` state with an empty allocation.
    pub fn acquiring(key: ReservationKey, quantity: u32, ttl: Duration) -> Self {
        let now = now_ms();
        Self {
            key,
            attempt: Uuid::new_v4(),
            quantity,
            allocation: BTreeMap::new(),
            state: ReservationState::Acquiring,
            created_at_ms: now,
            expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
        }
    }

    /// Units allocated across all shards.
    pub fn allocated(&self) -> u32 {
        self.allocation.values().sum()
    }

    /// Whether the allocation covers the requested quantity.
    pub fn is_satisfied(&self) -> bool {
        self.allocated() >= self.quantity
    }

    /// Whether the lease has run out at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Serialize for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from storage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Persistence for reservations.
#[async_trait]
pub trait ReservationStore: Send + Sync + fmt::Debug {
    /// Store a new reservation. Returns `false` if the key already exists.
    async fn insert(&self, reservation: &Reservation) -> Result<bool>;

    /// Load a reservation.
    async fn get(&self, key: &ReservationKey) -> Result<Option<Reservation>>;

    /// Create or overwrite a reservation.
    async fn save(&self, reservation: &Reservation) -> Result<()>;

    /// Delete a reservation. Returns `false` if it did not exist.
    async fn remove(&self, key: &ReservationKey) -> Result<bool>;

    /// Reservations whose lease expired at or before `now_ms`.
    async fn list_expired(&self, now_ms: u64) -> Result<Vec<Reservation>>;

    /// Reservations in the given state.
    async fn list_by_state(&self, state: ReservationState) -> Result<Vec<Reservation>>;
}

/// In-memory reservation store.
#[derive(Debug, Default)]
pub struct InMemoryReservationStore {
    reservations: RwLock<HashMap<ReservationKey, Reservation>>,
}

impl InMemoryReservationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored reservations.
    pub fn len(&self) -> usize {
        self.reservations.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.reservations.read().is_empty()
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    async fn insert(&self, reservation: &Reservation) -> Result<bool> {
        let mut reservations = self.reservations.write();
        if reservations.contains_key(&reservation.key) {
            return Ok(false);
        }
        reservations.insert(reservation.key, reservation.clone());
        Ok(true)
    }

    async fn get(&self, key: &ReservationKey) -> Result<Option<Reservation>> {
        Ok(self.reservations.read().get(key).cloned())
    }

    async fn save(&self, reservation: &Reservation) -> Result<()> {
        self.reservations
            .write()
            .insert(reservation.key, reservation.clone());
        Ok(())
    }

    async fn remove(&self, key: &ReservationKey) -> Result<bool> {
        Ok(self.reservations.write().remove(key).is_some())
    }

    async fn list_expired(&self, now_ms: u64) -> Result<Vec<Reservation>> {
        Ok(self
            .reservations
            .read()
            .values()
            .filter(|r| r.is_expired(now_ms))
            .cloned()
            .collect())
    }

    async fn list_by_state(&self, state: ReservationState) -> Result<Vec<Reservation>> {
        Ok(self
            .reservations
            .read()
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(user_id: UserId) -> Reservation {
        Reservation::acquiring(ReservationKey::new(1, 1, user_id), 3, Duration::from_secs(60))
    }

    #[test]
    fn test_allocation_accounting() {
        let mut r = reservation(7);
        assert_eq!(r.state, ReservationState::Acquiring);
        assert!(!r.is_satisfied());

        r.allocation.insert(2, 1);
        r.allocation.insert(3, 2);
        assert_eq!(r.allocated(), 3);
        assert!(r.is_satisfied());
    }

    #[test]
    fn test_expiry() {
        let r = reservation(7);
        assert!(!r.is_expired(r.created_at_ms));
        assert!(r.is_expired(r.expires_at_ms));
    }

    #[test]
    fn test_storage_key() {
        let key = ReservationKey::new(1, 2, 3);
        assert_eq!(key.storage_key(), "inventory:reservation:1:2:3");
        assert_eq!(key.stock_key(), StockKey::new(1, 2));
    }

    #[test]
    fn test_reservation_bytes() {
        let mut r = reservation(9);
        r.allocation.insert(4, 3);
        let decoded = Reservation::from_bytes(&r.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, r);
    }

    #[tokio::test]
    async fn test_store_insert_is_exclusive() {
        let store = InMemoryReservationStore::new();
        let r = reservation(7);
        assert!(store.insert(&r).await.unwrap());
        assert!(!store.insert(&r).await.unwrap());
        assert_eq!(store.len(), 1);

        assert!(store.remove(&r.key).await.unwrap());
        assert!(!store.remove(&r.key).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_store_listing() {
        let store = InMemoryReservationStore::new();
        let mut held = reservation(1);
        held.state = ReservationState::Held;
        let mut expired = reservation(2);
        expired.expires_at_ms = 0;

        store.save(&held).await.unwrap();
        store.save(&expired).await.unwrap();

        let listed = store.list_expired(now_ms()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key.user_id, 2);

        let listed = store.list_by_state(ReservationState::Held).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key.user_id, 1);
    }
}
