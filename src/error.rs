//! Error types for the inventory engine.

use crate::types::ShardId;
use thiserror::Error;

/// Result type alias for inventory engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the inventory engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input, rejected before any lock is attempted.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Not enough available stock at the time of the request.
    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: u32, available: u32 },

    /// A segment lock was not acquired within the wait bound.
    #[error("lock timeout on {key}")]
    LockTimeout { key: String },

    /// A ledger update was rejected because the shard moved underneath it.
    #[error("version conflict: expected {expected}, actual {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    /// A backing service (lock, store, cache, channel) could not be reached.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(#[from] DependencyError),

    /// The settlement queue is full.
    #[error("settlement queue full ({pending} pending)")]
    Backpressure { pending: usize },

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. } | Error::VersionConflict { .. } | Error::Backpressure { .. }
        )
    }

    /// Stable label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::InsufficientStock { .. } => "insufficient_stock",
            Error::LockTimeout { .. } => "lock_timeout",
            Error::VersionConflict { .. } => "version_conflict",
            Error::DependencyUnavailable(_) => "dependency_unavailable",
            Error::Backpressure { .. } => "backpressure",
            Error::Config(_) => "config",
            Error::Internal(_) => "internal",
        }
    }

    /// Shorthand for a store failure.
    pub(crate) fn store(reason: impl Into<String>) -> Self {
        Error::DependencyUnavailable(DependencyError::Store(reason.into()))
    }
}

/// Input validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Quantity must be positive.
    #[error("quantity must be greater than zero")]
    ZeroQuantity,

    /// Quantity exceeds the per-request ceiling.
    #[error("quantity {quantity} exceeds limit {limit}")]
    QuantityTooLarge { quantity: u32, limit: u32 },

    /// Total stock must be positive.
    #[error("total stock must be greater than zero")]
    EmptyStock,

    /// Total stock needs more shards than allowed.
    #[error("total {total} needs {required} shards, limit is {limit}")]
    TooManyShards { total: u64, required: u64, limit: u32 },

    /// Shard index outside the ticket type's layout.
    #[error("shard {shard_id} out of range (shard count {shard_count})")]
    ShardOutOfRange { shard_id: ShardId, shard_count: u32 },

    /// Shards already exist for this ticket type.
    #[error("inventory already initialized for event {event_id}, ticket type {ticket_type_id}")]
    AlreadyInitialized { event_id: u64, ticket_type_id: u64 },

    /// No shards exist for this ticket type.
    #[error("inventory not initialized for event {event_id}, ticket type {ticket_type_id}")]
    NotInitialized { event_id: u64, ticket_type_id: u64 },

    /// The user already holds a live reservation for this ticket type.
    #[error("reservation already exists for user {user_id}")]
    DuplicateReservation { user_id: u64 },

    /// No live reservation for this key.
    #[error("no reservation for user {user_id}")]
    ReservationNotFound { user_id: u64 },

    /// Requested quantity differs from the reserved quantity.
    #[error("quantity mismatch: reserved {reserved}, requested {requested}")]
    QuantityMismatch { reserved: u32, requested: u32 },

    /// The reservation is already queued for settlement.
    #[error("reservation for user {user_id} is settling")]
    ReservationSettling { user_id: u64 },
}

/// Backing service failures.
#[derive(Error, Debug)]
pub enum DependencyError {
    /// Lock service failure.
    #[error("lock service: {0}")]
    Lock(String),

    /// Ledger or reservation store failure.
    #[error("store: {0}")]
    Store(String),

    /// Shared cache tier failure.
    #[error("shared cache: {0}")]
    Cache(String),

    /// Settlement channel failure.
    #[error("settlement channel: {0}")]
    Channel(String),

    /// Serialization error.
    #[error("serialization: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::DependencyUnavailable(DependencyError::Serialization(e.to_string()))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::DependencyUnavailable(DependencyError::Store(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::LockTimeout { key: "k".into() }.is_retryable());
        assert!(Error::VersionConflict { expected: 1, actual: 2 }.is_retryable());
        assert!(!Error::InsufficientStock { requested: 2, available: 1 }.is_retryable());
        assert!(!Error::from(ValidationError::ZeroQuantity).is_retryable());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(Error::store("down").kind(), "dependency_unavailable");
        assert_eq!(
            Error::InsufficientStock { requested: 1, available: 0 }.kind(),
            "insufficient_stock"
        );
        assert_eq!(Error::from(ValidationError::EmptyStock).kind(), "validation");
    }
}
