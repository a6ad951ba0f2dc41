//! Key-value store abstraction used for cache blobs, idempotency records,
//! and counters.
//!
//! The gateway only ever talks to the store through the narrow [`KvStore`]
//! trait: `GET`, `SET` with TTL, atomic `SET`-if-absent with TTL, `DELETE`,
//! `INCR`, `EXPIRE`, and pattern `KEYS`. Two backends exist:
//!
//! - [`RedisStore`]: the production backend, built on a reconnecting
//!   connection manager.
//! - [`MemoryStore`]: a process-local map with TTL semantics, used by tests
//!   and as the degraded mode when no Redis URL is configured (or Redis is
//!   unreachable at startup).
//!
//! Store failures are never fatal to a request: callers treat every error
//! as a miss or a no-op and log it.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

/// Errors surfaced by a key-value store backend.
///
/// Consumers degrade gracefully on every variant; the distinction exists
/// for logging.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("store connection error: {0}")]
    Connection(String),
    /// The backend answered, but the exchange failed.
    #[error("store operation error: {0}")]
    Operation(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Operation(err.to_string())
        }
    }
}

/// Narrow asynchronous key-value interface.
///
/// All values are strings (serialised JSON at the call sites). TTLs are
/// mandatory on writes so no key can outlive its purpose.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetches the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Stores `value` under `key` with the given TTL, replacing any
    /// existing value.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Atomically stores `value` under `key` with the given TTL only if the
    /// key does not exist. Returns `true` when this call performed the
    /// write.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Removes `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Returns whether `key` currently exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically increments the integer stored at `key`, creating it at 0
    /// first if missing. Returns the new value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Sets a TTL on an existing key. Returns `false` if the key is
    /// missing.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Returns all keys matching a glob-style pattern.
    ///
    /// Used only by cache invalidation; never on the hot path.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}
