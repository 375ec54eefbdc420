use std::time::Duration;

use async_trait::async_trait;

use crate::error::CourierError;

/// Key-value store primitives the lock manager is built on.
///
/// Every method must be atomic on the store side: the lock manager never combines
/// a read and a write into a decision of its own. Unreachable stores and timeouts
/// must surface as `CourierError::Unavailable`.
///
/// Read/write locks address a single base `key`; implementations derive the reader
/// set and writer slot from it (e.g. `{key}:readers` and `{key}:writer`, sharing
/// the `{key}` hash tag).
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Returns the backend identifier (e.g., "memory", "redis").
    fn backend_name(&self) -> &'static str;

    // =========================================================================
    // Exclusive locks
    // =========================================================================

    /// Set `key` to `value` with expiry `ttl` only if it does not exist.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, CourierError>;

    /// Delete `key` only if it currently holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, CourierError>;

    /// Reset the expiry of `key` to `ttl` only if it currently holds `value`.
    async fn expire_if_equals(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CourierError>;

    /// Get the current value of `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, CourierError>;

    /// Check whether `key` exists (and has not expired).
    async fn exists(&self, key: &str) -> Result<bool, CourierError>;

    /// Remaining time-to-live of `key`, `None` if it does not exist.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CourierError>;

    /// Delete `key` unconditionally.
    async fn delete(&self, key: &str) -> Result<bool, CourierError>;

    // =========================================================================
    // Read/write locks
    // =========================================================================

    /// Add `reader` to the reader set of `key` unless a writer holds it.
    async fn try_add_reader(
        &self,
        key: &str,
        reader: &str,
        ttl: Duration,
    ) -> Result<bool, CourierError>;

    /// Remove `reader` from the reader set of `key`.
    async fn remove_reader(&self, key: &str, reader: &str) -> Result<bool, CourierError>;

    /// Check whether `reader` holds a live read lease on `key`.
    async fn has_reader(&self, key: &str, reader: &str) -> Result<bool, CourierError>;

    /// Number of live readers on `key`.
    async fn reader_count(&self, key: &str) -> Result<usize, CourierError>;

    /// Claim the writer slot of `key` unless any live reader or another writer holds it.
    async fn try_set_writer(
        &self,
        key: &str,
        writer: &str,
        ttl: Duration,
    ) -> Result<bool, CourierError>;

    /// Release the writer slot of `key` only if `writer` holds it.
    async fn remove_writer(&self, key: &str, writer: &str) -> Result<bool, CourierError>;

    /// Current writer of `key`, if any.
    async fn writer(&self, key: &str) -> Result<Option<String>, CourierError>;
}
