use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::store::LockStore;
use crate::error::{CourierError, WithLockError};

/// Timing and naming defaults for the lock manager.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Prefix applied to every lock key (`{namespace}:{key}`). Empty means no prefix.
    pub namespace: String,
    /// Wait time used by `lock` and `with_default_lock`.
    pub default_wait: Duration,
    /// Lease used by `lock` and `with_default_lock`.
    pub default_lease: Duration,
    /// First pause between acquisition attempts.
    pub retry_base: Duration,
    /// Upper bound for the pause between acquisition attempts.
    pub retry_max: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            namespace: "lock".to_string(),
            default_wait: Duration::from_secs(10),
            default_lease: Duration::from_secs(30),
            retry_base: Duration::from_millis(50),
            retry_max: Duration::from_secs(1),
        }
    }
}

/// Which flavour of lock a token was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Exclusive,
    Read,
    Write,
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockKind::Exclusive => write!(f, "exclusive"),
            LockKind::Read => write!(f, "read"),
            LockKind::Write => write!(f, "write"),
        }
    }
}

/// Proof of a successful acquisition.
///
/// The holder identity is an opaque random value bound to this token, not to the
/// task or thread that acquired it. Release, renewal and ownership checks all take
/// the token, so a token can move between tasks freely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    store_key: String,
    holder: String,
    kind: LockKind,
    lease: Duration,
    acquired_at: DateTime<Utc>,
}

impl LockToken {
    /// The caller-facing lock key (without namespace).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The key as written to the store.
    pub fn store_key(&self) -> &str {
        &self.store_key
    }

    /// Opaque holder identity recorded in the store.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }

    /// Lease granted at acquisition (or at the last renewal).
    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

/// Lease-based lock manager over a shared `LockStore`.
///
/// Mutual exclusion relies on the store's atomic set-if-absent; crashed holders are
/// evicted by lease expiry. There is no fencing token: a holder whose lease expired
/// while it was still working can overlap with the next holder without either side
/// noticing.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
    config: Arc<LockConfig>,
}

impl LockManager {
    /// Create a lock manager with default timings.
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self::with_config(store, LockConfig::default())
    }

    pub fn with_config(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Returns the backend identifier of the underlying store.
    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    fn store_key(&self, key: &str) -> String {
        if self.config.namespace.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.config.namespace, key)
        }
    }

    fn rw_store_key(&self, key: &str) -> String {
        if self.config.namespace.is_empty() {
            format!("rw:{}", key)
        } else {
            format!("{}:rw:{}", self.config.namespace, key)
        }
    }

    // =========================================================================
    // Exclusive locks
    // =========================================================================

    /// Acquire `key` with the configured default wait and lease.
    pub async fn lock(&self, key: &str) -> Result<Option<LockToken>, CourierError> {
        self.acquire(key, self.config.default_wait, self.config.default_lease)
            .await
    }

    /// Try to acquire `key` for `lease`, waiting at most `wait`.
    ///
    /// Returns `Ok(None)` on contention. Store failures are returned as errors and
    /// never reported as either outcome.
    pub async fn acquire(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockToken>, CourierError> {
        self.acquire_kind(key, LockKind::Exclusive, wait, lease)
            .await
    }

    /// Non-blocking acquisition: a single attempt.
    pub async fn try_acquire(
        &self,
        key: &str,
        lease: Duration,
    ) -> Result<Option<LockToken>, CourierError> {
        self.acquire(key, Duration::ZERO, lease).await
    }

    /// Release the lock described by `token`.
    ///
    /// Only the recorded holder is removed; if the lease already expired or someone
    /// else holds the key now, this is a no-op returning `false`.
    #[instrument(skip(self, token), level = "debug", fields(key = %token.key, kind = %token.kind))]
    pub async fn release(&self, token: &LockToken) -> Result<bool, CourierError> {
        let released = match token.kind {
            LockKind::Exclusive => {
                self.store
                    .delete_if_equals(&token.store_key, &token.holder)
                    .await?
            }
            LockKind::Read => self.store.remove_reader(&token.store_key, &token.holder).await?,
            LockKind::Write => self.store.remove_writer(&token.store_key, &token.holder).await?,
        };

        if released {
            debug!("Released {} lock on {}", token.kind, token.key);
        } else {
            debug!(
                "Lock on {} no longer held by {} (no-op)",
                token.key, token.holder
            );
        }
        Ok(released)
    }

    /// Extend an exclusive lease, only if `token` still holds it.
    pub async fn renew(
        &self,
        token: &mut LockToken,
        lease: Duration,
    ) -> Result<bool, CourierError> {
        if token.kind != LockKind::Exclusive {
            return Err(CourierError::InvalidArgument(format!(
                "cannot renew a {} lock on {}",
                token.kind, token.key
            )));
        }
        validate_lease(lease)?;

        let renewed = self
            .store
            .expire_if_equals(&token.store_key, &token.holder, lease)
            .await?;
        if renewed {
            token.lease = lease;
            token.acquired_at = Utc::now();
            debug!("Renewed lock on {} for {:?}", token.key, lease);
        }
        Ok(renewed)
    }

    /// Whether `key` is held exclusively, either as a plain lock or as the write
    /// side of a read/write lock. Read leases do not count; see `reader_count`.
    pub async fn is_locked(&self, key: &str) -> Result<bool, CourierError> {
        if key.is_empty() {
            return Ok(false);
        }
        if self.store.exists(&self.store_key(key)).await? {
            return Ok(true);
        }
        self.is_write_locked(key).await
    }

    /// Whether `token` is still the recorded holder of its lock.
    pub async fn is_held_by(&self, token: &LockToken) -> Result<bool, CourierError> {
        match token.kind {
            LockKind::Exclusive => Ok(self
                .store
                .get(&token.store_key)
                .await?
                .is_some_and(|holder| holder == token.holder)),
            LockKind::Read => self.store.has_reader(&token.store_key, &token.holder).await,
            LockKind::Write => Ok(self
                .store
                .writer(&token.store_key)
                .await?
                .is_some_and(|holder| holder == token.holder)),
        }
    }

    /// Remaining lease on `key`, if it is held.
    pub async fn remaining_lease(&self, key: &str) -> Result<Option<Duration>, CourierError> {
        if key.is_empty() {
            return Ok(None);
        }
        self.store.ttl(&self.store_key(key)).await
    }

    /// Release `key` regardless of who holds it.
    ///
    /// Operational recovery only: the current holder keeps running its critical
    /// section while a new holder may already be entering one.
    pub async fn force_release(&self, key: &str) -> Result<bool, CourierError> {
        if key.is_empty() {
            warn!("Ignoring force release of an empty lock key");
            return Ok(false);
        }
        let removed = self.store.delete(&self.store_key(key)).await?;
        warn!("Force-released lock on {} (removed: {})", key, removed);
        Ok(removed)
    }

    /// Acquire `key` and wrap the token in a guard that releases on drop.
    pub async fn guard(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockGuard>, CourierError> {
        Ok(self
            .acquire(key, wait, lease)
            .await?
            .map(|token| LockGuard::new(self.clone(), token)))
    }

    /// Run `body` while holding `key`.
    ///
    /// `body` only runs if the lock is obtained. The lock is released when `body`
    /// returns, fails or panics, and also when this future is dropped mid-way
    /// (the release is then spawned onto the current runtime).
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
        body: F,
    ) -> Result<T, WithLockError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let guard = match self.guard(key, wait, lease).await {
            Ok(Some(guard)) => guard,
            Ok(None) => return Err(WithLockError::NotAcquired(key.to_string())),
            Err(e) => return Err(WithLockError::Lock(e)),
        };

        let result = body().await;

        if let Err(e) = guard.release().await {
            warn!(
                "Failed to release lock on {}: {} (lease will expire)",
                key, e
            );
        }

        result.map_err(WithLockError::Body)
    }

    /// `with_lock` using the configured default wait and lease.
    pub async fn with_default_lock<T, E, F, Fut>(
        &self,
        key: &str,
        body: F,
    ) -> Result<T, WithLockError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.with_lock(
            key,
            self.config.default_wait,
            self.config.default_lease,
            body,
        )
        .await
    }

    // =========================================================================
    // Read/write locks
    // =========================================================================

    /// Acquire a shared read lock. Fails while a writer holds `key`.
    pub async fn acquire_read(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockToken>, CourierError> {
        self.acquire_kind(key, LockKind::Read, wait, lease).await
    }

    /// Acquire the exclusive write lock. Fails while any reader or writer holds `key`.
    pub async fn acquire_write(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockToken>, CourierError> {
        self.acquire_kind(key, LockKind::Write, wait, lease).await
    }

    pub async fn release_read(&self, token: &LockToken) -> Result<bool, CourierError> {
        expect_kind(token, LockKind::Read)?;
        self.release(token).await
    }

    pub async fn release_write(&self, token: &LockToken) -> Result<bool, CourierError> {
        expect_kind(token, LockKind::Write)?;
        self.release(token).await
    }

    /// Whether a writer currently holds `key`.
    pub async fn is_write_locked(&self, key: &str) -> Result<bool, CourierError> {
        if key.is_empty() {
            return Ok(false);
        }
        Ok(self.store.writer(&self.rw_store_key(key)).await?.is_some())
    }

    /// Number of live readers on `key`.
    pub async fn reader_count(&self, key: &str) -> Result<usize, CourierError> {
        if key.is_empty() {
            return Ok(0);
        }
        self.store.reader_count(&self.rw_store_key(key)).await
    }

    // =========================================================================
    // Acquisition loop
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    async fn acquire_kind(
        &self,
        key: &str,
        kind: LockKind,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockToken>, CourierError> {
        if key.is_empty() {
            warn!("Refusing to acquire a {} lock on an empty key", kind);
            return Ok(None);
        }
        validate_lease(lease)?;

        let store_key = match kind {
            LockKind::Exclusive => self.store_key(key),
            LockKind::Read | LockKind::Write => self.rw_store_key(key),
        };
        let holder = Uuid::new_v4().to_string();
        // No representable deadline: wait without bound.
        let deadline = Instant::now().checked_add(wait);
        let mut backoff = self.config.retry_base;
        let mut attempts: u32 = 0;

        loop {
            attempts = attempts.saturating_add(1);
            let claimed = match kind {
                LockKind::Exclusive => {
                    self.store.set_if_absent(&store_key, &holder, lease).await?
                }
                LockKind::Read => self.store.try_add_reader(&store_key, &holder, lease).await?,
                LockKind::Write => self.store.try_set_writer(&store_key, &holder, lease).await?,
            };

            if claimed {
                debug!(
                    "Acquired {} lock on {} for {} after {} attempt(s)",
                    kind, key, holder, attempts
                );
                return Ok(Some(LockToken {
                    key: key.to_string(),
                    store_key,
                    holder,
                    kind,
                    lease,
                    acquired_at: Utc::now(),
                }));
            }

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                debug!(
                    "{} lock on {} not acquired within {:?} ({} attempt(s))",
                    kind, key, wait, attempts
                );
                return Ok(None);
            }

            let remaining = deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(now));
            let jitter_cap = u64::try_from(backoff.as_millis() / 2).unwrap_or(u64::MAX);
            let jitter = if jitter_cap > 0 {
                Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap))
            } else {
                Duration::ZERO
            };
            tokio::time::sleep(backoff.saturating_add(jitter).min(remaining)).await;
            backoff = backoff.saturating_mul(2).min(self.config.retry_max);
        }
    }
}

fn validate_lease(lease: Duration) -> Result<(), CourierError> {
    if lease.is_zero() {
        return Err(CourierError::InvalidArgument(
            "lock lease must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn expect_kind(token: &LockToken, kind: LockKind) -> Result<(), CourierError> {
    if token.kind != kind {
        return Err(CourierError::InvalidArgument(format!(
            "expected a {} lock token for {}, got {}",
            kind, token.key, token.kind
        )));
    }
    Ok(())
}

/// Scoped lock ownership.
///
/// Dropping an unreleased guard spawns the release onto the current tokio runtime.
/// Outside a runtime the lock is left to expire with its lease.
pub struct LockGuard {
    manager: LockManager,
    token: LockToken,
    armed: bool,
}

impl LockGuard {
    fn new(manager: LockManager, token: LockToken) -> Self {
        Self {
            manager,
            token,
            armed: true,
        }
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// Release now and report whether the store still recorded us as the holder.
    pub async fn release(mut self) -> Result<bool, CourierError> {
        self.armed = false;
        self.manager.release(&self.token).await
    }

    /// Give up scoped ownership and hand the token to the caller.
    pub fn into_token(mut self) -> LockToken {
        self.armed = false;
        self.token.clone()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let manager = self.manager.clone();
        let token = self.token.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = manager.release(&token).await {
                        warn!(
                            "Deferred release of lock on {} failed: {} (lease will expire)",
                            token.key, e
                        );
                    }
                });
            }
            Err(_) => warn!(
                "Lock guard for {} dropped outside a runtime; lease will expire",
                token.key
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// A store whose every call fails as if the network were down.
    struct UnreachableStore;

    fn down() -> CourierError {
        CourierError::Unavailable("connection refused".to_string())
    }

    #[async_trait]
    impl LockStore for UnreachableStore {
        fn backend_name(&self) -> &'static str {
            "unreachable"
        }
        async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> Result<bool, CourierError> {
            Err(down())
        }
        async fn delete_if_equals(&self, _: &str, _: &str) -> Result<bool, CourierError> {
            Err(down())
        }
        async fn expire_if_equals(
            &self,
            _: &str,
            _: &str,
            _: Duration,
        ) -> Result<bool, CourierError> {
            Err(down())
        }
        async fn get(&self, _: &str) -> Result<Option<String>, CourierError> {
            Err(down())
        }
        async fn exists(&self, _: &str) -> Result<bool, CourierError> {
            Err(down())
        }
        async fn ttl(&self, _: &str) -> Result<Option<Duration>, CourierError> {
            Err(down())
        }
        async fn delete(&self, _: &str) -> Result<bool, CourierError> {
            Err(down())
        }
        async fn try_add_reader(&self, _: &str, _: &str, _: Duration) -> Result<bool, CourierError> {
            Err(down())
        }
        async fn remove_reader(&self, _: &str, _: &str) -> Result<bool, CourierError> {
            Err(down())
        }
        async fn has_reader(&self, _: &str, _: &str) -> Result<bool, CourierError> {
            Err(down())
        }
        async fn reader_count(&self, _: &str) -> Result<usize, CourierError> {
            Err(down())
        }
        async fn try_set_writer(&self, _: &str, _: &str, _: Duration) -> Result<bool, CourierError> {
            Err(down())
        }
        async fn remove_writer(&self, _: &str, _: &str) -> Result<bool, CourierError> {
            Err(down())
        }
        async fn writer(&self, _: &str) -> Result<Option<String>, CourierError> {
            Err(down())
        }
    }

    fn manager() -> LockManager {
        LockManager::new(Arc::new(UnreachableStore))
    }

    #[tokio::test]
    async fn test_unavailable_store_is_not_contention() {
        let locks = manager();
        let err = locks
            .acquire("user:42", Duration::from_secs(1), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());

        assert!(locks.is_locked("user:42").await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn test_with_lock_reports_store_failure_separately() {
        let locks = manager();
        let mut ran = false;
        let result: Result<(), WithLockError<CourierError>> = locks
            .with_lock("user:42", Duration::ZERO, Duration::from_secs(5), || {
                ran = true;
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(WithLockError::Lock(_))));
        assert!(!ran);
    }

    #[tokio::test]
    async fn test_empty_key_is_never_acquired() {
        let locks = manager();
        // No store round-trip happens, so the unreachable store is never consulted.
        let token = locks
            .acquire("", Duration::ZERO, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(token.is_none());
        assert!(!locks.is_locked("").await.unwrap());
        assert!(!locks.force_release("").await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_lease_rejected() {
        let locks = manager();
        let err = locks
            .acquire("user:42", Duration::ZERO, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::InvalidArgument(_)));
    }

    #[test]
    fn test_store_key_namespacing() {
        let locks = manager();
        assert_eq!(locks.store_key("user:42"), "lock:user:42");
        assert_eq!(locks.rw_store_key("doc:7"), "lock:rw:doc:7");

        let bare = LockManager::with_config(
            Arc::new(UnreachableStore),
            LockConfig {
                namespace: String::new(),
                ..LockConfig::default()
            },
        );
        assert_eq!(bare.store_key("user:42"), "user:42");
    }
}
