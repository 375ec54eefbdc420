use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{CourierError, LockStore};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, instrument};

/// Stand-in expiry for leases too long to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + ttl`, saturating instead of overflowing.
fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE)
}

#[derive(Debug, Clone)]
struct Lease {
    value: String,
    expires_at: Instant,
}

impl Lease {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: expiry(Instant::now(), ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Reader set and writer slot of one read/write lock.
#[derive(Debug, Default)]
struct RwLease {
    writer: Option<Lease>,
    readers: HashMap<String, Instant>,
}

impl RwLease {
    fn prune(&mut self, now: Instant) {
        if self.writer.as_ref().is_some_and(|w| !w.is_live(now)) {
            self.writer = None;
        }
        self.readers.retain(|_, expires_at| *expires_at > now);
    }

    fn is_empty(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

/// Lock store kept in process memory.
///
/// Every operation runs under the shard lock of its key, which makes each one
/// atomic. Expiry follows the tokio clock, so tests can drive leases with
/// `tokio::time::pause`/`advance`.
#[derive(Debug)]
pub struct MemoryLockStore {
    leases: DashMap<String, Lease>,
    rw: DashMap<String, RwLease>,
    reachable: AtomicBool,
}

impl Default for MemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self {
            leases: DashMap::new(),
            rw: DashMap::new(),
            reachable: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) the connection to the store.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<(), CourierError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CourierError::Unavailable(
                "memory lock store marked unreachable".to_string(),
            ))
        }
    }

    fn live_lease(&self, key: &str) -> Option<Lease> {
        let now = Instant::now();
        self.leases
            .get(key)
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.value().clone())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self), level = "debug")]
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CourierError> {
        self.check_reachable()?;
        let now = Instant::now();
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    debug!("{} held by {}", key, entry.get().value);
                    return Ok(false);
                }
                entry.insert(Lease::new(value, ttl));
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert(Lease::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, CourierError> {
        self.check_reachable()?;
        let now = Instant::now();
        Ok(self
            .leases
            .remove_if(key, |_, lease| lease.value == value && lease.is_live(now))
            .is_some())
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CourierError> {
        self.check_reachable()?;
        let now = Instant::now();
        match self.leases.get_mut(key) {
            Some(mut lease) if lease.value == value && lease.is_live(now) => {
                lease.expires_at = expiry(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CourierError> {
        self.check_reachable()?;
        Ok(self.live_lease(key).map(|lease| lease.value))
    }

    async fn exists(&self, key: &str) -> Result<bool, CourierError> {
        self.check_reachable()?;
        Ok(self.live_lease(key).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CourierError> {
        self.check_reachable()?;
        let now = Instant::now();
        Ok(self
            .live_lease(key)
            .map(|lease| lease.expires_at.saturating_duration_since(now)))
    }

    async fn delete(&self, key: &str) -> Result<bool, CourierError> {
        self.check_reachable()?;
        let now = Instant::now();
        Ok(self
            .leases
            .remove(key)
            .is_some_and(|(_, lease)| lease.is_live(now)))
    }

    #[instrument(skip(self), level = "debug")]
    async fn try_add_reader(
        &self,
        key: &str,
        reader: &str,
        ttl: Duration,
    ) -> Result<bool, CourierError> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut entry = self.rw.entry(key.to_string()).or_default();
        entry.prune(now);
        if entry.writer.is_some() {
            return Ok(false);
        }
        entry.readers.insert(reader.to_string(), expiry(now, ttl));
        Ok(true)
    }

    async fn remove_reader(&self, key: &str, reader: &str) -> Result<bool, CourierError> {
        self.check_reachable()?;
        let now = Instant::now();
        let removed = match self.rw.get_mut(key) {
            Some(mut entry) => {
                entry.prune(now);
                entry.readers.remove(reader).is_some()
            }
            None => false,
        };
        self.rw.remove_if(key, |_, entry| entry.is_empty());
        Ok(removed)
    }

    async fn has_reader(&self, key: &str, reader: &str) -> Result<bool, CourierError> {
        self.check_reachable()?;
        let now = Instant::now();
        Ok(self.rw.get(key).is_some_and(|entry| {
            entry
                .readers
                .get(reader)
                .is_some_and(|expires_at| *expires_at > now)
        }))
    }

    async fn reader_count(&self, key: &str) -> Result<usize, CourierError> {
        self.check_reachable()?;
        let now = Instant::now();
        Ok(self.rw.get(key).map_or(0, |entry| {
            entry
                .readers
                .values()
                .filter(|expires_at| **expires_at > now)
                .count()
        }))
    }

    #[instrument(skip(self), level = "debug")]
    async fn try_set_writer(
        &self,
        key: &str,
        writer: &str,
        ttl: Duration,
    ) -> Result<bool, CourierError> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut entry = self.rw.entry(key.to_string()).or_default();
        entry.prune(now);
        if entry.writer.is_some() || !entry.readers.is_empty() {
            return Ok(false);
        }
        entry.writer = Some(Lease::new(writer, ttl));
        Ok(true)
    }

    async fn remove_writer(&self, key: &str, writer: &str) -> Result<bool, CourierError> {
        self.check_reachable()?;
        let now = Instant::now();
        let removed = match self.rw.get_mut(key) {
            Some(mut entry) => {
                entry.prune(now);
                if entry.writer.as_ref().is_some_and(|w| w.value == writer) {
                    entry.writer = None;
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        self.rw.remove_if(key, |_, entry| entry.is_empty());
        Ok(removed)
    }

    async fn writer(&self, key: &str) -> Result<Option<String>, CourierError> {
        self.check_reachable()?;
        let now = Instant::now();
        Ok(self.rw.get(key).and_then(|entry| {
            entry
                .writer
                .as_ref()
                .filter(|w| w.is_live(now))
                .map(|w| w.value.clone())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_set_if_absent_is_exclusive() {
        let store = MemoryLockStore::new();

        assert!(store.set_if_absent("k", "a", LEASE).await.unwrap());
        assert!(!store.set_if_absent("k", "b", LEASE).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let store = MemoryLockStore::new();
        store.set_if_absent("k", "a", LEASE).await.unwrap();

        assert!(!store.delete_if_equals("k", "b").await.unwrap());
        assert!(store.exists("k").await.unwrap());
        assert!(store.delete_if_equals("k", "a").await.unwrap());
        assert!(!store.exists("k").await.unwrap());
        assert!(!store.delete_if_equals("k", "a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry() {
        let store = MemoryLockStore::new();
        store
            .set_if_absent("k", "a", Duration::from_secs(5))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            store.ttl("k").await.unwrap(),
            Some(Duration::from_secs(1))
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!store.exists("k").await.unwrap());
        assert!(store.set_if_absent("k", "b", LEASE).await.unwrap());
        // The expired holder's compare-and-delete must not remove the new holder.
        assert!(!store.delete_if_equals("k", "a").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_if_equals() {
        let store = MemoryLockStore::new();
        store
            .set_if_absent("k", "a", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!store
            .expire_if_equals("k", "b", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(store
            .expire_if_equals("k", "a", Duration::from_secs(60))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_readers_and_writer_exclude_each_other() {
        let store = MemoryLockStore::new();

        assert!(store.try_add_reader("doc", "r1", LEASE).await.unwrap());
        assert!(store.try_add_reader("doc", "r2", LEASE).await.unwrap());
        assert_eq!(store.reader_count("doc").await.unwrap(), 2);
        assert!(!store.try_set_writer("doc", "w1", LEASE).await.unwrap());

        store.remove_reader("doc", "r1").await.unwrap();
        store.remove_reader("doc", "r2").await.unwrap();
        assert!(store.try_set_writer("doc", "w1", LEASE).await.unwrap());
        assert!(!store.try_set_writer("doc", "w2", LEASE).await.unwrap());
        assert!(!store.try_add_reader("doc", "r3", LEASE).await.unwrap());
        assert_eq!(store.writer("doc").await.unwrap().as_deref(), Some("w1"));

        assert!(!store.remove_writer("doc", "w2").await.unwrap());
        assert!(store.remove_writer("doc", "w1").await.unwrap());
        assert!(store.try_add_reader("doc", "r3", LEASE).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_reader_does_not_block_writer() {
        let store = MemoryLockStore::new();
        store
            .try_add_reader("doc", "r1", Duration::from_secs(5))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!store.has_reader("doc", "r1").await.unwrap());
        assert!(store.try_set_writer("doc", "w1", LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable() {
        let store = MemoryLockStore::new();
        store.set_reachable(false);

        let err = store.set_if_absent("k", "a", LEASE).await.unwrap_err();
        assert!(err.is_unavailable());

        store.set_reachable(true);
        assert!(store.set_if_absent("k", "a", LEASE).await.unwrap());
    }
}
