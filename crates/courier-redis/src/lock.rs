use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{CourierError, LockStore};
use redis::aio::ConnectionManager;
use redis::{RedisResult, Script};
use tracing::{debug, info, instrument};

use crate::error::map_redis_error;

const DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const EXPIRE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

// KEYS[1] = reader hash, KEYS[2] = writer key
// ARGV[1] = reader token, ARGV[2] = lease in milliseconds
const ADD_READER: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
    return 0
end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local lease = tonumber(ARGV[2])
redis.call('HSET', KEYS[1], ARGV[1], now + lease)
if redis.call('PTTL', KEYS[1]) < lease then
    redis.call('PEXPIRE', KEYS[1], lease)
end
return 1
"#;

// KEYS[1] = reader hash, ARGV[1] = reader token
const REMOVE_READER: &str = r#"
local expires = redis.call('HGET', KEYS[1], ARGV[1])
if not expires then
    return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
if tonumber(expires) > now then
    return 1
end
return 0
"#;

// KEYS[1] = reader hash, ARGV[1] = reader token
const HAS_READER: &str = r#"
local expires = redis.call('HGET', KEYS[1], ARGV[1])
if not expires then
    return 0
end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
if tonumber(expires) > now then
    return 1
end
return 0
"#;

// KEYS[1] = reader hash; drops expired readers and counts the rest
const READER_COUNT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local readers = redis.call('HGETALL', KEYS[1])
local live = 0
for i = 1, #readers, 2 do
    if tonumber(readers[i + 1]) > now then
        live = live + 1
    else
        redis.call('HDEL', KEYS[1], readers[i])
    end
end
return live
"#;

// KEYS[1] = reader hash, KEYS[2] = writer key
// ARGV[1] = writer token, ARGV[2] = lease in milliseconds
const SET_WRITER: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
    return 0
end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local readers = redis.call('HGETALL', KEYS[1])
for i = 1, #readers, 2 do
    if tonumber(readers[i + 1]) > now then
        return 0
    end
end
redis.call('DEL', KEYS[1])
redis.call('SET', KEYS[2], ARGV[1], 'PX', ARGV[2])
return 1
"#;

struct Scripts {
    delete_if_equals: Script,
    expire_if_equals: Script,
    add_reader: Script,
    remove_reader: Script,
    has_reader: Script,
    reader_count: Script,
    set_writer: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
            expire_if_equals: Script::new(EXPIRE_IF_EQUALS),
            add_reader: Script::new(ADD_READER),
            remove_reader: Script::new(REMOVE_READER),
            has_reader: Script::new(HAS_READER),
            reader_count: Script::new(READER_COUNT),
            set_writer: Script::new(SET_WRITER),
        }
    }
}

/// Lock store backed by a Redis server.
///
/// Every call is bounded by `op_timeout`; a call that does not complete in time
/// reports `CourierError::Unavailable`. The reader hash and writer key of one
/// read/write lock share a hash tag, so the store also works on Redis Cluster.
pub struct RedisLockStore {
    conn: ConnectionManager,
    op_timeout: Duration,
    scripts: Scripts,
}

impl RedisLockStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`).
    ///
    /// The connection manager reconnects on its own after a dropped connection.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, CourierError> {
        let client = redis::Client::open(url)
            .map_err(|e| CourierError::InvalidArgument(format!("Invalid Redis URL: {}", e)))?;
        let conn = match tokio::time::timeout(op_timeout, ConnectionManager::new(client)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(map_redis_error("connect", e)),
            Err(_) => {
                return Err(CourierError::Unavailable(format!(
                    "Redis connect timed out after {:?}",
                    op_timeout
                )))
            }
        };
        info!("Connected to Redis lock store");
        Ok(Self {
            conn,
            op_timeout,
            scripts: Scripts::load(),
        })
    }

    async fn run<T>(
        &self,
        op: &str,
        call: impl Future<Output = RedisResult<T>>,
    ) -> Result<T, CourierError> {
        match tokio::time::timeout(self.op_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_redis_error(op, e)),
            Err(_) => Err(CourierError::Unavailable(format!(
                "Redis {} timed out after {:?}",
                op, self.op_timeout
            ))),
        }
    }
}

// The base key is wrapped in a hash tag so the reader hash and writer key of one
// lock hash to the same cluster slot; the Lua scripts touch both.
fn readers_key(key: &str) -> String {
    format!("{{{}}}:readers", key)
}

fn writer_key(key: &str) -> String {
    format!("{{{}}}:writer", key)
}

/// Longest expiry sent to Redis (about 100 years); larger values overflow its clock.
const MAX_EXPIRY_MS: u64 = 100 * 365 * 86_400 * 1_000;

/// Lease in whole milliseconds, between 1 (Redis rejects a zero expiry) and
/// `MAX_EXPIRY_MS`.
fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis())
        .unwrap_or(u64::MAX)
        .clamp(1, MAX_EXPIRY_MS)
}

#[async_trait]
impl LockStore for RedisLockStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CourierError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = self
            .run(
                "SET NX",
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        let set = reply.is_some();
        debug!("SET NX {} -> {}", key, set);
        Ok(set)
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, CourierError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .run(
                "compare-and-delete",
                self.scripts
                    .delete_if_equals
                    .key(key)
                    .arg(value)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(deleted == 1)
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn expire_if_equals(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CourierError> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .run(
                "compare-and-expire",
                self.scripts
                    .expire_if_equals
                    .key(key)
                    .arg(value)
                    .arg(millis(ttl))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(renewed == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CourierError> {
        let mut conn = self.conn.clone();
        self.run("GET", redis::cmd("GET").arg(key).query_async(&mut conn))
            .await
    }

    async fn exists(&self, key: &str) -> Result<bool, CourierError> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .run("EXISTS", redis::cmd("EXISTS").arg(key).query_async(&mut conn))
            .await?;
        Ok(count > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CourierError> {
        let mut conn = self.conn.clone();
        let pttl: i64 = self
            .run("PTTL", redis::cmd("PTTL").arg(key).query_async(&mut conn))
            .await?;
        // -2: no such key, -1: no expiry (never set by the lock manager)
        Ok(match pttl {
            -2 => None,
            -1 => Some(Duration::MAX),
            ms => Some(Duration::from_millis(u64::try_from(ms).unwrap_or(0))),
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> Result<bool, CourierError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .run("DEL", redis::cmd("DEL").arg(key).query_async(&mut conn))
            .await?;
        Ok(deleted > 0)
    }

    #[instrument(skip(self, reader), level = "debug")]
    async fn try_add_reader(
        &self,
        key: &str,
        reader: &str,
        ttl: Duration,
    ) -> Result<bool, CourierError> {
        let mut conn = self.conn.clone();
        let added: i64 = self
            .run(
                "add-reader",
                self.scripts
                    .add_reader
                    .key(readers_key(key))
                    .key(writer_key(key))
                    .arg(reader)
                    .arg(millis(ttl))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(added == 1)
    }

    async fn remove_reader(&self, key: &str, reader: &str) -> Result<bool, CourierError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .run(
                "remove-reader",
                self.scripts
                    .remove_reader
                    .key(readers_key(key))
                    .arg(reader)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(removed == 1)
    }

    async fn has_reader(&self, key: &str, reader: &str) -> Result<bool, CourierError> {
        let mut conn = self.conn.clone();
        let live: i64 = self
            .run(
                "has-reader",
                self.scripts
                    .has_reader
                    .key(readers_key(key))
                    .arg(reader)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(live == 1)
    }

    async fn reader_count(&self, key: &str) -> Result<usize, CourierError> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .run(
                "reader-count",
                self.scripts
                    .reader_count
                    .key(readers_key(key))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    #[instrument(skip(self, writer), level = "debug")]
    async fn try_set_writer(
        &self,
        key: &str,
        writer: &str,
        ttl: Duration,
    ) -> Result<bool, CourierError> {
        let mut conn = self.conn.clone();
        let set: i64 = self
            .run(
                "set-writer",
                self.scripts
                    .set_writer
                    .key(readers_key(key))
                    .key(writer_key(key))
                    .arg(writer)
                    .arg(millis(ttl))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(set == 1)
    }

    async fn remove_writer(&self, key: &str, writer: &str) -> Result<bool, CourierError> {
        self.delete_if_equals(&writer_key(key), writer).await
    }

    async fn writer(&self, key: &str) -> Result<Option<String>, CourierError> {
        self.get(&writer_key(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rw_key_derivation() {
        assert_eq!(readers_key("lock:rw:doc:9"), "{lock:rw:doc:9}:readers");
        assert_eq!(writer_key("lock:rw:doc:9"), "{lock:rw:doc:9}:writer");
    }

    /// Redis Cluster slot key: the content of the first non-empty `{...}`.
    fn hash_slot_key(key: &str) -> &str {
        if let Some(open) = key.find('{') {
            if let Some(len) = key[open + 1..].find('}') {
                if len > 0 {
                    return &key[open + 1..open + 1 + len];
                }
            }
        }
        key
    }

    #[test]
    fn test_rw_keys_share_cluster_slot() {
        for base in ["lock:rw:doc:9", "lock:rw:{tenant}:doc", "lock:rw:a}b", "lock:rw:{"] {
            assert_eq!(
                hash_slot_key(&readers_key(base)),
                hash_slot_key(&writer_key(base)),
                "{}",
                base
            );
        }
    }

    #[test]
    fn test_lease_millis() {
        assert_eq!(millis(Duration::from_secs(5)), 5_000);
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::MAX), MAX_EXPIRY_MS);
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let err = RedisLockStore::connect("not a url", Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CourierError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        // Port 1 on localhost: nothing listens there.
        let result = RedisLockStore::connect("redis://127.0.0.1:1/", Duration::from_secs(2)).await;
        assert!(result.err().unwrap().is_unavailable());
    }

    /// Runs against a live server: `REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`
    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_lock_round_trip_against_server() {
        use courier_core::LockManager;
        use std::sync::Arc;

        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let store = RedisLockStore::connect(&url, Duration::from_secs(2))
            .await
            .unwrap();
        let locks = LockManager::new(Arc::new(store));
        let key = format!("test:{}", std::process::id());
        let lease = Duration::from_secs(5);

        let token = locks.try_acquire(&key, lease).await.unwrap().unwrap();
        assert!(locks.try_acquire(&key, lease).await.unwrap().is_none());
        assert!(locks.is_held_by(&token).await.unwrap());
        assert!(locks.release(&token).await.unwrap());
        assert!(!locks.release(&token).await.unwrap());

        let r = locks.acquire_read(&key, Duration::ZERO, lease).await.unwrap().unwrap();
        assert!(locks
            .acquire_write(&key, Duration::ZERO, lease)
            .await
            .unwrap()
            .is_none());
        assert_eq!(locks.reader_count(&key).await.unwrap(), 1);
        assert!(locks.release_read(&r).await.unwrap());
        let w = locks.acquire_write(&key, Duration::ZERO, lease).await.unwrap().unwrap();
        assert!(locks.release_write(&w).await.unwrap());
    }
}
