//! Redis backend for the courier lock manager.
//!
//! Exclusive locks use `SET NX PX` and Lua compare-and-delete. Read/write locks
//! keep a hash of reader leases (`{key}:readers`) and a writer key
//! (`{key}:writer`), both updated by Lua scripts so every decision is atomic
//! on the server.

mod error;
mod lock;

pub use error::map_redis_error;
pub use lock::RedisLockStore;
