//! In-process backends for courier.
//!
//! - `MemoryLockStore`: lock-store primitives over a concurrent map with lease expiry
//! - `MemoryBroker`: exchanges, queues, manual acknowledgment and dead-lettering in memory
//! - `MemoryJournal` / `FileJournal`: dead-letter journals
//!
//! Both the store and the broker can be switched to "unreachable" to exercise
//! failure handling without a network.

mod broker;
mod journal;
mod lock;

pub use broker::MemoryBroker;
pub use journal::{FileJournal, MemoryJournal};
pub use lock::MemoryLockStore;
