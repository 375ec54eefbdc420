mod manager;
mod store;

pub use manager::{LockConfig, LockGuard, LockKind, LockManager, LockToken};
pub use store::LockStore;
