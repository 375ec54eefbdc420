//! Core traits and coordination logic for courier.
//!
//! This crate defines the abstractions shared between the in-process and remote backends,
//! and the coordination logic built on top of them:
//! - `LockStore` / `LockManager`: Lease-based mutual exclusion and read/write locks
//! - `Topology`: Static exchange/queue/binding declarations with a dead-letter route
//! - `Broker` / `Producer`: Publishing with out-of-band confirm and return events
//! - `Dispatcher`: Per-queue workers with manual acknowledgment
//! - `DeadLetterSink`: Terminal consumer that records poison messages

mod broker;
mod dead_letter;
mod dispatch;
mod error;
mod lock;
mod producer;
mod topology;

pub use broker::{
    Acknowledger, Broker, ConsumeOptions, DeathReason, DeathRecord, Delivery, DeliveryStream,
    OutboundMessage, PublishEvent,
};
pub use dead_letter::{DeadLetterJournal, DeadLetterRecord, DeadLetterSink};
pub use dispatch::{
    dispatch_one, handler_fn, ConsumerOptions, Dispatcher, FnHandler, MessageHandler, Outcome,
    Settlement,
};
pub use error::{CourierError, WithLockError};
pub use lock::{LockConfig, LockGuard, LockKind, LockManager, LockStore, LockToken};
pub use producer::{EventEnvelope, LoggingListener, Producer, PublishListener};
pub use topology::{
    topic_matches, BindingSpec, DeadLetterRoute, Destination, ExchangeKind, ExchangeSpec,
    QueueSpec, Topology, TopologyBuilder,
};
