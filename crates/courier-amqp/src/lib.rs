//! AMQP 0-9-1 broker backend for courier.
//!
//! `AmqpBroker` speaks to RabbitMQ through `lapin`: publisher confirms and
//! mandatory returns feed the `events` channel, consumers use manual
//! acknowledgment with a per-session prefetch, and queue dead-letter routes and
//! TTLs become `x-dead-letter-*` / `x-message-ttl` arguments. Delayed delivery
//! needs the `rabbitmq_delayed_message_exchange` plugin.

mod broker;
mod convert;
mod error;

pub use broker::{AmqpBroker, AmqpConfig};
pub use error::map_lapin_error;
