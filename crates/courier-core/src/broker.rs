use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::CourierError;
use crate::topology::{BindingSpec, Destination, ExchangeSpec, QueueSpec};

/// A message on its way to the broker.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub destination: Destination,
    pub payload: Bytes,
    pub headers: BTreeMap<String, String>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    /// Delivery delay; only honoured by delay-capable exchanges.
    pub delay: Option<Duration>,
    /// Ask the broker to report the message back if no queue receives it.
    pub mandatory: bool,
}

impl OutboundMessage {
    pub fn new(destination: Destination, payload: impl Into<Bytes>) -> Self {
        Self {
            destination,
            payload: payload.into(),
            headers: BTreeMap::new(),
            content_type: None,
            message_id: None,
            delay: None,
            mandatory: true,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathReason {
    /// Rejected by a consumer without requeue.
    Rejected,
    /// Waited longer than the queue's message TTL.
    Expired,
    /// Dropped from the head of a full queue.
    MaxLength,
}

impl DeathReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeathReason::Rejected => "rejected",
            DeathReason::Expired => "expired",
            DeathReason::MaxLength => "maxlen",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rejected" => Some(DeathReason::Rejected),
            "expired" => Some(DeathReason::Expired),
            "maxlen" => Some(DeathReason::MaxLength),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeathReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a message's dead-letter history (AMQP `x-death`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathRecord {
    /// Queue the message was dead-lettered from.
    pub queue: String,
    /// Exchange the message was originally published to.
    pub exchange: String,
    /// Routing keys the message was originally published with.
    pub routing_keys: Vec<String>,
    pub reason: DeathReason,
    /// How many times the message was dead-lettered from `queue` for `reason`.
    pub count: u64,
}

/// Broker-level outcome of a publish, delivered out-of-band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishEvent {
    /// The broker took responsibility for the message.
    Confirmed { sequence: u64 },
    /// The broker refused the message.
    Nacked { sequence: u64, reason: String },
    /// No queue matched the destination of a mandatory message.
    Returned {
        sequence: u64,
        destination: Destination,
        reply_code: u16,
        reply_text: String,
    },
}

impl PublishEvent {
    pub fn sequence(&self) -> u64 {
        match self {
            PublishEvent::Confirmed { sequence }
            | PublishEvent::Nacked { sequence, .. }
            | PublishEvent::Returned { sequence, .. } => *sequence,
        }
    }

    /// The sequence of a confirmed message, or why the broker did not take it.
    pub fn into_result(self) -> Result<u64, CourierError> {
        match self {
            PublishEvent::Confirmed { sequence } => Ok(sequence),
            PublishEvent::Nacked { sequence, reason } => Err(CourierError::Unavailable(format!(
                "message {} nacked: {}",
                sequence, reason
            ))),
            PublishEvent::Returned {
                sequence,
                destination,
                reply_code,
                reply_text,
            } => Err(CourierError::Unroutable(format!(
                "message {} to {} returned ({} {})",
                sequence, destination, reply_code, reply_text
            ))),
        }
    }
}

/// Settles deliveries on the session that received them.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Remove the message from its queue for good.
    async fn ack(&self, delivery_tag: u64) -> Result<(), CourierError>;

    /// Give the message back. With `requeue = false` the broker dead-letters it
    /// (or drops it when the queue has no dead-letter route).
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), CourierError>;
}

/// A message handed to a consumer session, in flight until settled.
#[derive(Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    /// Queue the message was consumed from.
    pub queue: String,
    /// Exchange and routing key the message was last published or dead-lettered with.
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
    pub headers: BTreeMap<String, String>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    /// Set when the message was delivered before and not settled.
    pub redelivered: bool,
    /// Dead-letter history, most recent first.
    pub deaths: Vec<DeathRecord>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, queue: impl Into<String>, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            delivery_tag,
            queue: queue.into(),
            exchange: String::new(),
            routing_key: String::new(),
            payload: Bytes::new(),
            headers: BTreeMap::new(),
            content_type: None,
            message_id: None,
            redelivered: false,
            deaths: Vec::new(),
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), CourierError> {
        self.acker.ack(self.delivery_tag).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), CourierError> {
        self.acker.reject(self.delivery_tag, requeue).await
    }

    /// Payload as text, lossy for non-UTF-8 bytes.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Deserialize a JSON payload.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, CourierError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Total number of times this message has been dead-lettered.
    pub fn death_count(&self) -> u64 {
        self.deaths.iter().map(|d| d.count).sum()
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("queue", &self.queue)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .field("deaths", &self.deaths)
            .finish()
    }
}

/// Deliveries of one consumer session.
///
/// Dropping the stream closes the session; the broker then makes every unsettled
/// delivery of that session available again, flagged as redelivered.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Per-session consumption settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum number of unsettled deliveries on the session.
    pub prefetch: u16,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self { prefetch: 1 }
    }
}

/// Message broker abstraction (AMQP-style exchanges, queues and bindings).
///
/// Confirms and returns are not part of `publish`'s result: they are emitted on
/// the `events` channel, correlated by the sequence number `publish` returns.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Returns the backend identifier (e.g., "memory", "amqp").
    fn backend_name(&self) -> &'static str;

    /// Whether delayed delivery is available on delay-capable exchanges.
    fn supports_delay(&self) -> bool;

    // =========================================================================
    // Topology
    // =========================================================================

    /// Declare an exchange. Identical redeclaration is a no-op, a conflicting one
    /// fails with `CourierError::Topology`.
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), CourierError>;

    /// Declare a queue, with the same redeclaration rules as exchanges.
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), CourierError>;

    /// Bind a queue to an exchange. Binding twice is a no-op.
    async fn bind(&self, binding: &BindingSpec) -> Result<(), CourierError>;

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Hand a message to the broker and return its publish sequence number.
    ///
    /// Returns once the message is written to the transport. Transport failures
    /// are reported here; acceptance and routability arrive later on `events`.
    async fn publish(&self, message: OutboundMessage) -> Result<u64, CourierError>;

    /// Subscribe to confirm/nack/return events.
    fn events(&self) -> broadcast::Receiver<PublishEvent>;

    // =========================================================================
    // Consuming
    // =========================================================================

    /// Open a consumer session on `queue` with manual acknowledgment.
    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, CourierError>;
}
