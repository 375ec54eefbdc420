use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::broker::{DeathReason, DeathRecord, Delivery};
use crate::dispatch::{MessageHandler, Outcome};
use crate::error::CourierError;

/// Durable snapshot of a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Dead-letter queue the record was consumed from.
    pub queue: String,
    /// Exchange/routing key of the dead-letter hop.
    pub exchange: String,
    pub routing_key: String,
    /// Queue the message was last dead-lettered from.
    pub original_queue: Option<String>,
    /// Exchange/routing keys the message was originally published with.
    pub original_exchange: Option<String>,
    #[serde(default)]
    pub original_routing_keys: Vec<String>,
    pub reason: Option<DeathReason>,
    /// Total number of dead-letter hops.
    pub death_count: u64,
    #[serde(default)]
    pub deaths: Vec<DeathRecord>,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Payload, base64-encoded.
    pub payload: String,
    /// Payload as text when it is valid UTF-8.
    pub payload_text: Option<String>,
    pub redelivered: bool,
    pub received_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn from_delivery(delivery: &Delivery) -> Self {
        let last_death = delivery.deaths.first();
        Self {
            queue: delivery.queue.clone(),
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            original_queue: last_death.map(|d| d.queue.clone()),
            original_exchange: last_death.map(|d| d.exchange.clone()),
            original_routing_keys: last_death
                .map(|d| d.routing_keys.clone())
                .unwrap_or_default(),
            reason: last_death.map(|d| d.reason),
            death_count: delivery.death_count(),
            deaths: delivery.deaths.clone(),
            message_id: delivery.message_id.clone(),
            content_type: delivery.content_type.clone(),
            headers: delivery.headers.clone(),
            payload: base64::engine::general_purpose::STANDARD.encode(&delivery.payload),
            payload_text: std::str::from_utf8(&delivery.payload)
                .ok()
                .map(str::to_string),
            redelivered: delivery.redelivered,
            received_at: Utc::now(),
        }
    }

    /// Decode the stored payload.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, CourierError> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.payload)
            .map_err(|e| CourierError::Serialization(format!("invalid payload encoding: {}", e)))
    }
}

/// Durable storage for dead-letter records.
///
/// `record` must not return before the record survives a process crash.
#[async_trait]
pub trait DeadLetterJournal: Send + Sync {
    /// Returns the journal identifier (e.g., "memory", "file").
    fn journal_name(&self) -> &'static str;

    async fn record(&self, record: &DeadLetterRecord) -> Result<(), CourierError>;
}

/// Terminal consumer for the dead-letter queue.
///
/// Records every message before it is acknowledged, then raises an error-level
/// alert. It never re-publishes: re-injection is an operator action.
pub struct DeadLetterSink {
    journal: Arc<dyn DeadLetterJournal>,
    retry_delay: Duration,
}

impl DeadLetterSink {
    pub fn new(journal: Arc<dyn DeadLetterJournal>) -> Self {
        Self {
            journal,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Pause before handing a message back after a journal failure.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

#[async_trait]
impl MessageHandler for DeadLetterSink {
    #[instrument(skip(self, delivery), level = "debug", fields(tag = delivery.delivery_tag, queue = %delivery.queue))]
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome, CourierError> {
        let record = DeadLetterRecord::from_delivery(delivery);

        if let Err(e) = self.journal.record(&record).await {
            // Not acknowledged: the broker keeps the message and delivers it again.
            error!(
                "Failed to record dead letter #{} in {} journal: {}",
                delivery.delivery_tag,
                self.journal.journal_name(),
                e
            );
            tokio::time::sleep(self.retry_delay).await;
            return Ok(Outcome::Retry(format!("dead letter not recorded: {}", e)));
        }

        error!(
            queue = record.original_queue.as_deref().unwrap_or("unknown"),
            reason = record.reason.map(|r| r.as_str()).unwrap_or("unknown"),
            death_count = record.death_count,
            message_id = record.message_id.as_deref().unwrap_or(""),
            "Dead letter received: {}",
            record.payload_text.as_deref().unwrap_or("<binary payload>")
        );
        info!(
            "Dead letter #{} recorded in {} journal",
            delivery.delivery_tag,
            self.journal.journal_name()
        );
        Ok(Outcome::Processed)
    }
}
