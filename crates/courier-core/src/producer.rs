use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::broker::{Broker, OutboundMessage, PublishEvent};
use crate::error::CourierError;
use crate::topology::{Destination, Topology};

const JSON_CONTENT_TYPE: &str = "application/json";

/// Application-visible publish outcomes.
///
/// Called from the producer's event task, never from the publishing task.
#[async_trait]
pub trait PublishListener: Send + Sync {
    async fn on_confirm(&self, _sequence: u64) {}

    async fn on_nack(&self, _sequence: u64, _reason: &str) {}

    async fn on_return(
        &self,
        _sequence: u64,
        _destination: &Destination,
        _reply_code: u16,
        _reply_text: &str,
    ) {
    }
}

/// Default listener: logs every outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

#[async_trait]
impl PublishListener for LoggingListener {
    async fn on_confirm(&self, sequence: u64) {
        debug!("Message #{} confirmed by broker", sequence);
    }

    async fn on_nack(&self, sequence: u64, reason: &str) {
        warn!("Message #{} refused by broker: {}", sequence, reason);
    }

    async fn on_return(
        &self,
        sequence: u64,
        destination: &Destination,
        reply_code: u16,
        reply_text: &str,
    ) {
        warn!(
            "Message #{} unroutable at {}: {} {}",
            sequence, destination, reply_code, reply_text
        );
    }
}

/// JSON envelope for domain events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub data: T,
}

impl<T> EventEnvelope<T> {
    pub fn new(data: T) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Publishes messages through the topology's routes.
///
/// Publishing never waits for confirms: they are pumped from the broker's event
/// channel into a `PublishListener` on a background task. A transport failure is
/// returned to the caller, who owns the retry policy.
///
/// Must be created inside a tokio runtime.
pub struct Producer {
    broker: Arc<dyn Broker>,
    topology: Arc<Topology>,
    pump: JoinHandle<()>,
}

impl Producer {
    /// Create a producer that logs publish outcomes.
    pub fn new(broker: Arc<dyn Broker>, topology: Arc<Topology>) -> Self {
        Self::with_listener(broker, topology, Arc::new(LoggingListener))
    }

    pub fn with_listener(
        broker: Arc<dyn Broker>,
        topology: Arc<Topology>,
        listener: Arc<dyn PublishListener>,
    ) -> Self {
        let pump = tokio::spawn(pump_events(broker.events(), listener));
        Self {
            broker,
            topology,
            pump,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Raw confirm/nack/return events, for callers correlating by sequence.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishEvent> {
        self.broker.events()
    }

    /// Publish raw bytes to `destination`.
    pub async fn publish(
        &self,
        destination: &Destination,
        payload: impl Into<Bytes>,
    ) -> Result<u64, CourierError> {
        self.publish_message(OutboundMessage::new(destination.clone(), payload))
            .await
    }

    /// Publish a fully specified message.
    #[instrument(skip(self, message), level = "debug", fields(destination = %message.destination, size = message.payload.len()))]
    pub async fn publish_message(&self, message: OutboundMessage) -> Result<u64, CourierError> {
        if message.delay.is_some() {
            self.check_delay_support(&message.destination)?;
        }

        let destination = message.destination.clone();
        match self.broker.publish(message).await {
            Ok(sequence) => {
                debug!("Published message #{} to {}", sequence, destination);
                Ok(sequence)
            }
            Err(e) => {
                error!("Failed to publish to {}: {}", destination, e);
                Err(e)
            }
        }
    }

    /// Serialize `value` as JSON and publish it.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        destination: &Destination,
        value: &T,
    ) -> Result<u64, CourierError> {
        let payload = serde_json::to_vec(value)?;
        self.publish_message(
            OutboundMessage::new(destination.clone(), payload).with_content_type(JSON_CONTENT_TYPE),
        )
        .await
    }

    /// Wrap `data` in an `EventEnvelope` and publish it; the envelope id becomes the
    /// message id so handlers can deduplicate redeliveries.
    pub async fn publish_event<T: Serialize>(
        &self,
        destination: &Destination,
        data: T,
    ) -> Result<EventEnvelope<T>, CourierError> {
        let envelope = EventEnvelope::new(data);
        let payload = serde_json::to_vec(&envelope)?;
        self.publish_message(
            OutboundMessage::new(destination.clone(), payload)
                .with_content_type(JSON_CONTENT_TYPE)
                .with_message_id(envelope.id.clone()),
        )
        .await?;
        Ok(envelope)
    }

    /// Publish to the topology's direct route.
    pub async fn send_direct(&self, payload: impl Into<Bytes>) -> Result<u64, CourierError> {
        let destination = self
            .topology
            .direct_route()
            .cloned()
            .ok_or_else(|| CourierError::Topology("no direct route declared".to_string()))?;
        self.publish(&destination, payload).await
    }

    /// Publish to the topology's topic exchange with `routing_key`.
    pub async fn send_topic(
        &self,
        routing_key: &str,
        payload: impl Into<Bytes>,
    ) -> Result<u64, CourierError> {
        let exchange = self
            .topology
            .topic_exchange()
            .ok_or_else(|| CourierError::Topology("no topic exchange declared".to_string()))?;
        self.publish(&Destination::new(exchange, routing_key), payload)
            .await
    }

    /// Publish to the topology's fan-out exchange.
    pub async fn send_fanout(&self, payload: impl Into<Bytes>) -> Result<u64, CourierError> {
        let exchange = self
            .topology
            .fanout_exchange()
            .ok_or_else(|| CourierError::Topology("no fanout exchange declared".to_string()))?;
        self.publish(&Destination::fanout(exchange), payload).await
    }

    /// Publish for delivery after `delay`.
    ///
    /// Fails with `CourierError::Unsupported` (and sends nothing) unless the target
    /// exchange is declared delay-capable and the broker supports delays.
    pub async fn publish_delayed(
        &self,
        destination: &Destination,
        payload: impl Into<Bytes>,
        delay: Duration,
    ) -> Result<u64, CourierError> {
        self.publish_message(OutboundMessage::new(destination.clone(), payload).with_delay(delay))
            .await
    }

    fn check_delay_support(&self, destination: &Destination) -> Result<(), CourierError> {
        if !self.broker.supports_delay() {
            return Err(CourierError::Unsupported(format!(
                "{} broker does not support delayed delivery",
                self.broker.backend_name()
            )));
        }
        match self.topology.exchange(&destination.exchange) {
            Some(exchange) if exchange.delayed => Ok(()),
            Some(_) => Err(CourierError::Unsupported(format!(
                "exchange {} is not declared for delayed delivery",
                destination.exchange
            ))),
            None => Err(CourierError::Unsupported(format!(
                "exchange {} is not part of the topology",
                destination.exchange
            ))),
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_events(
    mut events: broadcast::Receiver<PublishEvent>,
    listener: Arc<dyn PublishListener>,
) {
    loop {
        match events.recv().await {
            Ok(PublishEvent::Confirmed { sequence }) => listener.on_confirm(sequence).await,
            Ok(PublishEvent::Nacked { sequence, reason }) => {
                listener.on_nack(sequence, &reason).await
            }
            Ok(PublishEvent::Returned {
                sequence,
                destination,
                reply_code,
                reply_text,
            }) => {
                listener
                    .on_return(sequence, &destination, reply_code, &reply_text)
                    .await
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Publish listener lagged, {} event(s) dropped", skipped);
            }
            Err(RecvError::Closed) => {
                debug!("Publish event channel closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope_shape() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct UserCreated {
            user_id: u64,
        }

        let envelope = EventEnvelope::new(UserCreated { user_id: 42 });
        let json: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["data"]["user_id"], 42);
        assert_eq!(json["id"], envelope.id.as_str());
        assert!(json["timestamp"].is_string());

        let back: EventEnvelope<UserCreated> = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }
}
