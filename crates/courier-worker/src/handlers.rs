use std::time::Duration;

use async_trait::async_trait;
use courier_core::{CourierError, Delivery, LockManager, MessageHandler, Outcome, WithLockError};
use tracing::{debug, info, warn};

/// Key identifying the work a delivery stands for: its message id, or the
/// delivery tag when the producer set none.
fn work_key(delivery: &Delivery) -> String {
    match &delivery.message_id {
        Some(id) => format!("message:{}", id),
        None => format!("delivery:{}:{}", delivery.queue, delivery.delivery_tag),
    }
}

/// A JSON content type with an unparseable body can never succeed.
fn check_json(delivery: &Delivery) -> Result<(), String> {
    let is_json = delivery
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.starts_with("application/json"));
    if !is_json {
        return Ok(());
    }
    serde_json::from_slice::<serde_json::Value>(&delivery.payload)
        .map(|_| ())
        .map_err(|e| format!("malformed JSON payload: {}", e))
}

/// Handler for the direct queue.
///
/// Processing of one message id is serialized through the lock manager, so two
/// workers never run the same redelivered message side by side.
pub struct DirectHandler {
    locks: LockManager,
    wait: Duration,
    lease: Duration,
}

impl DirectHandler {
    pub fn new(locks: LockManager) -> Self {
        let wait = locks.config().default_wait;
        let lease = locks.config().default_lease;
        Self { locks, wait, lease }
    }
}

#[async_trait]
impl MessageHandler for DirectHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome, CourierError> {
        if let Err(reason) = check_json(delivery) {
            return Ok(Outcome::Rejected(reason));
        }

        let key = work_key(delivery);
        let result = self
            .locks
            .with_lock(&key, self.wait, self.lease, || async {
                info!(
                    "Direct message on {} ({}): {}",
                    delivery.queue,
                    key,
                    delivery.payload_str()
                );
                Ok::<_, CourierError>(())
            })
            .await;

        match result {
            Ok(()) => Ok(Outcome::Processed),
            Err(WithLockError::NotAcquired(key)) => {
                debug!("{} is being processed elsewhere", key);
                Ok(Outcome::Retry(format!("{} is locked", key)))
            }
            Err(WithLockError::Lock(e)) if e.is_unavailable() => {
                warn!("Lock store unavailable for {}: {}", key, e);
                Ok(Outcome::Retry(e.to_string()))
            }
            Err(e) => Err(e.into_courier_error()),
        }
    }
}

/// Handler that logs each message; used for the topic, fan-out and delayed queues.
pub struct LoggingHandler {
    route: &'static str,
}

impl LoggingHandler {
    pub fn new(route: &'static str) -> Self {
        Self { route }
    }
}

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome, CourierError> {
        if let Err(reason) = check_json(delivery) {
            return Ok(Outcome::Rejected(reason));
        }
        info!(
            "{} message on {} (routing key {:?}, redelivered: {}): {}",
            self.route,
            delivery.queue,
            delivery.routing_key,
            delivery.redelivered,
            delivery.payload_str()
        );
        Ok(Outcome::Processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use courier_core::{Acknowledger, LockConfig};
    use courier_local::MemoryLockStore;

    struct NoopAcker;

    #[async_trait]
    impl Acknowledger for NoopAcker {
        async fn ack(&self, _: u64) -> Result<(), CourierError> {
            Ok(())
        }
        async fn reject(&self, _: u64, _: bool) -> Result<(), CourierError> {
            Ok(())
        }
    }

    fn delivery(
        message_id: Option<&str>,
        content_type: Option<&str>,
        payload: &'static str,
    ) -> Delivery {
        let mut delivery = Delivery::new(7, "direct.queue", Arc::new(NoopAcker));
        delivery.message_id = message_id.map(str::to_string);
        delivery.content_type = content_type.map(str::to_string);
        delivery.payload = bytes::Bytes::from(payload);
        delivery
    }

    fn locks() -> (LockManager, Arc<MemoryLockStore>) {
        let store = Arc::new(MemoryLockStore::new());
        let config = LockConfig {
            default_wait: Duration::ZERO,
            ..LockConfig::default()
        };
        (LockManager::with_config(store.clone(), config), store)
    }

    #[test]
    fn test_work_key() {
        assert_eq!(work_key(&delivery(Some("m-1"), None, "")), "message:m-1");
        assert_eq!(work_key(&delivery(None, None, "")), "delivery:direct.queue:7");
    }

    #[tokio::test]
    async fn test_direct_handler_processes_and_releases() {
        let (locks, _store) = locks();
        let handler = DirectHandler::new(locks.clone());

        let outcome = handler
            .handle(&delivery(Some("m-1"), Some("application/json"), r#"{"n":1}"#))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Processed);
        assert!(!locks.is_locked("message:m-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_direct_handler_retries_locked_message() {
        let (locks, _store) = locks();
        let handler = DirectHandler::new(locks.clone());
        let held = locks
            .try_acquire("message:m-2", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let outcome = handler
            .handle(&delivery(Some("m-2"), None, "hello"))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Retry(_)));
        assert!(locks.is_held_by(&held).await.unwrap());
    }

    #[tokio::test]
    async fn test_direct_handler_retries_when_store_is_down() {
        let (locks, store) = locks();
        let handler = DirectHandler::new(locks);
        store.set_reachable(false);

        let outcome = handler
            .handle(&delivery(Some("m-3"), None, "hello"))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Retry(_)));
    }

    #[tokio::test]
    async fn test_malformed_json_is_rejected() {
        let handler = LoggingHandler::new("topic");
        let outcome = handler
            .handle(&delivery(None, Some("application/json"), "{not json"))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Rejected(_)));

        let outcome = handler
            .handle(&delivery(None, Some("text/plain"), "{not json"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Processed);
    }
}
