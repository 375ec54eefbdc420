use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, ConsumeOptions, Delivery, DeliveryStream};
use crate::error::CourierError;

/// What a handler decided about a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Done; acknowledge.
    Processed,
    /// Poison for this queue; reject without requeue so the broker dead-letters it.
    Rejected(String),
    /// Transient failure; reject with requeue so the broker delivers it again.
    Retry(String),
}

/// How a delivery was settled with the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Rejected,
    Requeued,
    /// The ack/reject itself failed; the broker will redeliver after the session ends.
    Failed(String),
}

/// Per-queue message handler.
///
/// Delivery is at-least-once: a handler may see a message it already processed
/// (e.g. when an ack was lost), so side effects must be idempotent.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome, CourierError>;
}

/// Adapter turning an async closure into a `MessageHandler`.
pub struct FnHandler<F>(F);

/// Build a handler from `Fn(Delivery) -> impl Future<Output = Result<Outcome, CourierError>>`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outcome, CourierError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outcome, CourierError>> + Send,
{
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome, CourierError> {
        (self.0)(delivery.clone()).await
    }
}

/// Worker settings for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Concurrent workers, each with its own broker session. Ordering across
    /// workers of the same queue is not guaranteed.
    pub workers: usize,
    /// Unsettled deliveries per session.
    pub prefetch: u16,
    /// First pause before re-opening a lost session.
    pub reconnect_backoff: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            prefetch: 1,
            reconnect_backoff: Duration::from_millis(500),
        }
    }
}

const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

struct Registration {
    queue: String,
    handler: Arc<dyn MessageHandler>,
    options: ConsumerOptions,
}

/// Runs registered handlers against their queues.
///
/// Each delivery goes `Delivered -> Processing -> Acknowledged | Rejected`. A failing
/// or panicking handler only affects its own message.
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    registrations: Vec<Registration>,
    shutdown_tx: watch::Sender<bool>,
    workers: JoinSet<()>,
    started: bool,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            broker,
            registrations: Vec::new(),
            shutdown_tx,
            workers: JoinSet::new(),
            started: false,
        }
    }

    /// Register `handler` for `queue` with one worker and prefetch 1.
    pub fn register_handler(
        &mut self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<&mut Self, CourierError> {
        self.register_handler_with(queue, handler, ConsumerOptions::default())
    }

    pub fn register_handler_with(
        &mut self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        options: ConsumerOptions,
    ) -> Result<&mut Self, CourierError> {
        if self.started {
            return Err(CourierError::InvalidArgument(format!(
                "dispatcher already started, cannot register {}",
                queue
            )));
        }
        if self.registrations.iter().any(|r| r.queue == queue) {
            return Err(CourierError::InvalidArgument(format!(
                "a handler is already registered for {}",
                queue
            )));
        }
        if options.workers == 0 || options.prefetch == 0 {
            return Err(CourierError::InvalidArgument(format!(
                "workers and prefetch must be positive for {}",
                queue
            )));
        }
        self.registrations.push(Registration {
            queue: queue.to_string(),
            handler,
            options,
        });
        Ok(self)
    }

    /// Queues with a registered handler.
    pub fn queues(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.queue.as_str()).collect()
    }

    /// Open every session and spawn the workers.
    ///
    /// All sessions are opened before any worker runs, so a missing queue fails
    /// the whole start instead of leaving a partial dispatcher behind.
    pub async fn start(&mut self) -> Result<(), CourierError> {
        if self.started {
            return Err(CourierError::InvalidArgument(
                "dispatcher already started".to_string(),
            ));
        }

        let mut sessions = Vec::new();
        for registration in &self.registrations {
            let consume = ConsumeOptions {
                prefetch: registration.options.prefetch,
            };
            for worker in 0..registration.options.workers {
                let stream = self.broker.consume(&registration.queue, consume).await?;
                sessions.push((
                    Worker {
                        broker: Arc::clone(&self.broker),
                        queue: registration.queue.clone(),
                        index: worker,
                        handler: Arc::clone(&registration.handler),
                        options: registration.options,
                    },
                    stream,
                ));
            }
        }

        for (worker, stream) in sessions {
            let shutdown = self.shutdown_tx.subscribe();
            self.workers.spawn(worker.run(stream, shutdown));
        }
        self.started = true;

        info!(
            "Dispatcher started on {}: {} queue(s), {} worker(s)",
            self.broker.backend_name(),
            self.registrations.len(),
            self.workers.len()
        );
        Ok(())
    }

    /// Stop receiving, let in-flight messages settle, and wait for every worker.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                error!("Consumer worker ended abnormally: {}", e);
            }
        }
        self.started = false;
        info!("Dispatcher stopped");
    }
}

struct Worker {
    broker: Arc<dyn Broker>,
    queue: String,
    index: usize,
    handler: Arc<dyn MessageHandler>,
    options: ConsumerOptions,
}

impl Worker {
    async fn run(self, mut stream: DeliveryStream, mut shutdown: watch::Receiver<bool>) {
        debug!("Worker {}#{} started", self.queue, self.index);
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = stream.next() => match next {
                    Some(delivery) => {
                        // Runs to completion: shutdown is only observed between messages.
                        dispatch_one(self.handler.as_ref(), &delivery).await;
                    }
                    None => match self.reconnect(&mut shutdown).await {
                        Some(reopened) => stream = reopened,
                        None => break,
                    },
                },
            }
        }
        // Dropping the session hands unsettled prefetched deliveries back to the broker.
        drop(stream);
        debug!("Worker {}#{} stopped", self.queue, self.index);
    }

    /// Re-open a lost session with capped backoff. `None` once shutdown is requested.
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> Option<DeliveryStream> {
        let consume = ConsumeOptions {
            prefetch: self.options.prefetch,
        };
        let mut backoff = self.options.reconnect_backoff;
        loop {
            warn!(
                "Session for {}#{} lost, reconnecting in {:?}",
                self.queue, self.index, backoff
            );
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return None;
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }

            match self.broker.consume(&self.queue, consume).await {
                Ok(stream) => {
                    info!("Session for {}#{} re-established", self.queue, self.index);
                    return Some(stream);
                }
                Err(e) => {
                    warn!("Failed to re-open {}#{}: {}", self.queue, self.index, e);
                    backoff = backoff.saturating_mul(2).min(MAX_RECONNECT_BACKOFF);
                }
            }
        }
    }
}

/// Run `handler` on one delivery and settle it.
///
/// `Processed` acks; `Rejected`, an error, or a panic rejects without requeue;
/// `Retry` rejects with requeue. Settlement failures are logged and left to broker
/// redelivery.
pub async fn dispatch_one(handler: &dyn MessageHandler, delivery: &Delivery) -> Settlement {
    let outcome = match AssertUnwindSafe(handler.handle(delivery))
        .catch_unwind()
        .await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => Outcome::Rejected(e.to_string()),
        Err(panic) => Outcome::Rejected(panic_message(panic.as_ref())),
    };

    let (result, settled) = match &outcome {
        Outcome::Processed => (delivery.ack().await, Settlement::Acked),
        Outcome::Rejected(reason) => {
            warn!(
                "Rejecting message #{} from {}: {}",
                delivery.delivery_tag, delivery.queue, reason
            );
            (delivery.reject(false).await, Settlement::Rejected)
        }
        Outcome::Retry(reason) => {
            warn!(
                "Requeueing message #{} from {}: {}",
                delivery.delivery_tag, delivery.queue, reason
            );
            (delivery.reject(true).await, Settlement::Requeued)
        }
    };

    match result {
        Ok(()) => {
            debug!(
                "Message #{} from {} settled: {:?}",
                delivery.delivery_tag, delivery.queue, settled
            );
            settled
        }
        Err(e) => {
            error!(
                "Failed to settle message #{} from {} ({:?}): {}",
                delivery.delivery_tag, delivery.queue, outcome, e
            );
            Settlement::Failed(e.to_string())
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
