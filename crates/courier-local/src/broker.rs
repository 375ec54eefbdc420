use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{
    Acknowledger, BindingSpec, Broker, ConsumeOptions, CourierError, DeathReason, DeathRecord,
    Delivery, DeliveryStream, ExchangeSpec, OutboundMessage, PublishEvent, QueueSpec,
};
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

const EVENT_CAPACITY: usize = 1024;

/// AMQP reply code for a mandatory message that matched no queue.
const NO_ROUTE: u16 = 312;

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    payload: Bytes,
    headers: BTreeMap<String, String>,
    content_type: Option<String>,
    message_id: Option<String>,
    redelivered: bool,
    deaths: Vec<DeathRecord>,
    enqueued_at: Instant,
}

impl StoredMessage {
    fn from_outbound(message: &OutboundMessage) -> Self {
        Self {
            exchange: message.destination.exchange.clone(),
            routing_key: message.destination.routing_key.clone(),
            payload: message.payload.clone(),
            headers: message.headers.clone(),
            content_type: message.content_type.clone(),
            message_id: message.message_id.clone(),
            redelivered: false,
            deaths: Vec::new(),
            enqueued_at: Instant::now(),
        }
    }

    fn to_delivery(&self, tag: u64, queue: &str, acker: Arc<dyn Acknowledger>) -> Delivery {
        let mut delivery = Delivery::new(tag, queue, acker);
        delivery.exchange = self.exchange.clone();
        delivery.routing_key = self.routing_key.clone();
        delivery.payload = self.payload.clone();
        delivery.headers = self.headers.clone();
        delivery.content_type = self.content_type.clone();
        delivery.message_id = self.message_id.clone();
        delivery.redelivered = self.redelivered;
        delivery.deaths = self.deaths.clone();
        delivery
    }
}

struct Consumer {
    session: u64,
    tx: mpsc::UnboundedSender<Delivery>,
    acker: Arc<dyn Acknowledger>,
    prefetch: usize,
    unacked: usize,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<Consumer>,
    cursor: usize,
}

struct InFlight {
    queue: String,
    session: u64,
    message: StoredMessage,
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Ack,
    Requeue,
    DeadLetter,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingSpec>,
    in_flight: HashMap<u64, InFlight>,
    next_tag: u64,
    next_sequence: u64,
    next_session: u64,
    /// Queues that received a message subject to TTL since the last drain.
    expiry_timers: Vec<(String, Duration)>,
}

impl State {
    /// Queues a message published to `exchange` with `routing_key` reaches.
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, CourierError> {
        // Default exchange: route to the queue named by the routing key.
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let spec = self.exchanges.get(exchange).ok_or_else(|| {
            CourierError::Topology(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;
        let mut queues: Vec<String> = Vec::new();
        for binding in self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.matches(spec.kind, routing_key))
        {
            if !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }
        Ok(queues)
    }

    fn enqueue(&mut self, queue: &str, mut message: StoredMessage) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        message.enqueued_at = Instant::now();
        state.ready.push_back(message);
        if let Some(ttl) = state.spec.message_ttl {
            self.expiry_timers.push((queue.to_string(), ttl));
        }
    }

    /// Re-route `message` through the dead-letter destination of `queue`.
    /// Returns the queues that received it.
    fn dead_letter(
        &mut self,
        queue: &str,
        mut message: StoredMessage,
        reason: DeathReason,
    ) -> Vec<String> {
        let Some(target) = self
            .queues
            .get(queue)
            .and_then(|q| q.spec.dead_letter.clone())
        else {
            warn!(
                "Message {:?} {} in {} dropped: queue has no dead-letter route",
                message.message_id, reason, queue
            );
            return Vec::new();
        };

        match message
            .deaths
            .iter()
            .position(|d| d.queue == queue && d.reason == reason)
        {
            Some(index) => {
                let mut death = message.deaths.remove(index);
                death.count += 1;
                message.deaths.insert(0, death);
            }
            None => message.deaths.insert(
                0,
                DeathRecord {
                    queue: queue.to_string(),
                    exchange: message.exchange.clone(),
                    routing_keys: vec![message.routing_key.clone()],
                    reason,
                    count: 1,
                },
            ),
        }
        message.exchange = target.exchange.clone();
        message.routing_key = target.routing_key.clone();
        message.redelivered = false;

        match self.route(&target.exchange, &target.routing_key) {
            Ok(queues) if !queues.is_empty() => {
                for name in &queues {
                    self.enqueue(name, message.clone());
                }
                debug!("Dead-lettered message from {} ({}) to {}", queue, reason, target);
                queues
            }
            Ok(_) => {
                warn!(
                    "Dead letter from {} dropped: {} routes to no queue",
                    queue, target
                );
                Vec::new()
            }
            Err(e) => {
                warn!("Dead letter from {} dropped: {}", queue, e);
                Vec::new()
            }
        }
    }

    /// Dead-letter every ready message of `queue` that outlived the queue's TTL.
    fn expire(&mut self, queue: &str, now: Instant) -> Vec<String> {
        let Some(state) = self.queues.get_mut(queue) else {
            return Vec::new();
        };
        let Some(ttl) = state.spec.message_ttl else {
            return Vec::new();
        };

        let (expired, kept): (VecDeque<_>, VecDeque<_>) = state
            .ready
            .drain(..)
            .partition(|m| m.enqueued_at.checked_add(ttl).is_some_and(|at| now >= at));
        state.ready = kept;

        let mut touched = Vec::new();
        for message in expired {
            touched.extend(self.dead_letter(queue, message, DeathReason::Expired));
        }
        touched
    }

    /// Hand ready messages to consumers with free prefetch slots, round-robin.
    fn deliver(&mut self, queue: &str) {
        loop {
            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            if state.ready.is_empty() || state.consumers.is_empty() {
                return;
            }

            let count = state.consumers.len();
            let Some(index) = (0..count)
                .map(|offset| (state.cursor + offset) % count)
                .find(|&i| state.consumers[i].unacked < state.consumers[i].prefetch)
            else {
                return;
            };
            let Some(message) = state.ready.pop_front() else {
                return;
            };
            state.cursor = (index + 1) % count;

            self.next_tag += 1;
            let tag = self.next_tag;
            let consumer = &mut state.consumers[index];
            let delivery = message.to_delivery(tag, queue, Arc::clone(&consumer.acker));
            if consumer.tx.send(delivery).is_err() {
                // Session went away without closing; forget it and keep the message.
                state.consumers.remove(index);
                state.ready.push_front(message);
                continue;
            }
            consumer.unacked += 1;
            let session = consumer.session;
            self.in_flight.insert(
                tag,
                InFlight {
                    queue: queue.to_string(),
                    session,
                    message,
                },
            );
        }
    }

    /// Expire and deliver on every queue in `touched`, following dead-letter hops.
    fn pump(&mut self, mut touched: Vec<String>) {
        let now = Instant::now();
        while let Some(queue) = touched.pop() {
            let hops = self.expire(&queue, now);
            self.deliver(&queue);
            touched.extend(hops);
        }
    }

    fn settle(
        &mut self,
        session: u64,
        tag: u64,
        action: Settle,
    ) -> Result<Vec<String>, CourierError> {
        // Tags are only valid on the session that received them.
        if self.in_flight.get(&tag).map(|entry| entry.session) != Some(session) {
            return Err(unknown_tag(tag));
        }
        let Some(InFlight {
            queue, mut message, ..
        }) = self.in_flight.remove(&tag)
        else {
            return Err(unknown_tag(tag));
        };

        if let Some(state) = self.queues.get_mut(&queue) {
            if let Some(consumer) = state.consumers.iter_mut().find(|c| c.session == session) {
                consumer.unacked = consumer.unacked.saturating_sub(1);
            }
        }

        let mut touched = match action {
            Settle::Ack => Vec::new(),
            Settle::Requeue => {
                message.redelivered = true;
                if let Some(state) = self.queues.get_mut(&queue) {
                    state.ready.push_front(message);
                }
                Vec::new()
            }
            Settle::DeadLetter => self.dead_letter(&queue, message, DeathReason::Rejected),
        };
        touched.push(queue);
        Ok(touched)
    }

    /// Remove a consumer session and requeue its unsettled deliveries in their
    /// original order, flagged as redelivered.
    fn close_session(&mut self, queue: &str, session: u64) -> usize {
        if let Some(state) = self.queues.get_mut(queue) {
            state.consumers.retain(|c| c.session != session);
        }

        let mut tags: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.session == session)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let requeued = tags.len();
        for tag in tags {
            if let Some(mut entry) = self.in_flight.remove(&tag) {
                entry.message.redelivered = true;
                if let Some(state) = self.queues.get_mut(&entry.queue) {
                    state.ready.push_front(entry.message);
                }
            }
        }
        requeued
    }
}

fn unknown_tag(tag: u64) -> CourierError {
    CourierError::Internal(format!("PRECONDITION_FAILED - unknown delivery tag {}", tag))
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<PublishEvent>,
    reachable: AtomicBool,
    delay_supported: bool,
    this: Weak<Inner>,
}

impl Inner {
    fn check_reachable(&self) -> Result<(), CourierError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CourierError::Unavailable(
                "memory broker marked unreachable".to_string(),
            ))
        }
    }

    /// Run `f` under the state lock, then pump the queues it touched.
    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> (T, Vec<String>)) -> T {
        let (result, timers) = {
            let mut state = self.state.lock();
            let (result, touched) = f(&mut *state);
            state.pump(touched);
            (result, std::mem::take(&mut state.expiry_timers))
        };
        self.schedule_expiry(timers);
        result
    }

    fn schedule_expiry(&self, timers: Vec<(String, Duration)>) {
        if timers.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        for (queue, ttl) in timers {
            let this = self.this.clone();
            handle.spawn(async move {
                tokio::time::sleep(ttl).await;
                if let Some(inner) = this.upgrade() {
                    inner.with_state(|_| ((), vec![queue]));
                }
            });
        }
    }

    fn emit(&self, event: PublishEvent) {
        // No subscriber is fine: nobody asked for confirms.
        let _ = self.events.send(event);
    }
}

struct MemoryAcker {
    inner: Weak<Inner>,
    session: u64,
}

impl MemoryAcker {
    fn settle(&self, tag: u64, action: Settle) -> Result<(), CourierError> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| CourierError::Unavailable("memory broker dropped".to_string()))?;
        inner.check_reachable()?;
        inner.with_state(|state| match state.settle(self.session, tag, action) {
            Ok(touched) => (Ok(()), touched),
            Err(e) => (Err(e), Vec::new()),
        })
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), CourierError> {
        self.settle(delivery_tag, Settle::Ack)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), CourierError> {
        let action = if requeue {
            Settle::Requeue
        } else {
            Settle::DeadLetter
        };
        self.settle(delivery_tag, action)
    }
}

/// Consumer session: closing it (dropping the stream) requeues its unsettled deliveries.
struct MemorySession {
    rx: mpsc::UnboundedReceiver<Delivery>,
    queue: String,
    session: u64,
    inner: Weak<Inner>,
}

impl Stream for MemorySession {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let queue = self.queue.clone();
        let session = self.session;
        let requeued = inner.with_state(|state| {
            let requeued = state.close_session(&queue, session);
            (requeued, vec![queue.clone()])
        });
        if requeued > 0 {
            debug!(
                "Session {} on {} closed, {} unsettled message(s) requeued",
                session, self.queue, requeued
            );
        }
    }
}

/// Message broker kept in process memory.
///
/// Follows AMQP 0-9-1 semantics closely enough to test the coordination layer:
/// direct/topic/fanout routing, the default exchange, mandatory returns, publisher
/// confirms, manual ack with prefetch, requeue on session loss, dead-lettering on
/// reject and per-queue TTL, and delayed exchanges.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A broker whose delayed exchanges honour publish delays.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// A broker without delayed-delivery support.
    pub fn without_delay() -> Self {
        Self::build(false)
    }

    fn build(delay_supported: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new_cyclic(|this| Inner {
            state: Mutex::new(State::default()),
            events,
            reachable: AtomicBool::new(true),
            delay_supported,
            this: this.clone(),
        });
        Self { inner }
    }

    /// Simulate losing (or regaining) the connection to the broker.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Messages waiting in `queue` (not delivered to any session).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner.with_state(|state| {
            let depth = state.queues.get(queue).map_or(0, |q| q.ready.len());
            (depth, Vec::new())
        })
    }

    /// Delivered but unsettled messages of `queue`.
    pub fn in_flight_count(&self, queue: &str) -> usize {
        self.inner.with_state(|state| {
            let count = state.in_flight.values().filter(|m| m.queue == queue).count();
            (count, Vec::new())
        })
    }

    /// Payloads waiting in `queue`, head first.
    pub fn ready_payloads(&self, queue: &str) -> Vec<Bytes> {
        self.inner.with_state(|state| {
            let payloads = state
                .queues
                .get(queue)
                .map(|q| q.ready.iter().map(|m| m.payload.clone()).collect())
                .unwrap_or_default();
            (payloads, Vec::new())
        })
    }

    /// Open consumer sessions on `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner.with_state(|state| {
            let count = state.queues.get(queue).map_or(0, |q| q.consumers.len());
            (count, Vec::new())
        })
    }

    /// Close every consumer session on `queue` from the broker side, as a dropped
    /// connection would. Their streams end and their unsettled deliveries are requeued.
    pub fn drop_sessions(&self, queue: &str) -> usize {
        self.inner.with_state(|state| {
            let sessions: Vec<u64> = state
                .queues
                .get(queue)
                .map(|q| q.consumers.iter().map(|c| c.session).collect())
                .unwrap_or_default();
            for session in &sessions {
                state.close_session(queue, *session);
            }
            (sessions.len(), vec![queue.to_string()])
        })
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn supports_delay(&self) -> bool {
        self.inner.delay_supported
    }

    #[instrument(skip(self), level = "debug", fields(exchange = %exchange.name))]
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), CourierError> {
        self.inner.check_reachable()?;
        if exchange.name.is_empty() {
            return Err(CourierError::Topology(
                "ACCESS_REFUSED - the default exchange cannot be declared".to_string(),
            ));
        }
        if exchange.delayed && !self.inner.delay_supported {
            return Err(CourierError::Unsupported(format!(
                "delayed exchange {} requires delayed-delivery support",
                exchange.name
            )));
        }
        self.inner.with_state(|state| {
            let result = match state.exchanges.get(&exchange.name) {
                Some(existing) if existing == exchange => Ok(()),
                Some(_) => Err(CourierError::Topology(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for exchange '{}'",
                    exchange.name
                ))),
                None => {
                    state
                        .exchanges
                        .insert(exchange.name.clone(), exchange.clone());
                    debug!("Declared {} exchange {}", exchange.kind, exchange.name);
                    Ok(())
                }
            };
            (result, Vec::new())
        })
    }

    #[instrument(skip(self), level = "debug", fields(queue = %queue.name))]
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), CourierError> {
        self.inner.check_reachable()?;
        self.inner.with_state(|state| {
            let result = match state.queues.get(&queue.name) {
                Some(existing) if existing.spec == *queue => Ok(()),
                Some(_) => Err(CourierError::Topology(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                    queue.name
                ))),
                None => {
                    state.queues.insert(
                        queue.name.clone(),
                        QueueState {
                            spec: queue.clone(),
                            ready: VecDeque::new(),
                            consumers: Vec::new(),
                            cursor: 0,
                        },
                    );
                    debug!("Declared queue {}", queue.name);
                    Ok(())
                }
            };
            (result, Vec::new())
        })
    }

    async fn bind(&self, binding: &BindingSpec) -> Result<(), CourierError> {
        self.inner.check_reachable()?;
        self.inner.with_state(|state| {
            let result = if !state.exchanges.contains_key(&binding.exchange) {
                Err(CourierError::Topology(format!(
                    "NOT_FOUND - no exchange '{}'",
                    binding.exchange
                )))
            } else if !state.queues.contains_key(&binding.queue) {
                Err(CourierError::Topology(format!(
                    "NOT_FOUND - no queue '{}'",
                    binding.queue
                )))
            } else {
                if !state.bindings.contains(binding) {
                    state.bindings.push(binding.clone());
                }
                Ok(())
            };
            (result, Vec::new())
        })
    }

    #[instrument(skip(self, message), level = "debug", fields(destination = %message.destination))]
    async fn publish(&self, message: OutboundMessage) -> Result<u64, CourierError> {
        self.inner.check_reachable()?;
        let delay_supported = self.inner.delay_supported;

        let (sequence, routed) = self.inner.with_state(|state| {
            if message.delay.is_some() {
                let delayed = state
                    .exchanges
                    .get(&message.destination.exchange)
                    .is_some_and(|e| e.delayed);
                if !delay_supported || !delayed {
                    return (
                        Err(CourierError::Unsupported(format!(
                            "exchange {} does not support delayed delivery",
                            message.destination.exchange
                        ))),
                        Vec::new(),
                    );
                }
                state.next_sequence += 1;
                return (Ok((state.next_sequence, None)), Vec::new());
            }

            let queues = match state.route(
                &message.destination.exchange,
                &message.destination.routing_key,
            ) {
                Ok(queues) => queues,
                Err(e) => return (Err(e), Vec::new()),
            };
            state.next_sequence += 1;
            let stored = StoredMessage::from_outbound(&message);
            for queue in &queues {
                state.enqueue(queue, stored.clone());
            }
            (Ok((state.next_sequence, Some(queues.len()))), queues)
        })?;

        match routed {
            // Delayed: the exchange holds the message and routes it when the delay ends.
            None => {
                let delay = message.delay.unwrap_or_default();
                let this = Arc::downgrade(&self.inner);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let Some(inner) = this.upgrade() else {
                        return;
                    };
                    inner.with_state(|state| {
                        let stored = StoredMessage::from_outbound(&message);
                        match state.route(
                            &message.destination.exchange,
                            &message.destination.routing_key,
                        ) {
                            Ok(queues) => {
                                if queues.is_empty() {
                                    warn!(
                                        "Delayed message #{} to {} routes to no queue",
                                        sequence, message.destination
                                    );
                                }
                                for queue in &queues {
                                    state.enqueue(queue, stored.clone());
                                }
                                ((), queues)
                            }
                            Err(e) => {
                                warn!("Delayed message #{} dropped: {}", sequence, e);
                                ((), Vec::new())
                            }
                        }
                    });
                });
            }
            Some(0) if message.mandatory => {
                self.inner.emit(PublishEvent::Returned {
                    sequence,
                    destination: message.destination.clone(),
                    reply_code: NO_ROUTE,
                    reply_text: "NO_ROUTE".to_string(),
                });
            }
            Some(_) => {}
        }

        self.inner.emit(PublishEvent::Confirmed { sequence });
        Ok(sequence)
    }

    fn events(&self) -> broadcast::Receiver<PublishEvent> {
        self.inner.events.subscribe()
    }

    #[instrument(skip(self), level = "debug")]
    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, CourierError> {
        self.inner.check_reachable()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let prefetch = match options.prefetch {
            0 => usize::MAX,
            n => usize::from(n),
        };

        let session = self.inner.with_state(|state| {
            if !state.queues.contains_key(queue) {
                return (
                    Err(CourierError::Topology(format!(
                        "NOT_FOUND - no queue '{}'",
                        queue
                    ))),
                    Vec::new(),
                );
            }
            state.next_session += 1;
            let session = state.next_session;
            let acker: Arc<dyn Acknowledger> = Arc::new(MemoryAcker {
                inner: Arc::downgrade(&self.inner),
                session,
            });
            if let Some(q) = state.queues.get_mut(queue) {
                q.consumers.push(Consumer {
                    session,
                    tx,
                    acker,
                    prefetch,
                    unacked: 0,
                });
            }
            (Ok(session), vec![queue.to_string()])
        })?;

        debug!("Opened session {} on {}", session, queue);
        Ok(Box::pin(MemorySession {
            rx,
            queue: queue.to_string(),
            session,
            inner: Arc::downgrade(&self.inner),
        }))
    }
}
