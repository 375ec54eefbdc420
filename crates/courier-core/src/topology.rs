use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::broker::Broker;
use crate::error::CourierError;

/// Exchange routing semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    /// Exact routing-key match.
    Direct,
    /// Dot-separated pattern match (`*` one word, `#` zero or more words).
    Topic,
    /// Every bound queue, routing key ignored.
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical address of a published message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub exchange: String,
    pub routing_key: String,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Fan-out address: the routing key is ignored by the exchange.
    pub fn fanout(exchange: impl Into<String>) -> Self {
        Self::new(exchange, "")
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    /// Declared as a delayed-message exchange; required for delayed publishing.
    pub delayed: bool,
}

impl ExchangeSpec {
    /// A durable, non-auto-delete exchange.
    pub fn durable(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            auto_delete: false,
            delayed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Where the broker sends rejected and expired messages.
    pub dead_letter: Option<Destination>,
    /// Per-queue message time-to-live.
    pub message_ttl: Option<Duration>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter: None,
            message_ttl: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    /// Exact key (direct), pattern (topic), ignored (fanout).
    pub routing_key: String,
}

impl BindingSpec {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Whether a message published with `routing_key` to an exchange of `kind`
    /// follows this binding.
    pub fn matches(&self, kind: ExchangeKind, routing_key: &str) -> bool {
        match kind {
            ExchangeKind::Direct => self.routing_key == routing_key,
            ExchangeKind::Topic => topic_matches(&self.routing_key, routing_key),
            ExchangeKind::Fanout => true,
        }
    }
}

/// AMQP topic pattern matching over dot-separated words.
///
/// `*` matches exactly one word, `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

/// Terminal route for rejected and expired messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRoute {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl DeadLetterRoute {
    pub fn destination(&self) -> Destination {
        Destination::new(&self.exchange, &self.routing_key)
    }
}

/// Static set of exchanges, queues and bindings shared by producers and consumers.
///
/// Declared once at startup. Declaring the same entities again is a no-op;
/// a conflicting declaration fails with `CourierError::Topology`.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    exchanges: Vec<ExchangeSpec>,
    queues: Vec<QueueSpec>,
    bindings: Vec<BindingSpec>,
    dead_letter: Option<DeadLetterRoute>,
    direct: Option<Destination>,
    topic_exchange: Option<String>,
    fanout_exchange: Option<String>,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    /// The default routes of the service template.
    pub fn standard() -> Self {
        Topology::builder()
            .dead_letter(
                "dead.letter.exchange",
                "dead.letter.queue",
                "dead.letter.routing.key",
            )
            .direct("direct.exchange", "direct.queue", "direct.routing.key")
            .topic(
                "topic.exchange",
                &[("topic.queue.1", "topic.*"), ("topic.queue.2", "topic.#")],
            )
            .fanout("fanout.exchange", &["fanout.queue.1", "fanout.queue.2"])
            .build()
    }

    pub fn exchanges(&self) -> &[ExchangeSpec] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueSpec] {
        &self.queues
    }

    pub fn bindings(&self) -> &[BindingSpec] {
        &self.bindings
    }

    pub fn dead_letter(&self) -> Option<&DeadLetterRoute> {
        self.dead_letter.as_ref()
    }

    pub fn exchange(&self, name: &str) -> Option<&ExchangeSpec> {
        self.exchanges.iter().find(|e| e.name == name)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// First direct route declared with `direct`.
    pub fn direct_route(&self) -> Option<&Destination> {
        self.direct.as_ref()
    }

    /// First exchange declared with `topic`.
    pub fn topic_exchange(&self) -> Option<&str> {
        self.topic_exchange.as_deref()
    }

    /// First exchange declared with `fanout`.
    pub fn fanout_exchange(&self) -> Option<&str> {
        self.fanout_exchange.as_deref()
    }

    /// Queues a message sent to `destination` would reach, per this topology.
    pub fn route(&self, destination: &Destination) -> Vec<&str> {
        let Some(exchange) = self.exchange(&destination.exchange) else {
            return Vec::new();
        };
        let mut queues: Vec<&str> = Vec::new();
        for binding in &self.bindings {
            if binding.exchange == exchange.name
                && binding.matches(exchange.kind, &destination.routing_key)
                && !queues.contains(&binding.queue.as_str())
            {
                queues.push(&binding.queue);
            }
        }
        queues
    }

    /// Declare every exchange, queue and binding on `broker`, in that order.
    pub async fn declare(&self, broker: &dyn Broker) -> Result<(), CourierError> {
        for exchange in &self.exchanges {
            broker.declare_exchange(exchange).await?;
        }
        for queue in &self.queues {
            broker.declare_queue(queue).await?;
        }
        for binding in &self.bindings {
            broker.bind(binding).await?;
        }
        info!(
            "Declared topology on {}: {} exchange(s), {} queue(s), {} binding(s)",
            broker.backend_name(),
            self.exchanges.len(),
            self.queues.len(),
            self.bindings.len()
        );
        Ok(())
    }
}

/// Builder for `Topology`.
///
/// When a dead-letter route is configured, every other queue gets it as its
/// overflow destination at `build` time, regardless of call order.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    topology: Topology,
    ttls: Vec<(String, Duration)>,
}

impl TopologyBuilder {
    fn add_exchange(&mut self, exchange: ExchangeSpec) {
        if !self.topology.exchanges.contains(&exchange) {
            self.topology.exchanges.push(exchange);
        }
    }

    fn add_queue(&mut self, name: &str) {
        if self.topology.queue(name).is_none() {
            self.topology.queues.push(QueueSpec::durable(name));
        }
    }

    fn add_binding(&mut self, binding: BindingSpec) {
        if !self.topology.bindings.contains(&binding) {
            self.topology.bindings.push(binding);
        }
    }

    /// Point-to-point route: one exchange, one queue, exact routing key.
    pub fn direct(mut self, exchange: &str, queue: &str, routing_key: &str) -> Self {
        self.add_exchange(ExchangeSpec::durable(exchange, ExchangeKind::Direct));
        self.add_queue(queue);
        self.add_binding(BindingSpec::new(queue, exchange, routing_key));
        if self.topology.direct.is_none() {
            self.topology.direct = Some(Destination::new(exchange, routing_key));
        }
        self
    }

    /// Selective broadcast: `(queue, pattern)` pairs bound to one topic exchange.
    pub fn topic(mut self, exchange: &str, bindings: &[(&str, &str)]) -> Self {
        self.add_exchange(ExchangeSpec::durable(exchange, ExchangeKind::Topic));
        for (queue, pattern) in bindings {
            self.add_queue(queue);
            self.add_binding(BindingSpec::new(*queue, exchange, *pattern));
        }
        if self.topology.topic_exchange.is_none() {
            self.topology.topic_exchange = Some(exchange.to_string());
        }
        self
    }

    /// Broadcast to every listed queue.
    pub fn fanout(mut self, exchange: &str, queues: &[&str]) -> Self {
        self.add_exchange(ExchangeSpec::durable(exchange, ExchangeKind::Fanout));
        for queue in queues {
            self.add_queue(queue);
            self.add_binding(BindingSpec::new(*queue, exchange, ""));
        }
        if self.topology.fanout_exchange.is_none() {
            self.topology.fanout_exchange = Some(exchange.to_string());
        }
        self
    }

    /// Delay-capable direct exchange bound to `queue`.
    pub fn delayed(mut self, exchange: &str, queue: &str, routing_key: &str) -> Self {
        let mut spec = ExchangeSpec::durable(exchange, ExchangeKind::Direct);
        spec.delayed = true;
        self.add_exchange(spec);
        self.add_queue(queue);
        self.add_binding(BindingSpec::new(queue, exchange, routing_key));
        self
    }

    /// Dedicated dead-letter exchange, queue and routing key.
    pub fn dead_letter(mut self, exchange: &str, queue: &str, routing_key: &str) -> Self {
        self.add_exchange(ExchangeSpec::durable(exchange, ExchangeKind::Direct));
        self.add_queue(queue);
        self.add_binding(BindingSpec::new(queue, exchange, routing_key));
        self.topology.dead_letter = Some(DeadLetterRoute {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        });
        self
    }

    /// Expire messages that wait longer than `ttl` in `queue`.
    pub fn message_ttl(mut self, queue: &str, ttl: Duration) -> Self {
        self.ttls.push((queue.to_string(), ttl));
        self
    }

    pub fn build(self) -> Topology {
        let TopologyBuilder { mut topology, ttls } = self;

        if let Some(route) = topology.dead_letter.clone() {
            for queue in topology.queues.iter_mut().filter(|q| q.name != route.queue) {
                queue.dead_letter = Some(route.destination());
            }
        }
        for (name, ttl) in ttls {
            if let Some(queue) = topology.queues.iter_mut().find(|q| q.name == name) {
                queue.message_ttl = Some(ttl);
            }
        }
        topology
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_single_word_wildcard() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(!topic_matches("orders.*", "orders"));
    }

    #[test]
    fn test_topic_multi_word_wildcard() {
        assert!(topic_matches("orders.#", "orders.created"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(!topic_matches("orders.#", "payments.created"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("#.eu", "orders.created.eu"));
        assert!(topic_matches("*.created.#", "orders.created"));
    }

    #[test]
    fn test_topic_literal() {
        assert!(topic_matches("orders.created", "orders.created"));
        assert!(!topic_matches("orders.created", "orders.updated"));
    }

    #[test]
    fn test_standard_topology_dead_letter_args() {
        let topology = Topology::standard();
        let dlq = topology.dead_letter().unwrap();
        assert_eq!(dlq.queue, "dead.letter.queue");

        for queue in topology.queues() {
            if queue.name == dlq.queue {
                assert!(queue.dead_letter.is_none());
            } else {
                assert_eq!(queue.dead_letter, Some(dlq.destination()), "{}", queue.name);
            }
            assert!(queue.durable);
        }
        assert!(topology.exchanges().iter().all(|e| e.durable));
    }

    #[test]
    fn test_routing() {
        let topology = Topology::standard();

        assert_eq!(
            topology.route(&Destination::new("topic.exchange", "topic.created")),
            vec!["topic.queue.1", "topic.queue.2"]
        );
        assert_eq!(
            topology.route(&Destination::new("topic.exchange", "topic.created.eu")),
            vec!["topic.queue.2"]
        );
        assert_eq!(
            topology.route(&Destination::fanout("fanout.exchange")),
            vec!["fanout.queue.1", "fanout.queue.2"]
        );
        assert!(topology
            .route(&Destination::new("direct.exchange", "other.key"))
            .is_empty());
        assert_eq!(
            topology.direct_route(),
            Some(&Destination::new("direct.exchange", "direct.routing.key"))
        );
    }

    #[test]
    fn test_builder_dedupes_identical_entries() {
        let topology = Topology::builder()
            .direct("ex", "q", "k")
            .direct("ex", "q", "k")
            .message_ttl("q", Duration::from_secs(5))
            .build();
        assert_eq!(topology.exchanges().len(), 1);
        assert_eq!(topology.queues().len(), 1);
        assert_eq!(topology.bindings().len(), 1);
        assert_eq!(
            topology.queue("q").unwrap().message_ttl,
            Some(Duration::from_secs(5))
        );
    }
}
