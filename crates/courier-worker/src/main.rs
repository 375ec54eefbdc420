mod config;
mod handlers;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use courier_amqp::{AmqpBroker, AmqpConfig};
use courier_core::{
    Broker, DeadLetterSink, Destination, Dispatcher, LockManager, LockStore, OutboundMessage,
    Producer, Topology,
};
use courier_local::{FileJournal, MemoryBroker, MemoryLockStore};
use courier_redis::RedisLockStore;
use serde_json::json;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Backend, Config};
use handlers::{DirectHandler, LoggingHandler};

const DELAYED_EXCHANGE: &str = "delayed.exchange";
const DELAYED_QUEUE: &str = "delayed.queue";
const DELAYED_ROUTING_KEY: &str = "delayed.routing.key";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    info!("Starting courier worker");
    info!("  Backend: {}", config.backend);
    info!("  Lock namespace: {}", config.lock_namespace);
    info!(
        "  Consumers: {} worker(s) per queue, prefetch {}",
        config.consumer_workers, config.consumer_prefetch
    );
    info!("  Dead-letter journal: {}", config.dead_letter_journal.display());

    let (store, broker) = connect_backends(&config).await?;
    let locks = LockManager::with_config(store, config.lock_config());

    let topology = Arc::new(build_topology(broker.supports_delay()));
    topology.declare(broker.as_ref()).await?;

    let mut dispatcher = Dispatcher::new(Arc::clone(&broker));
    register_handlers(&mut dispatcher, &topology, &config, locks)?;
    dispatcher.start().await?;

    if config.publish_demo {
        let producer = Producer::new(Arc::clone(&broker), Arc::clone(&topology));
        if let Err(e) = publish_demo(&producer).await {
            warn!("Demo publish failed: {}", e);
        }
    }

    let mut shutdown_rx = create_shutdown_signal();
    let _ = shutdown_rx.wait_for(|&v| v).await;

    dispatcher.shutdown().await;
    info!("Worker shutdown complete");
    Ok(())
}

async fn connect_backends(
    config: &Config,
) -> anyhow::Result<(Arc<dyn LockStore>, Arc<dyn Broker>)> {
    match config.backend {
        Backend::Local => {
            info!("Using in-process lock store and broker");
            Ok((
                Arc::new(MemoryLockStore::new()),
                Arc::new(MemoryBroker::new()),
            ))
        }
        Backend::Remote => {
            let store = RedisLockStore::connect(&config.redis_url, config.redis_timeout()).await?;
            let broker = AmqpBroker::connect(AmqpConfig {
                uri: config.amqp_url.clone(),
                delayed_exchanges: config.amqp_delayed,
                ..AmqpConfig::default()
            })
            .await?;
            Ok((Arc::new(store), Arc::new(broker)))
        }
    }
}

/// The standard routes, plus the delayed route when the broker can delay.
fn build_topology(delayed: bool) -> Topology {
    let builder = Topology::builder()
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
        .fanout("fanout.exchange", &["fanout.queue.1", "fanout.queue.2"]);

    if delayed {
        builder
            .delayed(DELAYED_EXCHANGE, DELAYED_QUEUE, DELAYED_ROUTING_KEY)
            .build()
    } else {
        builder.build()
    }
}

fn register_handlers(
    dispatcher: &mut Dispatcher,
    topology: &Topology,
    config: &Config,
    locks: LockManager,
) -> anyhow::Result<()> {
    let options = config.consumer_options();

    dispatcher.register_handler_with(
        "direct.queue",
        Arc::new(DirectHandler::new(locks)),
        options,
    )?;
    for queue in ["topic.queue.1", "topic.queue.2"] {
        dispatcher.register_handler_with(queue, Arc::new(LoggingHandler::new("topic")), options)?;
    }
    for queue in ["fanout.queue.1", "fanout.queue.2"] {
        dispatcher.register_handler_with(
            queue,
            Arc::new(LoggingHandler::new("fanout")),
            options,
        )?;
    }
    if topology.queue(DELAYED_QUEUE).is_some() {
        dispatcher.register_handler_with(
            DELAYED_QUEUE,
            Arc::new(LoggingHandler::new("delayed")),
            options,
        )?;
    }

    if let Some(dead_letter) = topology.dead_letter() {
        let journal = Arc::new(FileJournal::new(&config.dead_letter_journal));
        // One worker: journal lines keep arrival order.
        dispatcher.register_handler(&dead_letter.queue, Arc::new(DeadLetterSink::new(journal)))?;
    }

    info!("Registered handlers for {:?}", dispatcher.queues());
    Ok(())
}

async fn publish_demo(producer: &Producer) -> anyhow::Result<()> {
    let envelope = producer
        .publish_event(
            &producer
                .topology()
                .direct_route()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no direct route"))?,
            json!({ "order": 42, "status": "created" }),
        )
        .await?;
    info!("Published demo event {}", envelope.id);

    producer.send_topic("topic.created", "topic message").await?;
    producer
        .send_topic("topic.created.eu", "nested topic message")
        .await?;
    producer.send_fanout("fanout message").await?;

    if producer.topology().exchange(DELAYED_EXCHANGE).is_some() {
        producer
            .publish_delayed(
                &Destination::new(DELAYED_EXCHANGE, DELAYED_ROUTING_KEY),
                "delayed message",
                Duration::from_secs(5),
            )
            .await?;
    }

    // Rejected by the topic handler, so it ends up in the dead-letter journal.
    producer
        .publish_message(
            OutboundMessage::new(Destination::new("topic.exchange", "topic.poison"), "{oops")
                .with_content_type("application/json"),
        )
        .await?;
    info!("Published demo messages");
    Ok(())
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                Err(e) => {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_with_and_without_delay() {
        let plain = build_topology(false);
        assert!(plain.exchange(DELAYED_EXCHANGE).is_none());
        assert_eq!(
            plain.dead_letter().map(|d| d.queue.as_str()),
            Some("dead.letter.queue")
        );

        let delayed = build_topology(true);
        assert!(delayed.exchange(DELAYED_EXCHANGE).is_some_and(|e| e.delayed));
        assert_eq!(
            delayed.route(&Destination::new(DELAYED_EXCHANGE, DELAYED_ROUTING_KEY)),
            vec![DELAYED_QUEUE]
        );
    }

    #[tokio::test]
    async fn test_worker_wiring_on_local_backend() {
        let temp = tempfile::TempDir::new().unwrap();
        let journal = temp.path().join("dead.jsonl");
        let config = Config::try_parse_from([
            "courier-worker",
            "--backend",
            "local",
            "--dead-letter-journal",
            journal.to_str().unwrap(),
        ])
        .unwrap();

        let (store, broker) = connect_backends(&config).await.unwrap();
        let topology = Arc::new(build_topology(broker.supports_delay()));
        topology.declare(broker.as_ref()).await.unwrap();

        let mut dispatcher = Dispatcher::new(Arc::clone(&broker));
        let locks = LockManager::with_config(store, config.lock_config());
        register_handlers(&mut dispatcher, &topology, &config, locks).unwrap();
        assert_eq!(dispatcher.queues().len(), 7);
        dispatcher.start().await.unwrap();

        let producer = Producer::new(Arc::clone(&broker), Arc::clone(&topology));
        publish_demo(&producer).await.unwrap();

        dispatcher.shutdown().await;
    }
}
