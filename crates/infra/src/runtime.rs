//! Entry points for host binaries.
//!
//! - `produce_once`: drain the outbox one time (cron-style producer)
//! - `spawn_consumers`: one supervised queue bridge per bounded context
//! - `spawn_processors`: one supervised, periodic inbox processor per shard
//!
//! Argument parsing and exit codes belong to the host.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use courier_events::{Broker, HandlerRegistry};

use crate::config::CourierConfig;
use crate::inbox::{InboxProcessor, QueueBridge};
use crate::outbox::{OutboxPublisher, PublishReport};
use crate::routing::RoutingRegistry;
use crate::store::{InboxRecord, OutboxRecord, Store};
use crate::workers::{Supervisor, run_every};

/// Publish pending outbox rows once.
pub fn produce_once<S, B>(store: S, broker: B, config: &CourierConfig) -> anyhow::Result<PublishReport>
where
    S: Store<OutboxRecord>,
    B: Broker,
{
    let publisher = OutboxPublisher::new(
        store,
        broker,
        config.root_exchange.clone(),
        config.outbox_batch_size,
    );
    publisher.publish_pending().context("outbox pass failed")
}

/// Start one supervised queue bridge per registry.
///
/// Returns the supervised task names.
pub fn spawn_consumers<'r, S, B, C, I>(
    supervisor: &mut Supervisor,
    store: S,
    broker: B,
    registries: I,
    config: &CourierConfig,
) -> anyhow::Result<Vec<String>>
where
    S: Store<InboxRecord> + Clone + 'static,
    B: Broker + Clone + 'static,
    C: 'r,
    I: IntoIterator<Item = &'r HandlerRegistry<C>>,
{
    let mut names = Vec::new();
    for registry in registries {
        let bridge = Arc::new(QueueBridge::new(
            store.clone(),
            broker.clone(),
            registry,
            config.root_exchange.clone(),
        ));
        let name = format!("{}-bridge", bridge.consumer());
        supervisor
            .spawn(name.clone(), move |token| Ok(bridge.run(token)?))
            .with_context(|| format!("starting {name}"))?;
        info!(task = %name, "queue bridge scheduled");
        names.push(name);
    }
    Ok(names)
}

/// Start a supervised inbox processor for every shard of `routing`.
///
/// Each task runs `consume_batch(inbox_batch_size)` every poll interval and is
/// restarted by `supervisor` if its thread dies. Construction errors (bad
/// routing, zero max attempts) are returned before any task starts.
///
/// Returns the supervised task names.
pub fn spawn_processors<S, C>(
    supervisor: &mut Supervisor,
    store: S,
    registry: Arc<HandlerRegistry<C>>,
    routing: Arc<RoutingRegistry>,
    ctx: C,
    config: &CourierConfig,
) -> anyhow::Result<Vec<String>>
where
    S: Store<InboxRecord> + Send + Sync + Clone + 'static,
    C: Clone + Send + Sync + 'static,
{
    let mut processors = Vec::new();
    for shard in routing.all_shards() {
        let processor = InboxProcessor::new(
            store.clone(),
            Arc::clone(&registry),
            Arc::clone(&routing),
            shard.strategy_name(),
            shard.consumer_id(),
            config.inbox_max_attempts,
            ctx.clone(),
        )?;
        let name = format!(
            "{}-{}-{}",
            registry.context_name(),
            shard.strategy_name(),
            shard.consumer_id()
        );
        processors.push((name, Arc::new(processor)));
    }

    let batch_size = config.inbox_batch_size;
    let interval = config.poll_interval();
    let mut names = Vec::with_capacity(processors.len());
    for (name, processor) in processors {
        let task_name = name.clone();
        supervisor
            .spawn(name.clone(), move |token| {
                run_every(&task_name, interval, token, || {
                    processor.consume_batch(batch_size).map(drop)
                });
                Ok(())
            })
            .with_context(|| format!("starting {name}"))?;
        info!(task = %name, "inbox processor scheduled");
        names.push(name);
    }
    Ok(names)
}
