//! Outbox → broker → inbox → handlers, end to end over the in-memory backends.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use courier_core::TransactionId;
use courier_events::{Broker, Event, HandlerMode, HandlerRegistry, InMemoryBroker};
use courier_infra::{
    DEFAULT_STRATEGY, InMemoryStore, InboxProcessor, InboxRecord, InboxStatus, IngestOutcome,
    OutboxPublisher, OutboxRecord, OutboxWriter, QueueBridge, RoutingRegistry, Store, hash_key,
};
use courier_observability::TraceContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPlaced {
    customer: String,
    seq: u32,
}

impl Event for OrderPlaced {
    fn event_type(&self) -> &'static str {
        "order.placed"
    }
}

/// Infrastructure handed to billing handlers.
#[derive(Clone, Default)]
struct Billing {
    charged: Arc<Mutex<Vec<(String, u32)>>>,
    poisoned: Arc<Mutex<Vec<u32>>>,
}

fn billing_registry() -> Arc<HandlerRegistry<Billing>> {
    let mut registry = HandlerRegistry::new("billing");
    registry.register_typed(
        "order.placed",
        "charge",
        HandlerMode::Async,
        |billing: &Billing, event: OrderPlaced, _| {
            if billing.poisoned.lock().unwrap().contains(&event.seq) {
                anyhow::bail!("card declined for order {}", event.seq);
            }
            billing.charged.lock().unwrap().push((event.customer, event.seq));
            Ok(())
        },
    );
    Arc::new(registry)
}

fn seed_inbox(store: &InMemoryStore<InboxRecord>, customer: &str, seq: u32) -> InboxRecord {
    let record = InboxRecord::new(
        "billing",
        "order.placed",
        TransactionId::new(),
        serde_json::json!({ "customer": customer, "seq": seq }),
        TraceContext::empty(),
    );
    store.get_or_create(record.clone()).unwrap();
    thread::sleep(Duration::from_millis(2));
    record
}

#[test]
fn redelivered_events_are_handled_once() {
    let broker = InMemoryBroker::new();
    let outbox: Arc<InMemoryStore<OutboxRecord>> = Arc::new(InMemoryStore::new());
    let inbox: Arc<InMemoryStore<InboxRecord>> = Arc::new(InMemoryStore::new());
    let registry = billing_registry();
    let billing = Billing::default();

    let bridge = QueueBridge::new(Arc::clone(&inbox), broker.clone(), registry.as_ref(), "courier");
    let subscription = broker.subscribe(bridge.consumer(), bridge.topics()).unwrap();
    broker.set_delivery_copies(3);

    let writer: OutboxWriter<()> = OutboxWriter::new();
    let mut tx = outbox.begin().unwrap();
    for seq in 0..2 {
        writer
            .record_event(&(), tx.as_mut(), &OrderPlaced { customer: "alice".into(), seq })
            .unwrap();
    }
    tx.commit().unwrap();

    let publisher = OutboxPublisher::new(Arc::clone(&outbox), broker.clone(), "courier", 10);
    assert_eq!(publisher.publish_pending().unwrap().published, 2);

    let mut outcomes = Vec::new();
    while let Ok(delivery) = subscription.try_recv() {
        outcomes.push(bridge.ingest(delivery).unwrap());
    }
    assert_eq!(outcomes.len(), 6);
    let stored = outcomes
        .iter()
        .filter(|o| matches!(o, IngestOutcome::Stored(_)))
        .count();
    assert_eq!(stored, 2);
    assert_eq!(inbox.rows().len(), 2);

    let processor = InboxProcessor::new(
        Arc::clone(&inbox),
        Arc::clone(&registry),
        Arc::new(RoutingRegistry::new()),
        DEFAULT_STRATEGY,
        0,
        5,
        billing.clone(),
    )
    .unwrap();
    assert_eq!(processor.consume_batch(50).unwrap().processed, 2);
    assert!(processor.consume_batch(50).unwrap().is_empty());
    assert_eq!(
        *billing.charged.lock().unwrap(),
        vec![("alice".to_string(), 0), ("alice".to_string(), 1)]
    );
}

#[test]
fn outbox_rows_are_only_marked_sent_after_a_confirmed_publish() {
    let broker = InMemoryBroker::new();
    let outbox: Arc<InMemoryStore<OutboxRecord>> = Arc::new(InMemoryStore::new());
    for seq in 0..3 {
        let record = OutboxRecord::for_event(&OrderPlaced { customer: "bob".into(), seq }).unwrap();
        outbox.get_or_create(record).unwrap();
        thread::sleep(Duration::from_millis(2));
    }
    let publisher = OutboxPublisher::new(Arc::clone(&outbox), broker.clone(), "courier", 10);

    broker.fail_next_publishes(1);
    let report = publisher.publish_pending().unwrap();
    assert!(report.failed.is_some());
    assert!(outbox.rows().iter().all(|r| !r.sent));

    publisher.publish_pending().unwrap();
    let published = broker.published();
    for row in outbox.rows() {
        assert!(row.sent);
        assert!(
            published
                .iter()
                .any(|m| m.message_id.as_deref() == Some(row.transaction_id.to_string().as_str())),
            "row {} marked sent without a publish",
            row.transaction_id
        );
    }
}

#[test]
fn a_failing_record_blocks_later_records_of_its_shard() {
    let inbox: Arc<InMemoryStore<InboxRecord>> = Arc::new(InMemoryStore::new());
    let billing = Billing::default();
    billing.poisoned.lock().unwrap().push(1);

    let mut routing = RoutingRegistry::new();
    routing
        .register("by-customer", ["order.placed"], 2, |r: &InboxRecord| {
            hash_key(r.payload["customer"].as_str().unwrap_or_default())
        })
        .unwrap();
    let routing = Arc::new(routing);
    let owner = |customer: &str| {
        let probe = InboxRecord::new(
            "billing",
            "order.placed",
            TransactionId::new(),
            serde_json::json!({ "customer": customer }),
            TraceContext::empty(),
        );
        routing.resolve("order.placed").shard_of(&probe)
    };

    let alice = (0..3).map(|seq| seed_inbox(&inbox, "alice", seq)).collect::<Vec<_>>();
    let shard = owner("alice");
    let processor = InboxProcessor::new(
        Arc::clone(&inbox),
        billing_registry(),
        Arc::clone(&routing),
        "by-customer",
        shard,
        5,
        billing.clone(),
    )
    .unwrap();

    let report = processor.consume_batch(10).unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.halted_at, Some(alice[1].id));

    let status = |id: courier_core::InboxId| inbox.get(id).unwrap().unwrap().status;
    assert_eq!(status(alice[0].id), InboxStatus::Processed);
    assert_eq!(status(alice[1].id), InboxStatus::Error);
    assert_eq!(status(alice[2].id), InboxStatus::Pending);

    // Once the failure clears, the shard catches up in order.
    billing.poisoned.lock().unwrap().clear();
    assert_eq!(processor.consume_batch(10).unwrap().processed, 2);
    let seqs: Vec<u32> = billing.charged.lock().unwrap().iter().map(|(_, s)| *s).collect();
    assert_eq!(seqs, vec![0, 1, 2]);
}

#[test]
fn attempts_count_up_to_the_dead_letter_ceiling() {
    let inbox: Arc<InMemoryStore<InboxRecord>> = Arc::new(InMemoryStore::new());
    let billing = Billing::default();
    billing.poisoned.lock().unwrap().push(7);
    let stuck = seed_inbox(&inbox, "carol", 7);
    let next = seed_inbox(&inbox, "carol", 8);

    let processor = InboxProcessor::new(
        Arc::clone(&inbox),
        billing_registry(),
        Arc::new(RoutingRegistry::new()),
        DEFAULT_STRATEGY,
        0,
        3,
        billing.clone(),
    )
    .unwrap();

    for attempt in 1..=2 {
        let report = processor.consume_batch(10).unwrap();
        assert_eq!(report.halted_at, Some(stuck.id));
        assert_eq!(report.dead_lettered, 0);
        let row = inbox.get(stuck.id).unwrap().unwrap();
        assert_eq!(row.attempts_number, attempt);
        assert_eq!(row.status, InboxStatus::Error);
        assert_eq!(inbox.get(next.id).unwrap().unwrap().status, InboxStatus::Pending);
    }

    let report = processor.consume_batch(10).unwrap();
    assert_eq!(report.dead_lettered, 1);
    let row = inbox.get(stuck.id).unwrap().unwrap();
    assert_eq!(row.attempts_number, 3);
    assert_eq!(row.status, InboxStatus::DeadLetter);
    assert!(row.last_error().unwrap_or_default().contains("card declined"));

    // The dead letter no longer blocks the shard.
    assert_eq!(processor.consume_batch(10).unwrap().processed, 1);
    assert_eq!(inbox.get(next.id).unwrap().unwrap().status, InboxStatus::Processed);
    assert!(inbox.get(stuck.id).unwrap().unwrap().last_execution_date.unwrap() <= Utc::now());
}

#[test]
fn an_empty_inbox_is_a_no_op() {
    let inbox: Arc<InMemoryStore<InboxRecord>> = Arc::new(InMemoryStore::new());
    let processor = InboxProcessor::new(
        Arc::clone(&inbox),
        billing_registry(),
        Arc::new(RoutingRegistry::new()),
        DEFAULT_STRATEGY,
        0,
        3,
        Billing::default(),
    )
    .unwrap();
    assert!(processor.consume_batch(10).unwrap().is_empty());
    assert!(inbox.rows().is_empty());
}
