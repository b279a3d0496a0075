use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;

use courier_core::TransactionId;
use courier_events::{Broker, Headers, HandlerMode, HandlerRegistry, InMemoryBroker, PublishedMessage};
use courier_infra::{InMemoryStore, InboxRecord, QueueBridge, RoutingRegistry, hash_key};
use courier_observability::TraceContext;

fn registry() -> HandlerRegistry<()> {
    let mut registry = HandlerRegistry::new("shipping");
    registry.register("order.placed", "ship", HandlerMode::Async, |_, _| Ok(()));
    registry
}

fn by_customer() -> RoutingRegistry {
    let mut routing = RoutingRegistry::new();
    routing
        .register("by-customer", ["order.placed"], 2, |r: &InboxRecord| {
            hash_key(r.payload["customer"].as_str().unwrap_or_default())
        })
        .unwrap();
    routing
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// However often and in whatever order deliveries repeat, each transaction
    /// id yields exactly one inbox row.
    #[test]
    fn redelivery_never_duplicates_inbox_rows(
        copies in prop::collection::vec(1usize..5, 1..8),
        order_seed in any::<u64>(),
    ) {
        let store: Arc<InMemoryStore<InboxRecord>> = Arc::new(InMemoryStore::new());
        let broker = InMemoryBroker::new();
        let bridge = QueueBridge::new(Arc::clone(&store), broker.clone(), &registry(), "courier");
        let subscription = broker.subscribe(bridge.consumer(), bridge.topics()).unwrap();

        let ids: Vec<TransactionId> = copies.iter().map(|_| TransactionId::new()).collect();
        let mut sends: Vec<TransactionId> = ids
            .iter()
            .zip(&copies)
            .flat_map(|(id, n)| std::iter::repeat_n(*id, *n))
            .collect();
        // Deterministic shuffle driven by the seed.
        let len = sends.len();
        for i in 0..len {
            let j = (order_seed.wrapping_mul(i as u64 + 1) % len as u64) as usize;
            sends.swap(i, j);
        }

        for id in &sends {
            broker
                .inject(PublishedMessage {
                    topic: "courier.order.placed".to_string(),
                    body: b"{}".to_vec(),
                    headers: Headers::new(),
                    message_id: Some(id.to_string()),
                })
                .unwrap();
        }
        while let Ok(delivery) = subscription.try_recv() {
            bridge.ingest(delivery).unwrap();
        }

        let rows = store.rows();
        let stored: BTreeSet<TransactionId> = rows.iter().map(|r| r.transaction_id).collect();
        prop_assert_eq!(rows.len(), ids.len());
        prop_assert_eq!(stored, ids.into_iter().collect::<BTreeSet<_>>());
        prop_assert_eq!(broker.acked_count(), sends.len());
    }

    /// The same routing key always lands on the same shard, whichever registry
    /// instance computes it.
    #[test]
    fn routing_is_stable_per_key(customer in "[a-z0-9-]{1,24}") {
        let first = by_customer();
        let second = by_customer();
        let record = |c: &str| {
            InboxRecord::new(
                "shipping",
                "order.placed",
                TransactionId::new(),
                serde_json::json!({ "customer": c }),
                TraceContext::empty(),
            )
        };

        let a = first.resolve("order.placed").shard_of(&record(&customer));
        let b = second.resolve("order.placed").shard_of(&record(&customer));
        prop_assert_eq!(a, b);
        prop_assert!(a < 2);
        prop_assert_eq!(u64::from(a), hash_key(&customer) % 2);
    }
}
