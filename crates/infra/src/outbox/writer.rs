//! Producer side of the outbox.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use courier_events::{Event, EventEnvelope, HandlerRegistry};

use super::OutboxError;
use crate::store::{OutboxRecord, Transaction};

/// Records outgoing events in the caller's transaction.
///
/// The outbox row commits or rolls back together with the caller's write.
/// When built with a handler registry, the registry's synchronous handlers run
/// in-process before `record` returns; a failing synchronous handler fails the
/// call so the caller can roll the whole transaction back.
pub struct OutboxWriter<C> {
    sync_handlers: Option<Arc<HandlerRegistry<C>>>,
}

impl<C> OutboxWriter<C> {
    pub fn new() -> Self {
        Self { sync_handlers: None }
    }

    pub fn with_sync_handlers(registry: Arc<HandlerRegistry<C>>) -> Self {
        Self {
            sync_handlers: Some(registry),
        }
    }

    pub fn record(
        &self,
        ctx: &C,
        tx: &mut dyn Transaction<OutboxRecord>,
        event_name: &str,
        payload: JsonValue,
    ) -> Result<OutboxRecord, OutboxError> {
        self.write(ctx, tx, OutboxRecord::new(event_name, payload))
    }

    pub fn record_event<E: Event>(
        &self,
        ctx: &C,
        tx: &mut dyn Transaction<OutboxRecord>,
        event: &E,
    ) -> Result<OutboxRecord, OutboxError> {
        self.write(ctx, tx, OutboxRecord::for_event(event)?)
    }

    fn write(
        &self,
        ctx: &C,
        tx: &mut dyn Transaction<OutboxRecord>,
        record: OutboxRecord,
    ) -> Result<OutboxRecord, OutboxError> {
        tx.insert(&record)?;

        if let Some(registry) = &self.sync_handlers {
            let _trace = record.trace_context.enter();
            let envelope = EventEnvelope::new(
                record.event_name.clone(),
                record.transaction_id,
                record.payload.clone(),
                record.creation_date,
                record.trace_context.clone(),
                1,
            );
            let ran = registry.dispatch_sync(ctx, &envelope)?;
            tracing::debug!(
                event_name = %record.event_name,
                transaction_id = %record.transaction_id,
                handlers = ran,
                "synchronous handlers ran"
            );
        }
        Ok(record)
    }
}

impl<C> Default for OutboxWriter<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde::Serialize;

    use courier_events::HandlerMode;
    use courier_observability::TraceContext;

    use super::*;
    use crate::store::{InMemoryStore, Store};

    #[derive(Debug, Serialize)]
    struct OrderPlaced {
        order_id: String,
    }

    impl Event for OrderPlaced {
        fn event_type(&self) -> &'static str {
            "order.placed"
        }
    }

    #[derive(Default)]
    struct Audit {
        seen: Mutex<Vec<String>>,
    }

    #[test]
    fn record_commits_with_the_callers_transaction() {
        let store: InMemoryStore<OutboxRecord> = InMemoryStore::new();
        let writer: OutboxWriter<()> = OutboxWriter::new();

        let mut tx = store.begin().unwrap();
        let record = writer
            .record_event(&(), tx.as_mut(), &OrderPlaced { order_id: "o-1".to_string() })
            .unwrap();
        assert!(store.get(record.id).unwrap().is_none());
        tx.commit().unwrap();

        let stored = store.get(record.id).unwrap().unwrap();
        assert_eq!(stored.event_name, "order.placed");
        assert_eq!(stored.payload, serde_json::json!({"order_id": "o-1"}));
        assert!(!stored.sent);
    }

    #[test]
    fn rolled_back_transaction_leaves_no_record() {
        let store: InMemoryStore<OutboxRecord> = InMemoryStore::new();
        let writer: OutboxWriter<()> = OutboxWriter::new();

        let mut tx = store.begin().unwrap();
        writer
            .record(&(), tx.as_mut(), "order.placed", serde_json::json!({}))
            .unwrap();
        tx.rollback().unwrap();
        assert!(store.rows().is_empty());
    }

    #[test]
    fn records_inherit_the_active_trace() {
        let store: InMemoryStore<OutboxRecord> = InMemoryStore::new();
        let writer: OutboxWriter<()> = OutboxWriter::new();
        let parent = TraceContext::new_root();

        let mut tx = store.begin().unwrap();
        let record = {
            let _guard = parent.enter();
            writer
                .record(&(), tx.as_mut(), "order.placed", serde_json::json!({}))
                .unwrap()
        };
        assert_eq!(record.trace_context.trace_id(), parent.trace_id());
    }

    #[test]
    fn sync_handlers_run_and_can_veto() {
        let mut registry = HandlerRegistry::new("sales");
        registry.register("order.placed", "audit", HandlerMode::Sync, |audit: &Audit, env| {
            audit.seen.lock().unwrap().push(env.event_name().to_string());
            Ok(())
        });
        registry.register("order.rejected", "guard", HandlerMode::Sync, |_: &Audit, _| {
            Err(anyhow::anyhow!("not allowed"))
        });
        let writer = OutboxWriter::with_sync_handlers(Arc::new(registry));
        let store: InMemoryStore<OutboxRecord> = InMemoryStore::new();
        let audit = Audit::default();

        let mut tx = store.begin().unwrap();
        writer
            .record(&audit, tx.as_mut(), "order.placed", serde_json::json!({}))
            .unwrap();
        let err = writer
            .record(&audit, tx.as_mut(), "order.rejected", serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, OutboxError::SyncHandler(_)));
        assert_eq!(*audit.seen.lock().unwrap(), vec!["order.placed".to_string()]);
    }
}
