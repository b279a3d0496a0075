//! Outbox publisher: committed outbox rows → broker.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use courier_core::TransactionId;
use courier_events::{Broker, EVENT_NAME_HEADER, Headers, TRANSACTION_ID_HEADER, topic_for};

use super::OutboxError;
use crate::store::{LockMode, OutboxRecord, OutboxSelector, Store};

/// Outcome of one `publish_pending` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub published: usize,

    /// The publish that stopped the pass, if any.
    pub failed: Option<PublishFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishFailure {
    pub transaction_id: TransactionId,
    pub event_name: String,
    pub error: String,
}

/// Drains unsent outbox rows to the broker, oldest first.
///
/// Each row is claimed in its own transaction with `SKIP LOCKED`, published,
/// then marked sent and committed. A row is therefore never marked sent
/// without a confirmed publish, but may be published twice if the commit fails
/// (consumers deduplicate on the transaction id).
pub struct OutboxPublisher<S, B> {
    store: S,
    broker: B,
    root_exchange: String,
    batch_size: usize,
}

impl<S, B> OutboxPublisher<S, B>
where
    S: Store<OutboxRecord>,
    B: Broker,
{
    pub fn new(store: S, broker: B, root_exchange: impl Into<String>, batch_size: usize) -> Self {
        Self {
            store,
            broker,
            root_exchange: root_exchange.into(),
            batch_size,
        }
    }

    /// Publish up to `batch_size` records.
    ///
    /// Stops at the first failed publish so later records never overtake an
    /// earlier one within a pass; the failed record stays unsent for the next
    /// invocation. Store failures are returned as errors.
    pub fn publish_pending(&self) -> Result<PublishReport, OutboxError> {
        let mut report = PublishReport::default();

        while report.published < self.batch_size {
            let mut tx = self.store.begin()?;
            let claimed = tx.select(&OutboxSelector::Unsent, 1, LockMode::SkipLocked)?;
            let Some(mut record) = claimed.into_iter().next() else {
                tx.rollback()?;
                break;
            };

            let topic = topic_for(&self.root_exchange, &record.event_name);
            let body = serde_json::to_vec(&record.payload)?;
            let headers = publish_headers(&record);
            let span = record.trace_context.span("outbox.publish");
            let _entered = span.enter();

            match self
                .broker
                .publish(&topic, &body, &headers, &record.transaction_id.to_string())
            {
                Ok(()) => {
                    record.mark_sent(Utc::now());
                    tx.save(&record)?;
                    tx.commit()?;
                    report.published += 1;
                    debug!(
                        topic = %topic,
                        transaction_id = %record.transaction_id,
                        "outbox record published"
                    );
                }
                Err(err) => {
                    tx.rollback()?;
                    warn!(
                        topic = %topic,
                        transaction_id = %record.transaction_id,
                        error = %err,
                        "outbox publish failed; record left for the next run"
                    );
                    report.failed = Some(PublishFailure {
                        transaction_id: record.transaction_id,
                        event_name: record.event_name.clone(),
                        error: err.to_string(),
                    });
                    break;
                }
            }
        }

        if report.published > 0 || report.failed.is_some() {
            info!(
                published = report.published,
                failed = report.failed.is_some(),
                "outbox pass finished"
            );
        }
        Ok(report)
    }
}

fn publish_headers(record: &OutboxRecord) -> Headers {
    let mut headers = Headers::new();
    record.trace_context.inject(&mut headers);
    headers.insert(EVENT_NAME_HEADER.to_string(), record.event_name.clone());
    headers.insert(TRANSACTION_ID_HEADER.to_string(), record.transaction_id.to_string());
    headers
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use courier_events::InMemoryBroker;
    use courier_observability::TRACEPARENT;

    use super::*;
    use crate::store::InMemoryStore;

    fn seed(store: &InMemoryStore<OutboxRecord>, names: &[&str]) -> Vec<OutboxRecord> {
        names
            .iter()
            .map(|name| {
                let record = OutboxRecord::new(*name, serde_json::json!({ "name": name }));
                store.get_or_create(record.clone()).unwrap();
                // Keep creation dates strictly increasing.
                std::thread::sleep(std::time::Duration::from_millis(2));
                record
            })
            .collect()
    }

    fn publisher(
        store: &Arc<InMemoryStore<OutboxRecord>>,
        broker: &InMemoryBroker,
        batch_size: usize,
    ) -> OutboxPublisher<Arc<InMemoryStore<OutboxRecord>>, InMemoryBroker> {
        OutboxPublisher::new(Arc::clone(store), broker.clone(), "courier", batch_size)
    }

    #[test]
    fn publishes_in_creation_order_and_marks_sent() {
        let store = Arc::new(InMemoryStore::new());
        let broker = InMemoryBroker::new();
        let seeded = seed(&store, &["order.placed", "order.paid"]);

        let report = publisher(&store, &broker, 10).publish_pending().unwrap();
        assert_eq!(report.published, 2);
        assert!(report.failed.is_none());

        let published = broker.published();
        assert_eq!(published[0].topic, "courier.order.placed");
        assert_eq!(published[1].topic, "courier.order.paid");
        assert_eq!(
            published[0].message_id.as_deref(),
            Some(seeded[0].transaction_id.to_string().as_str())
        );
        assert_eq!(published[0].headers[EVENT_NAME_HEADER], "order.placed");
        assert!(published[0].headers.contains_key(TRACEPARENT));

        assert!(store.rows().iter().all(|r| r.sent && r.sent_date.is_some()));
    }

    #[test]
    fn a_failed_publish_halts_the_pass_and_leaves_the_record_unsent() {
        let store = Arc::new(InMemoryStore::new());
        let broker = InMemoryBroker::new();
        let seeded = seed(&store, &["a", "b", "c"]);

        broker.fail_next_publishes(1);
        let report = publisher(&store, &broker, 10).publish_pending().unwrap();
        assert_eq!(report.published, 0);
        assert_eq!(report.failed.unwrap().transaction_id, seeded[0].transaction_id);
        assert!(broker.published().is_empty());
        assert!(store.rows().iter().all(|r| !r.sent));

        let report = publisher(&store, &broker, 10).publish_pending().unwrap();
        assert_eq!(report.published, 3);
    }

    #[test]
    fn batch_size_caps_a_pass() {
        let store = Arc::new(InMemoryStore::new());
        let broker = InMemoryBroker::new();
        seed(&store, &["a", "b", "c"]);

        assert_eq!(publisher(&store, &broker, 2).publish_pending().unwrap().published, 2);
        assert_eq!(publisher(&store, &broker, 2).publish_pending().unwrap().published, 1);
        assert_eq!(publisher(&store, &broker, 2).publish_pending().unwrap(), PublishReport::default());
    }
}
