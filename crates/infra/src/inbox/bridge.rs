use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use courier_core::{InboxId, TransactionId};
use courier_events::{Broker, BrokerError, Delivery, EVENT_NAME_HEADER, HandlerRegistry, topic_for};
use courier_observability::TraceContext;

use crate::store::{InboxRecord, Store, StoreError};
use crate::workers::CancellationToken;

/// How long `run` blocks on the subscription before re-checking the token.
const POLL_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("subscription to queue '{0}' closed")]
    SubscriptionClosed(String),
}

/// Why a delivery was refused without requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MissingMessageId,
    InvalidMessageId,
    InvalidPayload,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingMessageId => "missing message id",
            Self::InvalidMessageId => "message id is not a transaction id",
            Self::InvalidPayload => "body is not valid JSON",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new PENDING row was written.
    Stored(InboxId),

    /// The row already existed; the delivery was acknowledged and dropped.
    Duplicate(InboxId),

    /// Poison message, rejected without requeue.
    Rejected(RejectReason),
}

/// Moves deliveries from one bounded context's queue into its inbox.
///
/// A delivery is acknowledged only once its row is durable. Redelivering the
/// same transaction id any number of times leaves exactly one row.
pub struct QueueBridge<S, B> {
    store: S,
    broker: B,
    consumer: String,
    root_exchange: String,
    topics: Vec<String>,
}

impl<S, B> QueueBridge<S, B>
where
    S: Store<InboxRecord>,
    B: Broker,
{
    /// Bind the bridge to every event type `registry` handles asynchronously.
    ///
    /// The queue is named after the registry's bounded context.
    pub fn new<C>(
        store: S,
        broker: B,
        registry: &HandlerRegistry<C>,
        root_exchange: impl Into<String>,
    ) -> Self {
        let root_exchange = root_exchange.into();
        let topics = registry
            .event_types()
            .into_iter()
            .map(|event_type| topic_for(&root_exchange, event_type))
            .collect();
        Self {
            store,
            broker,
            consumer: registry.context_name().to_string(),
            root_exchange,
            topics,
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Persist one delivery and settle it.
    ///
    /// A store failure rejects the delivery with requeue and is returned, so the
    /// broker redelivers it later.
    pub fn ingest(&self, delivery: Delivery) -> Result<IngestOutcome, BridgeError> {
        let transaction_id = match delivery.message_id() {
            None => return self.poison(delivery, RejectReason::MissingMessageId),
            Some(raw) => match raw.parse::<TransactionId>() {
                Ok(id) => id,
                Err(_) => return self.poison(delivery, RejectReason::InvalidMessageId),
            },
        };
        let payload: JsonValue = match serde_json::from_slice(delivery.body()) {
            Ok(payload) => payload,
            Err(_) => return self.poison(delivery, RejectReason::InvalidPayload),
        };

        let event_name = self.event_name(&delivery);
        let trace_context = TraceContext::from_headers(delivery.headers());
        let record = InboxRecord::new(
            self.consumer.clone(),
            event_name,
            transaction_id,
            payload,
            trace_context,
        );

        match self.store.get_or_create(record) {
            Ok((stored, true)) => {
                delivery.ack()?;
                debug!(
                    consumer = %self.consumer,
                    event_name = %stored.event_name,
                    transaction_id = %transaction_id,
                    "inbox record stored"
                );
                Ok(IngestOutcome::Stored(stored.id))
            }
            Ok((existing, false)) => {
                delivery.ack()?;
                debug!(
                    consumer = %self.consumer,
                    transaction_id = %transaction_id,
                    "duplicate delivery dropped"
                );
                Ok(IngestOutcome::Duplicate(existing.id))
            }
            Err(err) => {
                warn!(
                    consumer = %self.consumer,
                    transaction_id = %transaction_id,
                    error = %err,
                    "inbox write failed; requeueing delivery"
                );
                delivery.reject(true)?;
                Err(err.into())
            }
        }
    }

    /// Subscribe and ingest until `token` is cancelled.
    ///
    /// Returns an error when the subscription cannot be opened or closes
    /// underneath the bridge. Per-delivery failures are logged and skipped.
    pub fn run(&self, token: &CancellationToken) -> Result<(), BridgeError> {
        let subscription = self.broker.subscribe(&self.consumer, &self.topics)?;
        info!(consumer = %self.consumer, topics = ?self.topics, "queue bridge started");

        while !token.is_cancelled() {
            match subscription.recv_timeout(POLL_TIMEOUT) {
                Ok(delivery) => {
                    if let Err(err) = self.ingest(delivery) {
                        warn!(consumer = %self.consumer, error = %err, "delivery not ingested");
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BridgeError::SubscriptionClosed(self.consumer.clone()));
                }
            }
        }

        info!(consumer = %self.consumer, "queue bridge stopped");
        Ok(())
    }

    fn event_name(&self, delivery: &Delivery) -> String {
        if let Some(name) = delivery.headers().get(EVENT_NAME_HEADER) {
            return name.clone();
        }
        delivery
            .topic()
            .strip_prefix(self.root_exchange.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(delivery.topic())
            .to_string()
    }

    fn poison(&self, delivery: Delivery, reason: RejectReason) -> Result<IngestOutcome, BridgeError> {
        warn!(
            consumer = %self.consumer,
            topic = %delivery.topic(),
            reason = reason.as_str(),
            "poison message rejected"
        );
        delivery.reject(false)?;
        Ok(IngestOutcome::Rejected(reason))
    }
}
