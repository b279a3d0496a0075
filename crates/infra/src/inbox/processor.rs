use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use courier_core::InboxId;
use courier_events::{DispatchError, HandlerRegistry};

use crate::routing::{RoutingError, RoutingRegistry, Shard};
use crate::store::{InboxRecord, InboxSelector, InboxStatus, LockMode, Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("max attempts must be at least 1")]
    InvalidMaxAttempts,
}

/// Outcome of one `consume_batch` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub processed: usize,

    /// Handler failures (including the ones that dead-lettered).
    pub failed: usize,
    pub dead_lettered: usize,

    /// The record whose failure stopped the pass.
    pub halted_at: Option<InboxId>,
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Runs the async handlers of one shard's inbox rows.
///
/// Rows are handled in creation order. A handler failure stops the pass, so a
/// later row of the shard never overtakes an earlier row that is still
/// failing. `C` is the bounded context's infrastructure value handed to every
/// handler.
pub struct InboxProcessor<S, C> {
    store: S,
    registry: Arc<HandlerRegistry<C>>,
    routing: Arc<RoutingRegistry>,
    shard: Shard,
    max_attempts: u32,
    ctx: C,
}

impl<S, C> InboxProcessor<S, C>
where
    S: Store<InboxRecord>,
{
    /// Bind a processor to shard `consumer_id` of `strategy`.
    ///
    /// Unknown strategies and out-of-range consumer ids are rejected here,
    /// before anything runs.
    pub fn new(
        store: S,
        registry: Arc<HandlerRegistry<C>>,
        routing: Arc<RoutingRegistry>,
        strategy: &str,
        consumer_id: u32,
        max_attempts: u32,
        ctx: C,
    ) -> Result<Self, ProcessorError> {
        if max_attempts == 0 {
            return Err(ProcessorError::InvalidMaxAttempts);
        }
        let shard = routing.shard(strategy, consumer_id)?;
        Ok(Self {
            store,
            registry,
            routing,
            shard,
            max_attempts,
            ctx,
        })
    }

    pub fn consumer(&self) -> &str {
        self.registry.context_name()
    }

    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    /// Process up to `batch_size` eligible rows of this shard in one transaction.
    pub fn consume_batch(&self, batch_size: usize) -> Result<BatchReport, ProcessorError> {
        let mut report = BatchReport::default();
        let candidates = self.owned_candidates(batch_size)?;
        if candidates.is_empty() {
            return Ok(report);
        }

        let mut tx = self.store.begin()?;
        let batch = tx.lock_many(&candidates, LockMode::Wait)?;

        for mut record in batch.into_iter().filter(|r| !r.status.is_terminal()) {
            let now = Utc::now();
            record.last_execution_date = Some(now);
            let envelope = record.envelope();

            let dispatched = {
                let _trace = record.trace_context.enter();
                let span = record.trace_context.span("inbox.process");
                let _entered = span.enter();
                self.registry.dispatch_async(&self.ctx, &envelope)
            };

            match dispatched {
                Ok(handlers) => {
                    record.mark_processed();
                    tx.save(&record)?;
                    report.processed += 1;
                    debug!(
                        consumer = %record.consumer,
                        event_name = %record.event_name,
                        transaction_id = %record.transaction_id,
                        handlers,
                        "inbox record processed"
                    );
                }
                Err(DispatchError::UnknownEventType(event_type)) => {
                    let reason = format!("no handler registered for event type '{event_type}'");
                    record.mark_dead_letter(&reason, now);
                    tx.save(&record)?;
                    report.dead_lettered += 1;
                    warn!(
                        consumer = %record.consumer,
                        event_name = %event_type,
                        transaction_id = %record.transaction_id,
                        "unknown event type dead-lettered"
                    );
                }
                Err(DispatchError::HandlerFailed { handler, source }) => {
                    let error = format!("{handler}: {source:#}");
                    let status = record.mark_failed(&error, self.max_attempts, now);
                    tx.save(&record)?;
                    report.failed += 1;
                    if status == InboxStatus::DeadLetter {
                        report.dead_lettered += 1;
                    }
                    report.halted_at = Some(record.id);
                    warn!(
                        consumer = %record.consumer,
                        event_name = %record.event_name,
                        transaction_id = %record.transaction_id,
                        attempts = record.attempts_number,
                        status = %status,
                        error = %error,
                        "inbox handler failed; halting batch"
                    );
                    break;
                }
            }
        }

        tx.commit()?;
        if !report.is_empty() {
            info!(
                consumer = %self.consumer(),
                strategy = %self.shard.strategy_name(),
                consumer_id = self.shard.consumer_id(),
                processed = report.processed,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                "inbox batch finished"
            );
        }
        Ok(report)
    }

    /// Ids of the first `batch_size` non-terminal rows this shard owns.
    ///
    /// Routing functions run in process, so a sharded consumer reads its whole
    /// non-terminal backlog on every pass. With only the default strategy every
    /// row is owned and the read is capped at `batch_size`.
    fn owned_candidates(&self, batch_size: usize) -> Result<Vec<InboxId>, ProcessorError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let selector = InboxSelector::Eligible {
            consumer: self.consumer().to_string(),
        };
        let limit = if self.routing.is_default_only() {
            batch_size
        } else {
            usize::MAX
        };
        Ok(self
            .store
            .select(&selector, limit)?
            .into_iter()
            .filter(|record| self.shard.owns(&self.routing, record))
            .take(batch_size)
            .map(|record| record.id)
            .collect())
    }
}
