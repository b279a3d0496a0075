//! Read-only operator queries over the inbox.

use serde::Serialize;

use crate::store::{InboxRecord, InboxSelector, InboxStatus, Store, StoreError};

/// Row counts per status for one consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InboxStats {
    pub pending: usize,
    pub processed: usize,
    pub error: usize,
    pub dead_letter: usize,
}

impl InboxStats {
    pub fn total(&self) -> usize {
        self.pending + self.processed + self.error + self.dead_letter
    }
}

pub struct InboxInspector<S> {
    store: S,
}

impl<S> InboxInspector<S>
where
    S: Store<InboxRecord>,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Dead-lettered rows of `consumer`, oldest first.
    pub fn dead_letters(&self, consumer: &str, limit: usize) -> Result<Vec<InboxRecord>, StoreError> {
        self.with_status(consumer, InboxStatus::DeadLetter, limit)
    }

    pub fn with_status(
        &self,
        consumer: &str,
        status: InboxStatus,
        limit: usize,
    ) -> Result<Vec<InboxRecord>, StoreError> {
        self.store.select(
            &InboxSelector::WithStatus {
                consumer: consumer.to_string(),
                status,
            },
            limit,
        )
    }

    pub fn stats(&self, consumer: &str) -> Result<InboxStats, StoreError> {
        let mut stats = InboxStats::default();
        for status in InboxStatus::ALL {
            let count = self.with_status(consumer, status, usize::MAX)?.len();
            match status {
                InboxStatus::Pending => stats.pending = count,
                InboxStatus::Processed => stats.processed = count,
                InboxStatus::Error => stats.error = count,
                InboxStatus::DeadLetter => stats.dead_letter = count,
            }
        }
        Ok(stats)
    }
}
