//! Transactional record storage.
//!
//! One generic interface, implemented once per backend and used for all three
//! tables (outbox, inbox, workflow). The store is the only authoritative state
//! in courier: the broker merely transports, and every guarantee (dedup,
//! ordering, exactly-one saga runner) comes from a unique key or a row lock.
//!
//! ## Locking
//!
//! Transactions lock rows explicitly:
//!
//! | `LockMode`   | Postgres                   | A row held by another transaction |
//! |--------------|----------------------------|-----------------------------------|
//! | `Wait`       | `FOR UPDATE`               | blocks until released             |
//! | `NoWait`     | `FOR UPDATE NOWAIT`        | fails with `StoreError::Locked`   |
//! | `SkipLocked` | `FOR UPDATE SKIP LOCKED`   | is silently left out              |
//!
//! Locks are held until commit or rollback. Dropping a transaction without
//! committing rolls it back.

pub mod in_memory;
pub mod postgres;
pub mod record;

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use record::{
    InboxRecord, InboxSelector, InboxStatus, OutboxRecord, OutboxSelector, WorkflowSelector,
};

/// A row type the store can persist.
pub trait Record: Clone + core::fmt::Debug + Send + Sync + 'static {
    type Id: Copy + Eq + Ord + core::hash::Hash + core::fmt::Debug + core::fmt::Display + Send + Sync;

    /// Business key enforced unique across the table.
    type Key: Clone + Eq + core::hash::Hash + core::fmt::Debug + Send + Sync;

    /// Filter for `select`.
    type Selector: core::fmt::Debug + Send + Sync;

    fn id(&self) -> Self::Id;

    fn unique_key(&self) -> Self::Key;

    /// Rows are always returned in `(created_at, id)` order.
    fn created_at(&self) -> DateTime<Utc>;

    fn matches(&self, selector: &Self::Selector) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Wait,
    NoWait,
    SkipLocked,
}

/// Store operation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("row is locked by another transaction: {0}")]
    Locked(String),

    #[error("unique key already exists: {0}")]
    Conflict(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("store state lock poisoned")]
    Poisoned,
}

/// An open store transaction over one table.
pub trait Transaction<R: Record> {
    /// Rows matching `selector`, in creation order, locked with `lock`.
    ///
    /// With `SkipLocked` the result only contains rows this transaction now holds.
    fn select(
        &mut self,
        selector: &R::Selector,
        limit: usize,
        lock: LockMode,
    ) -> Result<Vec<R>, StoreError>;

    /// Lock one row by id. `Ok(None)` when the row does not exist (or was skipped).
    fn lock(&mut self, id: R::Id, lock: LockMode) -> Result<Option<R>, StoreError>;

    /// Lock several rows, in creation order. Missing ids are left out.
    fn lock_many(&mut self, ids: &[R::Id], lock: LockMode) -> Result<Vec<R>, StoreError>;

    fn insert(&mut self, record: &R) -> Result<(), StoreError>;

    /// Overwrite an existing row.
    fn save(&mut self, record: &R) -> Result<(), StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Store abstraction over one record type.
pub trait Store<R: Record>: Send + Sync {
    fn begin(&self) -> Result<Box<dyn Transaction<R> + '_>, StoreError>;

    /// Insert `record` unless a row with the same unique key exists.
    ///
    /// Autocommits. Returns the stored row and whether it was created by this
    /// call; under concurrent callers exactly one sees `true`.
    fn get_or_create(&self, record: R) -> Result<(R, bool), StoreError>;

    fn get(&self, id: R::Id) -> Result<Option<R>, StoreError>;

    /// Non-locking read of committed rows, in creation order.
    fn select(&self, selector: &R::Selector, limit: usize) -> Result<Vec<R>, StoreError>;
}

impl<R, S> Store<R> for Arc<S>
where
    R: Record,
    S: Store<R> + ?Sized,
{
    fn begin(&self) -> Result<Box<dyn Transaction<R> + '_>, StoreError> {
        (**self).begin()
    }

    fn get_or_create(&self, record: R) -> Result<(R, bool), StoreError> {
        (**self).get_or_create(record)
    }

    fn get(&self, id: R::Id) -> Result<Option<R>, StoreError> {
        (**self).get(id)
    }

    fn select(&self, selector: &R::Selector, limit: usize) -> Result<Vec<R>, StoreError> {
        (**self).select(selector, limit)
    }
}
