//! Postgres-backed store implementation.
//!
//! One `PostgresStore` serves all three tables; each record type describes its
//! table through `PgTable`. Schema: `migrations/0001_courier.sql`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (lock not available) | `55P03` | `Locked` | `NOWAIT` hit a row held by another transaction |
//! | Database (unique violation) | `23505` | `Conflict` | Duplicate id or business key |
//! | Database (other) | Any other | `Storage` | Constraint or SQL errors |
//! | PoolClosed | N/A | `Storage` | Connection pool was closed |
//! | Other | N/A | `Storage` | Network errors, decode errors, etc. |
//!
//! ## Threading
//!
//! Courier's workers are plain threads. Every call drives sqlx through
//! `Handle::block_on` on the runtime handle given at construction, so the store
//! must not be called from inside an async task of that runtime.

use std::marker::PhantomData;

use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use courier_core::{InboxId, OutboxId, TransactionId, WorkflowId};
use courier_events::{HistoryEntry, StepState, WorkflowRecord};
use courier_observability::TraceContext;

use super::record::{InboxRecord, InboxSelector, InboxStatus, OutboxRecord, OutboxSelector, WorkflowSelector};
use super::{LockMode, Record, Store, StoreError, Transaction};

const SCHEMA: &str = include_str!("../../migrations/0001_courier.sql");

/// Postgres-backed store for outbox, inbox and workflow rows.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Open a connection pool on `handle`'s runtime.
    pub fn connect(database_url: &str, max_connections: u32, handle: Handle) -> Result<Self, StoreError> {
        let pool = handle
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, handle))
    }

    /// Create the courier tables if they do not exist.
    pub fn migrate(&self) -> Result<(), StoreError> {
        self.handle
            .block_on(sqlx::raw_sql(SCHEMA).execute(&self.pool))
            .map_err(|e| map_sqlx_error("migrate", e))?;
        debug!("courier schema applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// A record type with a Postgres table mapping.
pub trait PgTable: Record {
    const TABLE: &'static str;

    /// Column list, in `push_values` order.
    const COLUMNS: &'static str;

    /// Conflict target of the business key.
    const UNIQUE_KEY: &'static str;

    const ORDER_BY: &'static str;

    fn id_uuid(id: Self::Id) -> Uuid;

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error>;

    fn push_values(&self, qb: &mut QueryBuilder<'static, Postgres>);

    fn push_key_filter(&self, qb: &mut QueryBuilder<'static, Postgres>);

    fn push_selector(selector: &Self::Selector, qb: &mut QueryBuilder<'static, Postgres>);
}

fn select_query<R: PgTable>() -> QueryBuilder<'static, Postgres> {
    QueryBuilder::new(format!("SELECT {} FROM {} WHERE ", R::COLUMNS, R::TABLE))
}

fn insert_query<R: PgTable>(record: &R) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!("INSERT INTO {} ({}) VALUES (", R::TABLE, R::COLUMNS));
    record.push_values(&mut qb);
    qb.push(")");
    qb
}

fn push_order_and_limit<R: PgTable>(qb: &mut QueryBuilder<'static, Postgres>, limit: usize) {
    qb.push(format!(" ORDER BY {} LIMIT ", R::ORDER_BY));
    qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
}

fn lock_clause(lock: LockMode) -> &'static str {
    match lock {
        LockMode::Wait => " FOR UPDATE",
        LockMode::NoWait => " FOR UPDATE NOWAIT",
        LockMode::SkipLocked => " FOR UPDATE SKIP LOCKED",
    }
}

fn decode_rows<R: PgTable>(rows: &[PgRow]) -> Result<Vec<R>, StoreError> {
    rows.iter()
        .map(R::from_row)
        .collect::<Result<_, _>>()
        .map_err(|e| map_sqlx_error("decode", e))
}

fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

impl<R: PgTable> Store<R> for PostgresStore {
    fn begin(&self) -> Result<Box<dyn Transaction<R> + '_>, StoreError> {
        let tx = self
            .handle
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresTransaction::<R> {
            store: self,
            tx: Some(tx),
            _record: PhantomData,
        }))
    }

    #[instrument(skip(self, record), fields(table = R::TABLE, id = %record.id()), err)]
    fn get_or_create(&self, record: R) -> Result<(R, bool), StoreError> {
        let mut qb = insert_query(&record);
        qb.push(format!(
            " ON CONFLICT {} DO NOTHING RETURNING {}",
            R::UNIQUE_KEY,
            R::COLUMNS
        ));
        let inserted = self
            .handle
            .block_on(qb.build().fetch_optional(&self.pool))
            .map_err(|e| map_sqlx_error("get_or_create", e))?;
        if let Some(row) = inserted {
            let created = R::from_row(&row).map_err(|e| map_sqlx_error("decode", e))?;
            return Ok((created, true));
        }

        let mut qb = select_query::<R>();
        record.push_key_filter(&mut qb);
        let existing = self
            .handle
            .block_on(qb.build().fetch_optional(&self.pool))
            .map_err(|e| map_sqlx_error("get_or_create", e))?
            .ok_or_else(|| StoreError::NotFound(format!("{:?}", record.unique_key())))?;
        let existing = R::from_row(&existing).map_err(|e| map_sqlx_error("decode", e))?;
        Ok((existing, false))
    }

    fn get(&self, id: R::Id) -> Result<Option<R>, StoreError> {
        let mut qb = select_query::<R>();
        qb.push("id = ");
        qb.push_bind(R::id_uuid(id));
        let row = self
            .handle
            .block_on(qb.build().fetch_optional(&self.pool))
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref()
            .map(R::from_row)
            .transpose()
            .map_err(|e| map_sqlx_error("decode", e))
    }

    fn select(&self, selector: &R::Selector, limit: usize) -> Result<Vec<R>, StoreError> {
        let mut qb = select_query::<R>();
        R::push_selector(selector, &mut qb);
        push_order_and_limit::<R>(&mut qb, limit);
        let rows = self
            .handle
            .block_on(qb.build().fetch_all(&self.pool))
            .map_err(|e| map_sqlx_error("select", e))?;
        decode_rows(&rows)
    }
}

/// An open Postgres transaction. Dropping it rolls back.
pub struct PostgresTransaction<'a, R> {
    store: &'a PostgresStore,
    tx: Option<sqlx::Transaction<'static, Postgres>>,
    _record: PhantomData<fn() -> R>,
}

impl<R> PostgresTransaction<'_, R> {
    fn conn(&mut self) -> Result<&mut sqlx::Transaction<'static, Postgres>, StoreError> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::Storage("transaction already finished".to_string()))
    }

    fn fetch_all(&mut self, operation: &str, mut qb: QueryBuilder<'static, Postgres>) -> Result<Vec<PgRow>, StoreError> {
        let store = self.store;
        let tx = self.conn()?;
        store
            .handle
            .block_on(qb.build().fetch_all(&mut **tx))
            .map_err(|e| map_sqlx_error(operation, e))
    }

    fn execute(&mut self, operation: &str, mut qb: QueryBuilder<'static, Postgres>) -> Result<u64, StoreError> {
        let store = self.store;
        let tx = self.conn()?;
        store
            .handle
            .block_on(qb.build().execute(&mut **tx))
            .map(|done| done.rows_affected())
            .map_err(|e| map_sqlx_error(operation, e))
    }
}

/// Early returns and unwinding drop an open transaction on a worker thread
/// outside the runtime; sqlx needs the runtime to release the connection.
impl<R> Drop for PostgresTransaction<'_, R> {
    fn drop(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        if Handle::try_current().is_ok() {
            let _guard = self.store.handle.enter();
            drop(tx);
            return;
        }
        if let Err(err) = self.store.handle.block_on(tx.rollback()) {
            warn!(error = %err, "rollback of dropped transaction failed");
        }
    }
}

impl<R: PgTable> Transaction<R> for PostgresTransaction<'_, R> {
    fn select(
        &mut self,
        selector: &R::Selector,
        limit: usize,
        lock: LockMode,
    ) -> Result<Vec<R>, StoreError> {
        let mut qb = select_query::<R>();
        R::push_selector(selector, &mut qb);
        push_order_and_limit::<R>(&mut qb, limit);
        qb.push(lock_clause(lock));
        let rows = self.fetch_all("select_for_update", qb)?;
        decode_rows(&rows)
    }

    fn lock(&mut self, id: R::Id, lock: LockMode) -> Result<Option<R>, StoreError> {
        let mut qb = select_query::<R>();
        qb.push("id = ");
        qb.push_bind(R::id_uuid(id));
        qb.push(lock_clause(lock));
        let rows = self.fetch_all("lock", qb)?;
        Ok(decode_rows(&rows)?.into_iter().next())
    }

    fn lock_many(&mut self, ids: &[R::Id], lock: LockMode) -> Result<Vec<R>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = select_query::<R>();
        qb.push("id = ANY(");
        qb.push_bind(ids.iter().map(|id| R::id_uuid(*id)).collect::<Vec<Uuid>>());
        qb.push(format!(") ORDER BY {}", R::ORDER_BY));
        qb.push(lock_clause(lock));
        let rows = self.fetch_all("lock_many", qb)?;
        decode_rows(&rows)
    }

    fn insert(&mut self, record: &R) -> Result<(), StoreError> {
        self.execute("insert", insert_query(record))?;
        Ok(())
    }

    fn save(&mut self, record: &R) -> Result<(), StoreError> {
        let mut qb = QueryBuilder::new(format!("UPDATE {} SET ({}) = ROW(", R::TABLE, R::COLUMNS));
        record.push_values(&mut qb);
        qb.push(") WHERE id = ");
        qb.push_bind(R::id_uuid(record.id()));
        match self.execute("save", qb)? {
            0 => Err(StoreError::NotFound(record.id().to_string())),
            _ => Ok(()),
        }
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let store = self.store;
        match self.tx.take() {
            Some(tx) => store
                .handle
                .block_on(tx.commit())
                .map_err(|e| map_sqlx_error("commit", e)),
            None => Ok(()),
        }
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        let store = self.store;
        match self.tx.take() {
            Some(tx) => store
                .handle
                .block_on(tx.rollback())
                .map_err(|e| map_sqlx_error("rollback", e)),
            None => Ok(()),
        }
    }
}

impl PgTable for OutboxRecord {
    const TABLE: &'static str = "courier_outbox";
    const COLUMNS: &'static str =
        "id, event_name, transaction_id, payload, creation_date, sent, sent_date, trace_context";
    const UNIQUE_KEY: &'static str = "(transaction_id)";
    const ORDER_BY: &'static str = "creation_date, id";

    fn id_uuid(id: OutboxId) -> Uuid {
        id.into()
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: OutboxId::from_uuid(row.try_get("id")?),
            event_name: row.try_get("event_name")?,
            transaction_id: TransactionId::from_uuid(row.try_get("transaction_id")?),
            payload: row.try_get("payload")?,
            creation_date: row.try_get("creation_date")?,
            sent: row.try_get("sent")?,
            sent_date: row.try_get("sent_date")?,
            trace_context: row.try_get::<Json<TraceContext>, _>("trace_context")?.0,
        })
    }

    fn push_values(&self, qb: &mut QueryBuilder<'static, Postgres>) {
        let mut values = qb.separated(", ");
        values.push_bind(*self.id.as_uuid());
        values.push_bind(self.event_name.clone());
        values.push_bind(*self.transaction_id.as_uuid());
        values.push_bind(self.payload.clone());
        values.push_bind(self.creation_date);
        values.push_bind(self.sent);
        values.push_bind(self.sent_date);
        values.push_bind(Json(self.trace_context.clone()));
    }

    fn push_key_filter(&self, qb: &mut QueryBuilder<'static, Postgres>) {
        qb.push("transaction_id = ");
        qb.push_bind(*self.transaction_id.as_uuid());
    }

    fn push_selector(selector: &OutboxSelector, qb: &mut QueryBuilder<'static, Postgres>) {
        match selector {
            OutboxSelector::Unsent => qb.push("NOT sent"),
        };
    }
}

impl PgTable for InboxRecord {
    const TABLE: &'static str = "courier_inbox";
    const COLUMNS: &'static str = "id, consumer, event_name, transaction_id, payload, creation_date, \
         status, last_execution_date, attempts_number, trace_context, metadata";
    const UNIQUE_KEY: &'static str = "(consumer, transaction_id)";
    const ORDER_BY: &'static str = "creation_date, id";

    fn id_uuid(id: InboxId) -> Uuid {
        id.into()
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let attempts: i32 = row.try_get("attempts_number")?;
        Ok(Self {
            id: InboxId::from_uuid(row.try_get("id")?),
            consumer: row.try_get("consumer")?,
            event_name: row.try_get("event_name")?,
            transaction_id: TransactionId::from_uuid(row.try_get("transaction_id")?),
            payload: row.try_get("payload")?,
            creation_date: row.try_get("creation_date")?,
            status: status.parse::<InboxStatus>().map_err(decode_error)?,
            last_execution_date: row.try_get("last_execution_date")?,
            attempts_number: u32::try_from(attempts)
                .map_err(|e| decode_error(format!("attempts_number: {e}")))?,
            trace_context: row.try_get::<Json<TraceContext>, _>("trace_context")?.0,
            metadata: row.try_get("metadata")?,
        })
    }

    fn push_values(&self, qb: &mut QueryBuilder<'static, Postgres>) {
        let mut values = qb.separated(", ");
        values.push_bind(*self.id.as_uuid());
        values.push_bind(self.consumer.clone());
        values.push_bind(self.event_name.clone());
        values.push_bind(*self.transaction_id.as_uuid());
        values.push_bind(self.payload.clone());
        values.push_bind(self.creation_date);
        values.push_bind(self.status.as_str());
        values.push_bind(self.last_execution_date);
        values.push_bind(i32::try_from(self.attempts_number).unwrap_or(i32::MAX));
        values.push_bind(Json(self.trace_context.clone()));
        values.push_bind(self.metadata.clone());
    }

    fn push_key_filter(&self, qb: &mut QueryBuilder<'static, Postgres>) {
        qb.push("consumer = ");
        qb.push_bind(self.consumer.clone());
        qb.push(" AND transaction_id = ");
        qb.push_bind(*self.transaction_id.as_uuid());
    }

    fn push_selector(selector: &InboxSelector, qb: &mut QueryBuilder<'static, Postgres>) {
        match selector {
            InboxSelector::Eligible { consumer } => {
                qb.push("consumer = ");
                qb.push_bind(consumer.clone());
                qb.push(" AND status IN ('PENDING', 'ERROR')");
            }
            InboxSelector::WithStatus { consumer, status } => {
                qb.push("consumer = ");
                qb.push_bind(consumer.clone());
                qb.push(" AND status = ");
                qb.push_bind(status.as_str());
            }
        }
    }
}

impl PgTable for WorkflowRecord {
    const TABLE: &'static str = "courier_workflow";
    const COLUMNS: &'static str =
        "id, current_step, step_state, step_execution_count, last_execution, histories, context_data";
    const UNIQUE_KEY: &'static str = "(id)";
    const ORDER_BY: &'static str = "id";

    fn id_uuid(id: WorkflowId) -> Uuid {
        id.into()
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let step_state: String = row.try_get("step_state")?;
        let count: i32 = row.try_get("step_execution_count")?;
        Ok(Self {
            id: WorkflowId::from_uuid(row.try_get("id")?),
            current_step: row.try_get("current_step")?,
            step_state: step_state.parse::<StepState>().map_err(decode_error)?,
            step_execution_count: u32::try_from(count)
                .map_err(|e| decode_error(format!("step_execution_count: {e}")))?,
            last_execution: row.try_get("last_execution")?,
            histories: row.try_get::<Json<Vec<HistoryEntry>>, _>("histories")?.0,
            context_data: row.try_get("context_data")?,
        })
    }

    fn push_values(&self, qb: &mut QueryBuilder<'static, Postgres>) {
        let mut values = qb.separated(", ");
        values.push_bind(*self.id.as_uuid());
        values.push_bind(self.current_step.clone());
        values.push_bind(self.step_state.as_str());
        values.push_bind(i32::try_from(self.step_execution_count).unwrap_or(i32::MAX));
        values.push_bind(self.last_execution);
        values.push_bind(Json(self.histories.clone()));
        values.push_bind(self.context_data.clone());
    }

    fn push_key_filter(&self, qb: &mut QueryBuilder<'static, Postgres>) {
        qb.push("id = ");
        qb.push_bind(*self.id.as_uuid());
    }

    fn push_selector(selector: &WorkflowSelector, qb: &mut QueryBuilder<'static, Postgres>) {
        match selector {
            WorkflowSelector::InState(state) => {
                qb.push("step_state = ");
                qb.push_bind(state.as_str());
            }
            WorkflowSelector::Suspended => {
                qb.push("step_state = 'PENDING' AND last_execution IS NOT NULL");
            }
        }
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // lock_not_available
                Some("55P03") => StoreError::Locked(msg),
                // unique_violation
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
