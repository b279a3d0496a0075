//! Courier infrastructure: transactional outbox, deduplicating inbox, sharded
//! inbox processing and saga orchestration over a pluggable store and broker.
//!
//! ## Flow
//!
//! ```text
//! producer tx ──▶ outbox ──▶ OutboxPublisher ──▶ broker ──▶ QueueBridge ──▶ inbox
//!                                                                          │
//!                                           handlers ◀── InboxProcessor ◀──┘
//! ```

pub mod broker;
pub mod config;
pub mod inbox;
pub mod outbox;
pub mod routing;
pub mod runtime;
pub mod saga;
pub mod store;
pub mod workers;

pub use config::{ConfigError, CourierConfig};
pub use inbox::{
    BatchReport, BridgeError, IngestOutcome, InboxInspector, InboxProcessor, InboxStats,
    ProcessorError, QueueBridge, RejectReason,
};
pub use outbox::{OutboxError, OutboxPublisher, OutboxWriter, PublishFailure, PublishReport};
pub use routing::{DEFAULT_STRATEGY, RoutingError, RoutingRegistry, RoutingStrategy, Shard, hash_key};
pub use saga::{SagaError, SagaOrchestrator, SagaOutcome};
pub use store::{
    InMemoryStore, InboxRecord, InboxSelector, InboxStatus, LockMode, OutboxRecord,
    OutboxSelector, PostgresStore, Record, Store, StoreError, Transaction, WorkflowSelector,
};
pub use workers::{CancellationToken, RestartPolicy, Supervisor, SupervisorError, run_every};
