//! Consumer side: broker deliveries → inbox rows → handlers.
//!
//! ## Pipeline
//!
//! ```text
//! broker ──▶ QueueBridge ──▶ inbox (PENDING) ──▶ InboxProcessor ──▶ async handlers
//!            dedup on                             one shard, creation order,
//!            (consumer, transaction_id)           halt at first failure
//! ```
//!
//! The bridge only persists; it never waits on handlers. Processing happens
//! later, per shard, from the store.

pub mod bridge;
pub mod inspector;
pub mod processor;

pub use bridge::{BridgeError, IngestOutcome, QueueBridge, RejectReason};
pub use inspector::{InboxInspector, InboxStats};
pub use processor::{BatchReport, InboxProcessor, ProcessorError};
