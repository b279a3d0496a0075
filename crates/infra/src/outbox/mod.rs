//! Outbox: events leave a bounded context only after the write that produced
//! them has committed.
//!
//! - `OutboxWriter` records an event inside the producer's own transaction
//! - `OutboxPublisher` drains committed, unsent records to the broker

pub mod publisher;
pub mod writer;

pub use publisher::{OutboxPublisher, PublishFailure, PublishReport};
pub use writer::OutboxWriter;

use courier_events::DispatchError;

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("event payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("synchronous handler rejected the event: {0}")]
    SyncHandler(#[from] DispatchError),
}
