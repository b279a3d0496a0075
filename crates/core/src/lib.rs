//! `courier-core`: identifiers and error vocabulary shared by every courier crate.
//!
//! This crate has no infrastructure concerns.

pub mod error;
pub mod id;

pub use error::CoreError;
pub use id::{InboxId, OutboxId, TransactionId, WorkflowId};
