//! Core error model.

use thiserror::Error;

/// Failures raised while building core values.
///
/// Infrastructure failures (store, broker) have their own error types in the
/// crates that own those boundaries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
