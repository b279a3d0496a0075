use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::TransactionId;
use courier_observability::TraceContext;

/// An event as handed to a consumer's handlers.
///
/// Built from an inbox record right before dispatch. The payload stays an
/// opaque JSON value until a handler decodes it into its own typed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_name: String,
    transaction_id: TransactionId,
    payload: JsonValue,
    created_at: DateTime<Utc>,
    trace_context: TraceContext,

    /// 1-based attempt number of the current processing pass.
    attempt: u32,
}

impl EventEnvelope {
    pub fn new(
        event_name: impl Into<String>,
        transaction_id: TransactionId,
        payload: JsonValue,
        created_at: DateTime<Utc>,
        trace_context: TraceContext,
        attempt: u32,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            transaction_id,
            payload,
            created_at,
            trace_context,
            attempt,
        }
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn trace_context(&self) -> &TraceContext {
        &self.trace_context
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reconstruct the typed event from the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}
