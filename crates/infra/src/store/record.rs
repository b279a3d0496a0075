//! Persisted row types and their selectors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::{InboxId, OutboxId, TransactionId, WorkflowId};
use courier_events::{Event, EventEnvelope, StepState, WorkflowRecord};
use courier_observability::TraceContext;

use super::Record;

/// An event waiting to leave its bounded context.
///
/// Written in the same transaction as the business change that produced it;
/// `sent` flips to `true` exactly once, after the broker confirmed the publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: OutboxId,
    pub event_name: String,
    pub transaction_id: TransactionId,
    pub payload: JsonValue,
    pub creation_date: DateTime<Utc>,
    pub sent: bool,
    pub sent_date: Option<DateTime<Utc>>,
    pub trace_context: TraceContext,
}

impl OutboxRecord {
    /// Fresh unsent record, tagged with the current trace context.
    pub fn new(event_name: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            id: OutboxId::new(),
            event_name: event_name.into(),
            transaction_id: TransactionId::new(),
            payload,
            creation_date: Utc::now(),
            sent: false,
            sent_date: None,
            trace_context: TraceContext::current(),
        }
    }

    pub fn for_event<E: Event>(event: &E) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event.event_type(), serde_json::to_value(event)?))
    }

    pub fn mark_sent(&mut self, at: DateTime<Utc>) {
        self.sent = true;
        self.sent_date = Some(at);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxSelector {
    Unsent,
}

impl Record for OutboxRecord {
    type Id = OutboxId;
    type Key = TransactionId;
    type Selector = OutboxSelector;

    fn id(&self) -> OutboxId {
        self.id
    }

    fn unique_key(&self) -> TransactionId {
        self.transaction_id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.creation_date
    }

    fn matches(&self, selector: &OutboxSelector) -> bool {
        match selector {
            OutboxSelector::Unsent => !self.sent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboxStatus {
    Pending,
    Processed,
    Error,
    DeadLetter,
}

impl InboxStatus {
    pub const ALL: [InboxStatus; 4] = [
        InboxStatus::Pending,
        InboxStatus::Processed,
        InboxStatus::Error,
        InboxStatus::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Pending => "PENDING",
            InboxStatus::Processed => "PROCESSED",
            InboxStatus::Error => "ERROR",
            InboxStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    /// Terminal rows are never picked up again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InboxStatus::Processed | InboxStatus::DeadLetter)
    }
}

impl core::fmt::Display for InboxStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for InboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InboxStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown inbox status '{s}'"))
    }
}

/// A received event, deduplicated per consuming bounded context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxRecord {
    pub id: InboxId,

    /// Name of the consuming bounded context.
    pub consumer: String,
    pub event_name: String,
    pub transaction_id: TransactionId,
    pub payload: JsonValue,
    pub creation_date: DateTime<Utc>,
    pub status: InboxStatus,
    pub last_execution_date: Option<DateTime<Utc>>,
    pub attempts_number: u32,
    pub trace_context: TraceContext,
    pub metadata: JsonValue,
}

impl InboxRecord {
    pub fn new(
        consumer: impl Into<String>,
        event_name: impl Into<String>,
        transaction_id: TransactionId,
        payload: JsonValue,
        trace_context: TraceContext,
    ) -> Self {
        Self {
            id: InboxId::new(),
            consumer: consumer.into(),
            event_name: event_name.into(),
            transaction_id,
            payload,
            creation_date: Utc::now(),
            status: InboxStatus::Pending,
            last_execution_date: None,
            attempts_number: 0,
            trace_context,
            metadata: JsonValue::Object(Default::default()),
        }
    }

    /// The envelope handed to handlers for the current attempt.
    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope::new(
            self.event_name.clone(),
            self.transaction_id,
            self.payload.clone(),
            self.creation_date,
            self.trace_context.clone(),
            self.attempts_number.saturating_add(1),
        )
    }

    pub fn mark_processed(&mut self) {
        self.status = InboxStatus::Processed;
    }

    /// Count a failed attempt. Dead-letters once `max_attempts` is reached.
    pub fn mark_failed(&mut self, error: &str, max_attempts: u32, at: DateTime<Utc>) -> InboxStatus {
        self.attempts_number = self.attempts_number.saturating_add(1);
        self.status = if self.attempts_number >= max_attempts {
            InboxStatus::DeadLetter
        } else {
            InboxStatus::Error
        };
        self.note_error(error, at);
        self.status
    }

    /// Dead-letter without counting an attempt (nothing ran).
    pub fn mark_dead_letter(&mut self, reason: &str, at: DateTime<Utc>) {
        self.status = InboxStatus::DeadLetter;
        self.note_error(reason, at);
    }

    pub fn last_error(&self) -> Option<&str> {
        self.metadata.get("last_error").and_then(JsonValue::as_str)
    }

    fn note_error(&mut self, error: &str, at: DateTime<Utc>) {
        if !self.metadata.is_object() {
            self.metadata = JsonValue::Object(Default::default());
        }
        if let JsonValue::Object(map) = &mut self.metadata {
            map.insert("last_error".to_string(), JsonValue::String(error.to_string()));
            map.insert("last_error_at".to_string(), JsonValue::String(at.to_rfc3339()));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxSelector {
    /// Non-terminal rows of one consumer.
    Eligible { consumer: String },
    WithStatus { consumer: String, status: InboxStatus },
}

impl Record for InboxRecord {
    type Id = InboxId;
    type Key = (String, TransactionId);
    type Selector = InboxSelector;

    fn id(&self) -> InboxId {
        self.id
    }

    fn unique_key(&self) -> (String, TransactionId) {
        (self.consumer.clone(), self.transaction_id)
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.creation_date
    }

    fn matches(&self, selector: &InboxSelector) -> bool {
        match selector {
            InboxSelector::Eligible { consumer } => {
                &self.consumer == consumer && !self.status.is_terminal()
            }
            InboxSelector::WithStatus { consumer, status } => {
                &self.consumer == consumer && self.status == *status
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowSelector {
    InState(StepState),

    /// Parked by a step that ran: `PENDING` with a recorded execution.
    Suspended,
}

impl Record for WorkflowRecord {
    type Id = WorkflowId;
    type Key = WorkflowId;
    type Selector = WorkflowSelector;

    fn id(&self) -> WorkflowId {
        self.id
    }

    fn unique_key(&self) -> WorkflowId {
        self.id
    }

    /// Workflow ids are UUIDv7, so creation time is read off the id.
    fn created_at(&self) -> DateTime<Utc> {
        self.id
            .as_uuid()
            .get_timestamp()
            .and_then(|ts| {
                let (secs, nanos) = ts.to_unix();
                DateTime::from_timestamp(i64::try_from(secs).ok()?, nanos)
            })
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    fn matches(&self, selector: &WorkflowSelector) -> bool {
        match selector {
            WorkflowSelector::InState(state) => self.step_state == *state,
            WorkflowSelector::Suspended => {
                self.step_state == StepState::Pending && self.last_execution.is_some()
            }
        }
    }
}
