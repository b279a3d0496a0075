//! Saga workflow contract (mechanics only, no business rules).
//!
//! - A workflow is an ordered list of named steps
//! - Each step may define a compensating action, run in reverse on failure
//! - Progress lives in a `WorkflowRecord`, either in memory or persisted
//!
//! Infra (the orchestrator) runs the steps, decides when to compensate, and
//! persists the record. Steps only read and write the record they are handed.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::WorkflowId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    Pending,
    Ok,
    Error,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Pending => "PENDING",
            StepState::Ok => "OK",
            StepState::Error => "ERROR",
        }
    }
}

impl core::str::FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StepState::Pending),
            "OK" => Ok(StepState::Ok),
            "ERROR" => Ok(StepState::Error),
            other => Err(format!("unknown step state '{other}'")),
        }
    }
}

/// One line of a workflow's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: String,
    pub timestamp: DateTime<Utc>,
    pub state: StepState,
    pub description: String,
}

/// Progress of one saga instance.
///
/// Same shape in memory and in the `courier_workflow` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: WorkflowId,
    pub current_step: String,
    pub step_state: StepState,

    /// Consecutive runs of `current_step` without success.
    pub step_execution_count: u32,
    pub last_execution: Option<DateTime<Utc>>,
    pub histories: Vec<HistoryEntry>,

    /// Scratch space shared by all steps of the workflow.
    pub context_data: JsonValue,
}

impl WorkflowRecord {
    pub fn new(id: WorkflowId, first_step: impl Into<String>) -> Self {
        Self {
            id,
            current_step: first_step.into(),
            step_state: StepState::Pending,
            step_execution_count: 0,
            last_execution: None,
            histories: Vec::new(),
            context_data: JsonValue::Object(Default::default()),
        }
    }

    /// Park the workflow on the running step (e.g. awaiting a callback).
    ///
    /// The next run resumes at the same step.
    pub fn suspend(&mut self) {
        self.step_state = StepState::Pending;
    }

    pub fn record(&mut self, step: impl Into<String>, state: StepState, description: impl Into<String>) {
        self.histories.push(HistoryEntry {
            step: step.into(),
            timestamp: Utc::now(),
            state,
            description: description.into(),
        });
    }

    /// Read a typed value from `context_data`.
    ///
    /// Missing keys are `Ok(None)`; a value of the wrong shape is an error.
    pub fn context<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        match self.context_data.get(key) {
            Some(value) => T::deserialize(value).map(Some),
            None => Ok(None),
        }
    }

    /// Store a value in `context_data`, replacing any previous one.
    pub fn set_context<T: Serialize>(&mut self, key: &str, value: T) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        if !self.context_data.is_object() {
            self.context_data = JsonValue::Object(Default::default());
        }
        if let JsonValue::Object(map) = &mut self.context_data {
            map.insert(key.to_string(), value);
        }
        Ok(())
    }
}

/// One step of a saga.
///
/// `run` must be idempotent: after a crash the orchestrator re-runs the step
/// it was positioned on.
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, workflow: &mut WorkflowRecord) -> anyhow::Result<()>;

    /// Undo this step's effects after `failed_step` failed. No-op by default.
    fn compensate(&self, _workflow: &mut WorkflowRecord, _failed_step: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
