//! Saga orchestration: ordered steps, reverse compensation, resumable runs.
//!
//! The same algorithm drives an in-memory `WorkflowRecord` (`run`) and a
//! persisted one (`run_persisted`). In persisted mode the workflow row is
//! locked with `NOWAIT` for the whole run, so at most one runner advances a
//! workflow and a second runner fails immediately instead of queueing.
//!
//! ## Step bookkeeping
//!
//! - Before a step runs: `current_step` is set, `step_execution_count` goes up
//!   by one, `step_state` is `OK`
//! - The step may call `workflow.suspend()` to park the workflow (`PENDING`)
//! - Success resets `step_execution_count` to zero
//! - A failure leaves `step_state = ERROR` on the failed step, then every
//!   earlier step is compensated in reverse order
//!
//! A run refuses to start once `step_execution_count` has reached the retry
//! ceiling.

use std::collections::BTreeSet;

use chrono::Utc;
use tracing::{error, info, info_span, warn};

use courier_core::WorkflowId;
use courier_events::{Step, StepState, WorkflowRecord};

use crate::store::{LockMode, Store, StoreError, WorkflowSelector};

#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("workflow {0} is being processed by another runner")]
    WorkflowBusy(WorkflowId),

    #[error("workflow {workflow} reached {attempts} attempts on step '{step}'")]
    MaxRetriesReached {
        workflow: WorkflowId,
        step: String,
        attempts: u32,
    },

    #[error("workflow {workflow} is positioned on unknown step '{step}'")]
    UnknownStep { workflow: WorkflowId, step: String },

    #[error("workflow {0} not found")]
    NotFound(WorkflowId),

    #[error("step '{step}' failed: {source:#}")]
    StepFailed {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid saga definition: {0}")]
    InvalidDefinition(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaOutcome {
    /// Every step has succeeded.
    Completed,

    /// A step parked the workflow; the next run resumes at `step`.
    Suspended { step: String },
}

pub struct SagaOrchestrator {
    name: String,
    steps: Vec<Box<dyn Step>>,
    max_retries: u32,
}

impl SagaOrchestrator {
    pub fn new(
        name: impl Into<String>,
        steps: Vec<Box<dyn Step>>,
        max_retries: u32,
    ) -> Result<Self, SagaError> {
        let name = name.into();
        if steps.is_empty() {
            return Err(SagaError::InvalidDefinition(format!("saga '{name}' has no steps")));
        }
        let duplicate = {
            let mut seen = BTreeSet::new();
            steps
                .iter()
                .map(|s| s.name())
                .find(|n| !seen.insert(*n))
                .map(str::to_string)
        };
        if let Some(dup) = duplicate {
            return Err(SagaError::InvalidDefinition(format!(
                "saga '{name}' declares step '{dup}' twice"
            )));
        }
        Ok(Self {
            name,
            steps,
            max_retries,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// A fresh workflow positioned on the first step.
    pub fn new_workflow(&self) -> WorkflowRecord {
        WorkflowRecord::new(WorkflowId::new(), self.steps[0].name())
    }

    /// Create and persist a fresh workflow.
    pub fn create<S>(&self, store: &S) -> Result<WorkflowRecord, SagaError>
    where
        S: Store<WorkflowRecord> + ?Sized,
    {
        let (workflow, _) = store.get_or_create(self.new_workflow())?;
        Ok(workflow)
    }

    /// Persisted workflows parked by a suspended step, oldest first.
    ///
    /// Workflows that were created but never run are not listed.
    pub fn suspended<S>(&self, store: &S, limit: usize) -> Result<Vec<WorkflowRecord>, SagaError>
    where
        S: Store<WorkflowRecord> + ?Sized,
    {
        Ok(store.select(&WorkflowSelector::Suspended, limit)?)
    }

    /// Advance `workflow` as far as it goes.
    ///
    /// `MaxRetriesReached` and `UnknownStep` are raised before anything is
    /// touched. `StepFailed` is raised after compensation, with the workflow
    /// left on the failed step.
    pub fn run(&self, workflow: &mut WorkflowRecord) -> Result<SagaOutcome, SagaError> {
        if workflow.step_execution_count >= self.max_retries {
            warn!(
                saga = %self.name,
                workflow_id = %workflow.id,
                step = %workflow.current_step,
                attempts = workflow.step_execution_count,
                "workflow reached its retry ceiling"
            );
            return Err(SagaError::MaxRetriesReached {
                workflow: workflow.id,
                step: workflow.current_step.clone(),
                attempts: workflow.step_execution_count,
            });
        }
        let position = self
            .steps
            .iter()
            .position(|s| s.name() == workflow.current_step)
            .ok_or_else(|| SagaError::UnknownStep {
                workflow: workflow.id,
                step: workflow.current_step.clone(),
            })?;

        // A step that already succeeded is not run again.
        let succeeded = workflow.step_state == StepState::Ok
            && workflow.step_execution_count == 0
            && workflow.last_execution.is_some();
        let start = if succeeded { position + 1 } else { position };

        for (index, step) in self.steps.iter().enumerate().skip(start) {
            let step_name = step.name().to_string();
            workflow.current_step = step_name.clone();
            workflow.step_execution_count = workflow.step_execution_count.saturating_add(1);
            workflow.last_execution = Some(Utc::now());
            workflow.step_state = StepState::Ok;

            let span = info_span!(
                "saga.step",
                saga = %self.name,
                workflow_id = %workflow.id,
                step = %step_name,
                attempt = workflow.step_execution_count
            );
            let result = span.in_scope(|| step.run(workflow));

            match result {
                Ok(()) if workflow.step_state == StepState::Pending => {
                    workflow.record(&step_name, StepState::Pending, "step suspended");
                    info!(saga = %self.name, workflow_id = %workflow.id, step = %step_name, "workflow suspended");
                    return Ok(SagaOutcome::Suspended { step: step_name });
                }
                Ok(()) => {
                    workflow.step_state = StepState::Ok;
                    workflow.step_execution_count = 0;
                    workflow.record(&step_name, StepState::Ok, "step completed");
                }
                Err(source) => {
                    workflow.step_state = StepState::Error;
                    let message = format!("{source:#}");
                    workflow.record(&step_name, StepState::Error, message.clone());
                    warn!(
                        saga = %self.name,
                        workflow_id = %workflow.id,
                        step = %step_name,
                        error = %message,
                        "saga step failed; compensating"
                    );
                    self.compensate(workflow, index, &step_name);
                    workflow.current_step = step_name.clone();
                    workflow.step_state = StepState::Error;
                    return Err(SagaError::StepFailed {
                        step: step_name,
                        source,
                    });
                }
            }
        }

        info!(saga = %self.name, workflow_id = %workflow.id, "workflow completed");
        Ok(SagaOutcome::Completed)
    }

    /// Lock the stored workflow without waiting, run it, and save the result.
    ///
    /// The final state is committed even when a step fails, so the failure and
    /// its compensations are on record.
    pub fn run_persisted<S>(&self, store: &S, id: WorkflowId) -> Result<SagaOutcome, SagaError>
    where
        S: Store<WorkflowRecord> + ?Sized,
    {
        let mut tx = store.begin()?;
        let mut workflow = match tx.lock(id, LockMode::NoWait) {
            Ok(Some(workflow)) => workflow,
            Ok(None) => {
                tx.rollback()?;
                return Err(SagaError::NotFound(id));
            }
            Err(StoreError::Locked(_)) => {
                tx.rollback()?;
                warn!(saga = %self.name, workflow_id = %id, "workflow busy");
                return Err(SagaError::WorkflowBusy(id));
            }
            Err(err) => {
                tx.rollback()?;
                return Err(err.into());
            }
        };

        let result = self.run(&mut workflow);
        match &result {
            Err(SagaError::MaxRetriesReached { .. } | SagaError::UnknownStep { .. }) => tx.rollback()?,
            _ => {
                tx.save(&workflow)?;
                tx.commit()?;
            }
        }
        result
    }

    /// Compensate the steps before `failed_index`, last first.
    fn compensate(&self, workflow: &mut WorkflowRecord, failed_index: usize, failed_step: &str) {
        for step in self.steps[..failed_index].iter().rev() {
            match step.compensate(workflow, failed_step) {
                Ok(()) => workflow.record(
                    step.name(),
                    StepState::Ok,
                    format!("compensated after '{failed_step}' failed"),
                ),
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(
                        saga = %self.name,
                        workflow_id = %workflow.id,
                        step = %step.name(),
                        error = %message,
                        "compensation failed"
                    );
                    workflow.record(
                        step.name(),
                        StepState::Error,
                        format!("compensation failed: {message}"),
                    );
                }
            }
        }
    }
}

impl core::fmt::Debug for SagaOrchestrator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SagaOrchestrator")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::store::InMemoryStore;

    type Calls = Arc<Mutex<Vec<String>>>;

    struct Scripted {
        name: &'static str,
        calls: Calls,
        fail: bool,
        suspend: bool,
        fail_compensation: bool,
    }

    impl Scripted {
        fn ok(name: &'static str, calls: &Calls) -> Box<dyn Step> {
            Box::new(Self {
                name,
                calls: Arc::clone(calls),
                fail: false,
                suspend: false,
                fail_compensation: false,
            })
        }
    }

    impl Step for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn run(&self, workflow: &mut WorkflowRecord) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("run {}", self.name));
            if self.fail {
                anyhow::bail!("{} exploded", self.name);
            }
            if self.suspend && workflow.context::<bool>("callback").unwrap().is_none() {
                workflow.suspend();
            }
            Ok(())
        }

        fn compensate(&self, _: &mut WorkflowRecord, failed_step: &str) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("undo {} after {failed_step}", self.name));
            if self.fail_compensation {
                anyhow::bail!("cannot undo {}", self.name);
            }
            Ok(())
        }
    }

    #[test]
    fn runs_every_step_in_order() {
        let calls = Calls::default();
        let saga = SagaOrchestrator::new(
            "checkout",
            vec![Scripted::ok("A", &calls), Scripted::ok("B", &calls)],
            3,
        )
        .unwrap();
        let mut wf = saga.new_workflow();

        assert_eq!(saga.run(&mut wf).unwrap(), SagaOutcome::Completed);
        assert_eq!(*calls.lock().unwrap(), vec!["run A", "run B"]);
        assert_eq!(wf.current_step, "B");
        assert_eq!(wf.step_state, StepState::Ok);
        assert_eq!(wf.step_execution_count, 0);

        // Completed workflows do not re-run their last step.
        assert_eq!(saga.run(&mut wf).unwrap(), SagaOutcome::Completed);
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn failure_compensates_earlier_steps_in_reverse() {
        let calls = Calls::default();
        let failing = Box::new(Scripted {
            name: "C",
            calls: Arc::clone(&calls),
            fail: true,
            suspend: false,
            fail_compensation: false,
        });
        let stubborn = Box::new(Scripted {
            name: "B",
            calls: Arc::clone(&calls),
            fail: false,
            suspend: false,
            fail_compensation: true,
        });
        let saga = SagaOrchestrator::new(
            "checkout",
            vec![Scripted::ok("A", &calls), stubborn, failing, Scripted::ok("D", &calls)],
            3,
        )
        .unwrap();
        let mut wf = saga.new_workflow();

        let err = saga.run(&mut wf).unwrap_err();
        assert!(matches!(&err, SagaError::StepFailed { step, .. } if step == "C"));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["run A", "run B", "run C", "undo B after C", "undo A after C"]
        );
        assert_eq!(wf.current_step, "C");
        assert_eq!(wf.step_state, StepState::Error);
        assert_eq!(wf.step_execution_count, 1);

        let tail: Vec<_> = wf.histories[2..]
            .iter()
            .map(|h| (h.step.as_str(), h.state))
            .collect();
        assert_eq!(
            tail,
            vec![("C", StepState::Error), ("B", StepState::Error), ("A", StepState::Ok)]
        );
        assert_eq!(wf.histories[2].description, "C exploded");
    }

    #[test]
    fn retry_ceiling_stops_runs_before_anything_happens() {
        let calls = Calls::default();
        let failing = Box::new(Scripted {
            name: "A",
            calls: Arc::clone(&calls),
            fail: true,
            suspend: false,
            fail_compensation: false,
        });
        let saga = SagaOrchestrator::new("retry", vec![failing], 2).unwrap();
        let mut wf = saga.new_workflow();

        assert!(matches!(saga.run(&mut wf), Err(SagaError::StepFailed { .. })));
        assert!(matches!(saga.run(&mut wf), Err(SagaError::StepFailed { .. })));
        let before = wf.clone();
        assert!(matches!(
            saga.run(&mut wf),
            Err(SagaError::MaxRetriesReached { attempts: 2, .. })
        ));
        assert_eq!(wf, before);
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn suspended_steps_resume_where_they_stopped() {
        let calls = Calls::default();
        let waiting = Box::new(Scripted {
            name: "await-payment",
            calls: Arc::clone(&calls),
            fail: false,
            suspend: true,
            fail_compensation: false,
        });
        let saga = SagaOrchestrator::new(
            "checkout",
            vec![Scripted::ok("reserve", &calls), waiting, Scripted::ok("ship", &calls)],
            5,
        )
        .unwrap();
        let mut wf = saga.new_workflow();

        assert_eq!(
            saga.run(&mut wf).unwrap(),
            SagaOutcome::Suspended {
                step: "await-payment".to_string()
            }
        );
        assert_eq!(wf.step_state, StepState::Pending);
        assert_eq!(wf.histories.last().map(|h| h.state), Some(StepState::Pending));

        wf.set_context("callback", true).unwrap();
        assert_eq!(saga.run(&mut wf).unwrap(), SagaOutcome::Completed);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["run reserve", "run await-payment", "run await-payment", "run ship"]
        );
    }

    #[test]
    fn invalid_definitions_are_rejected() {
        let calls = Calls::default();
        assert!(matches!(
            SagaOrchestrator::new("empty", Vec::new(), 3),
            Err(SagaError::InvalidDefinition(_))
        ));
        assert!(matches!(
            SagaOrchestrator::new("dup", vec![Scripted::ok("A", &calls), Scripted::ok("A", &calls)], 3),
            Err(SagaError::InvalidDefinition(_))
        ));

        let saga = SagaOrchestrator::new("one", vec![Scripted::ok("A", &calls)], 3).unwrap();
        let mut wf = WorkflowRecord::new(WorkflowId::new(), "Z");
        assert!(matches!(saga.run(&mut wf), Err(SagaError::UnknownStep { .. })));
    }

    #[test]
    fn persisted_runs_save_the_final_state() {
        let calls = Calls::default();
        let saga = SagaOrchestrator::new(
            "checkout",
            vec![Scripted::ok("A", &calls), Scripted::ok("B", &calls)],
            3,
        )
        .unwrap();
        let store: InMemoryStore<WorkflowRecord> = InMemoryStore::new();
        let wf = saga.create(&store).unwrap();

        assert_eq!(saga.run_persisted(&store, wf.id).unwrap(), SagaOutcome::Completed);
        let stored = store.get(wf.id).unwrap().unwrap();
        assert_eq!(stored.current_step, "B");
        assert_eq!(stored.histories.len(), 2);

        assert!(matches!(
            saga.run_persisted(&store, WorkflowId::new()),
            Err(SagaError::NotFound(_))
        ));
    }
}
