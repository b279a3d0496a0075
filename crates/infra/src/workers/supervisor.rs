//! Restart-on-death supervision for long-lived worker tasks.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use super::token::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),

    #[error("supervisor state lock poisoned")]
    Poisoned,
}

/// A long-lived task. It should return once the token is cancelled.
pub type SupervisedTask = Arc<dyn Fn(&CancellationToken) -> anyhow::Result<()> + Send + Sync>;

/// Exponential restart backoff, doubling from `base` up to `max`.
///
/// The delay resets once a task has stayed up for at least `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl RestartPolicy {
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let factor = 1u32.checked_shl(consecutive_failures.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Runs named tasks on their own threads and restarts any task whose thread
/// dies (panic, error, or early return) while the token is still live.
pub struct Supervisor {
    token: CancellationToken,
    policy: RestartPolicy,
    restarts: Arc<Mutex<BTreeMap<String, u32>>>,
    guards: Vec<(String, thread::JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            policy: RestartPolicy::default(),
            restarts: Arc::new(Mutex::new(BTreeMap::new())),
            guards: Vec::new(),
        }
    }

    pub fn with_restart_backoff(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F) -> Result<(), SupervisorError>
    where
        F: Fn(&CancellationToken) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        self.restarts
            .lock()
            .map_err(|_| SupervisorError::Poisoned)?
            .insert(name.clone(), 0);

        let task: SupervisedTask = Arc::new(task);
        let token = self.token.clone();
        let policy = self.policy;
        let restarts = Arc::clone(&self.restarts);
        let guard_name = name.clone();

        let guard = thread::Builder::new()
            .name(format!("{name}-supervisor"))
            .spawn(move || supervise(&guard_name, &task, &token, policy, &restarts))?;
        self.guards.push((name, guard));
        Ok(())
    }

    /// How many times `name` has been restarted.
    pub fn restarts(&self, name: &str) -> u32 {
        self.restarts
            .lock()
            .map(|restarts| restarts.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.guards.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Cancel every task and wait for all of them to exit.
    pub fn shutdown(self) {
        self.token.cancel();
        for (name, guard) in self.guards {
            if guard.join().is_err() {
                error!(task = %name, "supervisor thread panicked");
            }
        }
        info!("supervisor stopped");
    }
}

fn supervise(
    name: &str,
    task: &SupervisedTask,
    token: &CancellationToken,
    policy: RestartPolicy,
    restarts: &Mutex<BTreeMap<String, u32>>,
) {
    let mut consecutive_failures = 0u32;

    while !token.is_cancelled() {
        let started = Instant::now();
        let run = {
            let task = Arc::clone(task);
            let token = token.clone();
            thread::Builder::new()
                .name(name.to_string())
                .spawn(move || task(&token))
        };
        let outcome = match run {
            Ok(join) => join.join(),
            Err(err) => {
                error!(task = %name, error = %err, "failed to spawn task thread");
                Ok(Err(err.into()))
            }
        };

        if token.is_cancelled() {
            break;
        }
        match outcome {
            Ok(Ok(())) => warn!(task = %name, "task returned while still running"),
            Ok(Err(err)) => {
                let message = format!("{err:#}");
                error!(task = %name, error = %message, "task failed");
            }
            Err(_) => error!(task = %name, "task panicked"),
        }

        if started.elapsed() >= policy.max {
            consecutive_failures = 0;
        }
        let delay = policy.delay(consecutive_failures);
        consecutive_failures = consecutive_failures.saturating_add(1);
        if let Ok(mut restarts) = restarts.lock() {
            *restarts.entry(name.to_string()).or_insert(0) += 1;
        }
        warn!(task = %name, delay_ms = delay.as_millis() as u64, "restarting task");
        if token.wait(delay) {
            break;
        }
    }
    info!(task = %name, "task stopped");
}
