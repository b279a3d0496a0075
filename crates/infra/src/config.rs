//! Runtime configuration.
//!
//! Every knob has a default; `from_env` overrides them from `COURIER_*`
//! variables (plus `DATABASE_URL` and `REDIS_URL`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const ROOT_EXCHANGE_VAR: &str = "COURIER_ROOT_EXCHANGE";
pub const OUTBOX_BATCH_SIZE_VAR: &str = "COURIER_OUTBOX_BATCH_SIZE";
pub const INBOX_BATCH_SIZE_VAR: &str = "COURIER_INBOX_BATCH_SIZE";
pub const INBOX_MAX_ATTEMPTS_VAR: &str = "COURIER_INBOX_MAX_ATTEMPTS";
pub const POLL_INTERVAL_MS_VAR: &str = "COURIER_POLL_INTERVAL_MS";
pub const SAGA_MAX_RETRIES_VAR: &str = "COURIER_SAGA_MAX_RETRIES";
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";
pub const REDIS_URL_VAR: &str = "REDIS_URL";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// Prefix of every topic (`<root_exchange>.<event_type>`).
    pub root_exchange: String,
    pub outbox_batch_size: usize,
    pub inbox_batch_size: usize,

    /// Failed attempts after which an inbox row is dead-lettered.
    pub inbox_max_attempts: u32,
    pub poll_interval_ms: u64,
    pub saga_max_retries: u32,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            root_exchange: "courier".to_string(),
            outbox_batch_size: 100,
            inbox_batch_size: 50,
            inbox_max_attempts: 5,
            poll_interval_ms: 3_000,
            saga_max_retries: 5,
            database_url: None,
            redis_url: None,
        }
    }
}

impl CourierConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(root) = lookup(ROOT_EXCHANGE_VAR) {
            let root = root.trim();
            if root.is_empty() {
                return Err(ConfigError::Empty(ROOT_EXCHANGE_VAR));
            }
            config.root_exchange = root.to_string();
        }
        if let Some(value) = lookup(OUTBOX_BATCH_SIZE_VAR) {
            config.outbox_batch_size = positive(OUTBOX_BATCH_SIZE_VAR, &value)?;
        }
        if let Some(value) = lookup(INBOX_BATCH_SIZE_VAR) {
            config.inbox_batch_size = positive(INBOX_BATCH_SIZE_VAR, &value)?;
        }
        if let Some(value) = lookup(INBOX_MAX_ATTEMPTS_VAR) {
            config.inbox_max_attempts = positive(INBOX_MAX_ATTEMPTS_VAR, &value)?;
        }
        if let Some(value) = lookup(POLL_INTERVAL_MS_VAR) {
            config.poll_interval_ms = positive(POLL_INTERVAL_MS_VAR, &value)?;
        }
        if let Some(value) = lookup(SAGA_MAX_RETRIES_VAR) {
            config.saga_max_retries = positive(SAGA_MAX_RETRIES_VAR, &value)?;
        }
        config.database_url = lookup(DATABASE_URL_VAR).filter(|url| !url.is_empty());
        config.redis_url = lookup(REDIS_URL_VAR).filter(|url| !url.is_empty());
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn with_root_exchange(mut self, root_exchange: impl Into<String>) -> Self {
        self.root_exchange = root_exchange.into();
        self
    }

    pub fn with_outbox_batch_size(mut self, size: usize) -> Self {
        self.outbox_batch_size = size;
        self
    }

    pub fn with_inbox_batch_size(mut self, size: usize) -> Self {
        self.inbox_batch_size = size;
        self
    }

    pub fn with_inbox_max_attempts(mut self, attempts: u32) -> Self {
        self.inbox_max_attempts = attempts;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_saga_max_retries(mut self, retries: u32) -> Self {
        self.saga_max_retries = retries;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }
}

fn positive<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
{
    match value.trim().parse::<T>() {
        Ok(parsed) if parsed != T::default() => Ok(parsed),
        _ => Err(ConfigError::InvalidNumber {
            var,
            value: value.to_string(),
        }),
    }
}
