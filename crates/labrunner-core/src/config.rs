//! Runner configuration.
//!
//! Defaults can be overridden from a JSON file ([`RunnerConfig::load`]) and
//! then from `LABRUNNER_*` environment variables ([`RunnerConfig::apply_env`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const RESPONSE_TIMEOUT_ENV: &str = "LABRUNNER_RESPONSE_TIMEOUT_MS";
pub const POLL_INTERVAL_ENV: &str = "LABRUNNER_POLL_INTERVAL_MS";
pub const IDLE_POLL_ENV: &str = "LABRUNNER_IDLE_POLL_MS";
pub const WORKER_PATH_ENV: &str = "LABRUNNER_WORKER_PATH";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// How long a proxy call waits for its response.
    pub response_timeout_ms: u64,
    /// Cadence of the execution process' command loop.
    pub poll_interval_ms: u64,
    /// How long an idle worker waits between cancellation checks.
    pub idle_poll_ms: u64,
    /// Explicit path of the `labrunner-worker` binary.
    pub worker_path: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 2000,
            poll_interval_ms: 100,
            idle_poll_ms: 50,
            worker_path: None,
        }
    }
}

impl RunnerConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env()
    }

    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `LABRUNNER_*` environment variables.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let millis = |name: &str| -> Result<Option<u64>> {
            match var(name) {
                Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
                    Error::Config(format!(
                        "{} must be a number of milliseconds, got '{}'",
                        name, raw
                    ))
                }),
                None => Ok(None),
            }
        };
        if let Some(ms) = millis(RESPONSE_TIMEOUT_ENV)? {
            self.response_timeout_ms = ms;
        }
        if let Some(ms) = millis(POLL_INTERVAL_ENV)? {
            self.poll_interval_ms = ms;
        }
        if let Some(ms) = millis(IDLE_POLL_ENV)? {
            self.idle_poll_ms = ms;
        }
        if let Some(path) = var(WORKER_PATH_ENV) {
            self.worker_path = Some(PathBuf::from(path));
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".to_string()));
        }
        if self.idle_poll_ms == 0 {
            return Err(Error::Config("idle_poll_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    pub fn with_worker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_path = Some(path.into());
        self
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}
