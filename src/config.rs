//! Operator configuration read from the environment

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default metrics port
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Default runner image for backup executions
pub const DEFAULT_RUNNER_IMAGE: &str = "backup-runner:latest";

/// Field manager used for every write
pub const FIELD_MANAGER: &str = "backup-operator";

/// Runtime settings for the operator
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Port of the metrics/health server
    pub metrics_port: u16,

    /// Image used when a BackupJob does not set one
    pub runner_image: String,

    /// Restrict watches to one namespace
    pub watch_namespace: Option<String>,

    /// Longest timer-based requeue for scheduled BackupJobs
    pub max_requeue: Duration,

    /// First retry delay after a transient error
    pub error_backoff_base: Duration,

    /// Ceiling for the retry delay
    pub error_backoff_max: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            metrics_port: DEFAULT_METRICS_PORT,
            runner_image: DEFAULT_RUNNER_IMAGE.to_string(),
            watch_namespace: None,
            max_requeue: Duration::from_secs(300),
            error_backoff_base: Duration::from_secs(5),
            error_backoff_max: Duration::from_secs(300),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            metrics_port: parse_or(get("METRICS_PORT"), "METRICS_PORT", defaults.metrics_port)?,
            runner_image: get("BACKUP_RUNNER_IMAGE").unwrap_or(defaults.runner_image),
            watch_namespace: get("WATCH_NAMESPACE"),
            max_requeue: secs_or(get("MAX_REQUEUE_SECS"), "MAX_REQUEUE_SECS", defaults.max_requeue)?,
            error_backoff_base: secs_or(
                get("ERROR_BACKOFF_BASE_SECS"),
                "ERROR_BACKOFF_BASE_SECS",
                defaults.error_backoff_base,
            )?,
            error_backoff_max: secs_or(
                get("ERROR_BACKOFF_MAX_SECS"),
                "ERROR_BACKOFF_MAX_SECS",
                defaults.error_backoff_max,
            )?,
        };

        if config.max_requeue.is_zero() {
            return Err(Error::config("MAX_REQUEUE_SECS must be greater than zero"));
        }
        if config.error_backoff_base > config.error_backoff_max {
            return Err(Error::config(
                "ERROR_BACKOFF_BASE_SECS must not exceed ERROR_BACKOFF_MAX_SECS",
            ));
        }

        Ok(config)
    }

    /// Retry delay after `failures` consecutive transient errors
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.error_backoff_base
            .saturating_mul(factor)
            .min(self.error_backoff_max)
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match value {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid {} '{}': {}", key, v, e))),
        None => Ok(default),
    }
}

fn secs_or(value: Option<String>, key: &str, default: Duration) -> Result<Duration> {
    parse_or(value, key, default.as_secs()).map(Duration::from_secs)
}
