//! Engine configuration from environment variables.

use std::time::Duration;

use thiserror::Error;

use stockflow_automation::MAX_RESERVATION_HOURS;

use crate::handlers::DEFAULT_RESERVATION_HOURS;
use crate::runs::{RetryPolicy, RunExecutorConfig};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("{0} is required when USE_PERSISTENT_STORES is set")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub use_persistent_stores: bool,
    /// Periodic reload bound; `None` reloads only on authoring changes.
    pub rule_refresh_interval: Option<Duration>,
    pub run_max_attempts: u32,
    pub run_base_delay: Duration,
    pub run_max_delay: Duration,
    pub run_lease: Duration,
    pub executor_poll_interval: Duration,
    pub executor_workers: usize,
    pub default_reservation_hours: i64,
    pub reservation_sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            use_persistent_stores: false,
            rule_refresh_interval: None,
            run_max_attempts: 5,
            run_base_delay: Duration::from_millis(500),
            run_max_delay: Duration::from_millis(60_000),
            run_lease: Duration::from_secs(300),
            executor_poll_interval: Duration::from_millis(100),
            executor_workers: 2,
            default_reservation_hours: DEFAULT_RESERVATION_HOURS,
            reservation_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, EngineConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EngineConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |var: &'static str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let config = Self {
            database_url: get("DATABASE_URL"),
            use_persistent_stores: match get("USE_PERSISTENT_STORES") {
                Some(v) => parse_bool("USE_PERSISTENT_STORES", &v)?,
                None => defaults.use_persistent_stores,
            },
            rule_refresh_interval: get("RULE_REFRESH_INTERVAL_SECS")
                .map(|v| parse_positive::<u64>("RULE_REFRESH_INTERVAL_SECS", &v).map(Duration::from_secs))
                .transpose()?,
            run_max_attempts: parse_or(&get, "RUN_MAX_ATTEMPTS", defaults.run_max_attempts)?,
            run_base_delay: parse_or(&get, "RUN_BASE_DELAY_MS", 500u64).map(Duration::from_millis)?,
            run_max_delay: parse_or(&get, "RUN_MAX_DELAY_MS", 60_000u64).map(Duration::from_millis)?,
            run_lease: parse_or(&get, "RUN_LEASE_SECS", 300u64).map(Duration::from_secs)?,
            executor_poll_interval: parse_or(&get, "EXECUTOR_POLL_MS", 100u64).map(Duration::from_millis)?,
            executor_workers: parse_or(&get, "EXECUTOR_WORKERS", defaults.executor_workers)?,
            default_reservation_hours: parse_or(&get, "DEFAULT_RESERVATION_HOURS", defaults.default_reservation_hours)?,
            reservation_sweep_interval: parse_or(&get, "RESERVATION_SWEEP_INTERVAL_SECS", 60u64)
                .map(Duration::from_secs)?,
        };

        if config.use_persistent_stores && config.database_url.is_none() {
            return Err(EngineConfigError::Missing("DATABASE_URL"));
        }
        if config.default_reservation_hours > MAX_RESERVATION_HOURS {
            return Err(EngineConfigError::Invalid {
                var: "DEFAULT_RESERVATION_HOURS",
                value: config.default_reservation_hours.to_string(),
            });
        }
        if config.run_max_delay < config.run_base_delay {
            return Err(EngineConfigError::Invalid {
                var: "RUN_MAX_DELAY_MS",
                value: config.run_max_delay.as_millis().to_string(),
            });
        }
        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.run_max_attempts, self.run_base_delay, self.run_max_delay)
    }

    pub fn executor_config(&self, index: usize) -> RunExecutorConfig {
        RunExecutorConfig::default()
            .with_name(format!("run-executor-{index}"))
            .with_poll_interval(self.executor_poll_interval)
            .with_lease(self.run_lease)
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, EngineConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
    G: Fn(&'static str) -> Option<String>,
{
    match get(var) {
        Some(v) => parse_positive(var, &v),
        None => Ok(default),
    }
}

fn parse_positive<T>(var: &'static str, value: &str) -> Result<T, EngineConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    match value.parse::<T>() {
        Ok(parsed) if parsed > T::default() => Ok(parsed),
        _ => Err(EngineConfigError::Invalid {
            var,
            value: value.to_string(),
        }),
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, EngineConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(EngineConfigError::Invalid {
            var,
            value: value.to_string(),
        }),
    }
}
