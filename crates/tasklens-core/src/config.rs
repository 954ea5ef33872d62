//! Engine configuration
//!
//! Loaded from YAML (`TASKLENS_CONFIG`) and then overridden field by field
//! from `TASKLENS_*` environment variables.

use crate::error::TasklensError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable naming a YAML config file.
pub const CONFIG_PATH_VAR: &str = "TASKLENS_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tasks occupying the scheduler longer than this are reported as slow
    pub slow_task_threshold_ms: u64,

    /// Probe delays above this are reported as lag anomalies
    pub lag_threshold_ms: u64,

    /// Timer delay of one probe; 0 means a bare scheduler yield
    pub lag_probe_interval_ms: u64,

    /// Wait for spawned descendants before summarizing a session
    pub await_descendants: bool,

    /// Upper bound on that wait
    pub drain_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slow_task_threshold_ms: 100,
            lag_threshold_ms: 100,
            lag_probe_interval_ms: 1,
            await_descendants: true,
            drain_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// Load from a YAML file
    pub fn load(path: &str) -> Result<Self, TasklensError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TasklensError::ConfigError(format!("failed to read {}: {}", path, e)))?;
        Self::from_yaml(&content)
    }

    /// Parse from a YAML string. Missing fields take their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, TasklensError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TasklensError::ConfigError(format!("invalid engine config: {}", e)))
    }

    /// Defaults, then the file named by `TASKLENS_CONFIG`, then env overrides.
    pub fn from_env() -> Result<Self, TasklensError> {
        let mut config = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::load(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies `TASKLENS_*` overrides read through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), TasklensError> {
        if let Some(v) = lookup("TASKLENS_SLOW_TASK_MS") {
            self.slow_task_threshold_ms = parse_var("TASKLENS_SLOW_TASK_MS", &v)?;
        }
        if let Some(v) = lookup("TASKLENS_LAG_THRESHOLD_MS") {
            self.lag_threshold_ms = parse_var("TASKLENS_LAG_THRESHOLD_MS", &v)?;
        }
        if let Some(v) = lookup("TASKLENS_LAG_PROBE_MS") {
            self.lag_probe_interval_ms = parse_var("TASKLENS_LAG_PROBE_MS", &v)?;
        }
        if let Some(v) = lookup("TASKLENS_AWAIT_DESCENDANTS") {
            self.await_descendants = parse_var("TASKLENS_AWAIT_DESCENDANTS", &v)?;
        }
        if let Some(v) = lookup("TASKLENS_DRAIN_TIMEOUT_MS") {
            self.drain_timeout_ms = parse_var("TASKLENS_DRAIN_TIMEOUT_MS", &v)?;
        }
        Ok(())
    }

    pub fn slow_task_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_task_threshold_ms)
    }

    pub fn lag_threshold(&self) -> Duration {
        Duration::from_millis(self.lag_threshold_ms)
    }

    pub fn lag_probe_interval(&self) -> Duration {
        Duration::from_millis(self.lag_probe_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Parses one environment value, naming the variable on failure.
pub fn parse_var<T>(name: &str, value: &str) -> Result<T, TasklensError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| TasklensError::ConfigError(format!("{}={:?}: {}", name, value, e)))
}
