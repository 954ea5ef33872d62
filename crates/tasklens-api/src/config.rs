//! Server and workload configuration, read from `TASKLENS_*` variables.
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tasklens_core::config::parse_var;
use tasklens_core::{EngineConfig, TasklensError};

pub const DEFAULT_ADDR: &str = "0.0.0.0:3000";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub engine: EngineConfig,
    pub workload: WorkloadConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, TasklensError> {
        let mut workload = WorkloadConfig::default();
        workload.apply_overrides(|name| std::env::var(name).ok())?;

        Ok(Self {
            addr: std::env::var("TASKLENS_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string()),
            engine: EngineConfig::from_env()?,
            workload,
        })
    }
}

/// Knobs of the synthetic request workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Busy-loop length run before the first await
    pub cpu_sync_iterations: u64,

    /// Busy-loop length of each spawned CPU step
    pub cpu_iterations: u64,

    /// Timer delay of each I/O step
    pub io_delay_ms: u64,

    /// Number of I/O steps; CPU steps run between them
    pub rounds: usize,

    /// How long `/slow` takes to answer
    pub slow_delay_ms: u64,

    /// Endpoint fetched at the end of the workload; `None` skips the call
    pub remote_url: Option<String>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            cpu_sync_iterations: 3_000_000_000,
            cpu_iterations: 1_000_000_000,
            io_delay_ms: 2_000,
            rounds: 3,
            slow_delay_ms: 10_000,
            remote_url: Some("http://127.0.0.1:3000/slow".to_string()),
        }
    }
}

impl WorkloadConfig {
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), TasklensError> {
        if let Some(v) = lookup("TASKLENS_CPU_SYNC_ITERATIONS") {
            self.cpu_sync_iterations = parse_var("TASKLENS_CPU_SYNC_ITERATIONS", &v)?;
        }
        if let Some(v) = lookup("TASKLENS_CPU_ITERATIONS") {
            self.cpu_iterations = parse_var("TASKLENS_CPU_ITERATIONS", &v)?;
        }
        if let Some(v) = lookup("TASKLENS_IO_DELAY_MS") {
            self.io_delay_ms = parse_var("TASKLENS_IO_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("TASKLENS_ROUNDS") {
            self.rounds = parse_var("TASKLENS_ROUNDS", &v)?;
        }
        if let Some(v) = lookup("TASKLENS_SLOW_DELAY_MS") {
            self.slow_delay_ms = parse_var("TASKLENS_SLOW_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("TASKLENS_REMOTE_URL") {
            let v = v.trim();
            self.remote_url = match v {
                "" | "off" | "none" => None,
                url => Some(url.to_string()),
            };
        }
        Ok(())
    }

    pub fn io_delay(&self) -> Duration {
        Duration::from_millis(self.io_delay_ms)
    }

    pub fn slow_delay(&self) -> Duration {
        Duration::from_millis(self.slow_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_can_be_disabled() {
        let mut config = WorkloadConfig::default();
        config
            .apply_overrides(|name| (name == "TASKLENS_REMOTE_URL").then(|| "off".to_string()))
            .unwrap();
        assert_eq!(config.remote_url, None);
    }

    #[test]
    fn test_numeric_overrides() {
        let mut config = WorkloadConfig::default();
        config
            .apply_overrides(|name| match name {
                "TASKLENS_IO_DELAY_MS" => Some("15".to_string()),
                "TASKLENS_ROUNDS" => Some("1".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.io_delay(), Duration::from_millis(15));
        assert_eq!(config.rounds, 1);
        assert_eq!(config.cpu_iterations, 1_000_000_000);
    }
}
