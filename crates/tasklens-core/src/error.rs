//! Unified Error Model
//!
//! Only two things can fail visibly: loading configuration, and the workload
//! a session runs. Bookkeeping inside the hook never produces an error.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TasklensError {
    #[error("CONFIG/{0}")]
    ConfigError(String),

    #[error("SERIALIZE/{0}")]
    SerializeError(String),
}

/// Failure of the instrumented workload, surfaced to the session driver.
#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error("WORKLOAD/FAILED: {0:#}")]
    Failed(anyhow::Error),

    #[error("WORKLOAD/PANIC: {0}")]
    Panicked(String),

    #[error("WORKLOAD/ABORTED")]
    Aborted,
}

impl From<serde_json::Error> for TasklensError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializeError(err.to_string())
    }
}
