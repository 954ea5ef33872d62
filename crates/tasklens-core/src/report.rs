//! Session Report: everything a finished session hands back to its driver
use crate::error::{TasklensError, WorkloadError};
use crate::registry::RegistrySnapshot;
use crate::stats::StatsSummary;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug)]
pub struct SessionReport<T> {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub summary: StatsSummary,
    /// Trace lines in the order they were recorded
    pub trace: Vec<String>,
    /// The snapshot `summary` was computed from
    pub tasks: RegistrySnapshot,
    pub outcome: Result<T, WorkloadError>,
}

impl<T> SessionReport<T> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn summary_json(&self) -> Result<String, TasklensError> {
        Ok(serde_json::to_string_pretty(&self.summary)?)
    }

    pub fn tasks_json(&self) -> Result<Vec<String>, TasklensError> {
        self.tasks
            .iter()
            .map(|task| serde_json::to_string(task.as_ref()).map_err(TasklensError::from))
            .collect()
    }

    /// Writes the trace, one JSON line per task and the summary to the log.
    pub fn emit(&self) {
        let session = self.session_id;
        for line in &self.trace {
            tracing::debug!(target: "tasklens::trace", %session, "{}", line);
        }

        match self.tasks_json() {
            Ok(lines) => {
                for line in lines {
                    tracing::debug!(target: "tasklens::tasks", %session, "{}", line);
                }
            }
            Err(err) => tracing::warn!(%session, error = %err, "task records not serializable"),
        }

        match self.summary_json() {
            Ok(json) => tracing::debug!(target: "tasklens::stats", %session, "{}", json),
            Err(err) => tracing::warn!(%session, error = %err, "summary not serializable"),
        }

        tracing::info!(
            %session,
            started_at = %self.started_at.to_rfc3339(),
            request_ms = self.summary.request_duration.as_secs_f64() * 1000.0,
            occupancy_ratio = self.summary.occupancy_ratio,
            tasks = self.summary.task_count,
            slow_tasks = self.summary.slow_tasks.len(),
            ok = self.is_success(),
            "session complete"
        );
    }

    /// Splits off the summary and the workload outcome.
    pub fn into_parts(self) -> (StatsSummary, Result<T, WorkloadError>) {
        (self.summary, self.outcome)
    }
}
