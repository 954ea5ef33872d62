//! Stats Aggregator: folds a registry snapshot into a session summary
use crate::millis;
use crate::registry::{RegistrySnapshot, TaskRecord};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Summary of one session. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSummary {
    #[serde(serialize_with = "millis::serialize")]
    pub request_duration: Duration,
    /// Sum of occupancy over tasks that occupied the scheduler at all
    #[serde(serialize_with = "millis::serialize")]
    pub occupied_duration: Duration,
    pub occupancy_ratio: f64,
    /// `None` when no task was measured
    #[serde(serialize_with = "millis::serialize_option")]
    pub min_occupancy: Option<Duration>,
    #[serde(serialize_with = "millis::serialize")]
    pub max_occupancy: Duration,
    pub start_generation: u64,
    pub end_generation: u64,
    pub task_count: usize,
    pub measured_count: usize,
    /// Records over the slow threshold, longest first
    pub slow_tasks: Vec<Arc<TaskRecord>>,
}

#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    slow_threshold: Duration,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl Aggregator {
    pub fn new(slow_threshold: Duration) -> Self {
        Self { slow_threshold }
    }

    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }

    pub fn aggregate(
        &self,
        snapshot: &RegistrySnapshot,
        request_start: Instant,
        request_end: Instant,
        start_generation: u64,
        end_generation: u64,
    ) -> StatsSummary {
        let request_duration = request_end.saturating_duration_since(request_start);

        let mut min_occupancy: Option<Duration> = None;
        let mut max_occupancy = Duration::ZERO;
        let mut occupied_duration = Duration::ZERO;
        let mut measured_count = 0;
        let mut slow_tasks = Vec::new();

        for record in snapshot.iter().filter(|r| !r.occupancy.is_zero()) {
            let occupancy = record.occupancy;
            min_occupancy = Some(min_occupancy.map_or(occupancy, |m| m.min(occupancy)));
            max_occupancy = max_occupancy.max(occupancy);
            occupied_duration += occupancy;
            measured_count += 1;
            if occupancy > self.slow_threshold {
                slow_tasks.push(Arc::clone(record));
            }
        }
        slow_tasks.sort_by(|a, b| b.occupancy.cmp(&a.occupancy));

        StatsSummary {
            request_duration,
            occupied_duration,
            occupancy_ratio: ratio(occupied_duration, request_duration),
            min_occupancy,
            max_occupancy,
            start_generation,
            end_generation,
            task_count: snapshot.len(),
            measured_count,
            slow_tasks,
        }
    }
}

fn ratio(part: Duration, whole: Duration) -> f64 {
    if whole.is_zero() {
        0.0
    } else {
        part.as_nanos() as f64 / whole.as_nanos() as f64
    }
}
