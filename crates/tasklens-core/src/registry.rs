//! Task Registry: per-session records of every instrumented task
use crate::millis;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Identity of one instrumented unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    /// Stands in for "no enclosing task".
    pub const ROOT: TaskId = TaskId(0);

    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        TaskId(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduler resource type of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Root workload of a session
    Session,
    /// Spawned future
    Task,
    /// Timer
    Timeout,
    /// Deferred continuation
    Immediate,
    /// I/O or network wait
    Io,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Session => "Session",
            Self::Task => "Task",
            Self::Timeout => "Timeout",
            Self::Immediate => "Immediate",
            Self::Io => "Io",
        };
        f.write_str(name)
    }
}

/// One task observed during a session.
///
/// Timestamps are offsets from the session origin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub trigger_task_id: TaskId,
    pub kind: TaskKind,
    /// Call site that created the task, or `"<unknown>"`
    pub created_at: String,
    /// Lag sampler generation at the latest `before` event
    pub scheduler_generation: Option<u64>,
    #[serde(serialize_with = "millis::serialize_option")]
    pub before_at: Option<Duration>,
    #[serde(serialize_with = "millis::serialize_option")]
    pub after_at: Option<Duration>,
    /// Time spent polling nested instrumented tasks during the latest run
    #[serde(serialize_with = "millis::serialize")]
    pub nested: Duration,
    /// Latest `after - before - nested` interval. Overwritten on every
    /// completed pair.
    #[serde(serialize_with = "millis::serialize")]
    pub occupancy: Duration,
}

impl TaskRecord {
    pub fn new(
        task_id: TaskId,
        trigger_task_id: TaskId,
        kind: TaskKind,
        created_at: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            trigger_task_id,
            kind,
            created_at: created_at.into(),
            scheduler_generation: None,
            before_at: None,
            after_at: None,
            nested: Duration::ZERO,
            occupancy: Duration::ZERO,
        }
    }

    pub fn mark_before(&mut self, at: Duration, generation: u64) {
        self.before_at = Some(at);
        self.scheduler_generation = Some(generation);
    }

    pub fn mark_after(&mut self, at: Duration) {
        self.mark_after_excluding(at, Duration::ZERO);
    }

    /// Like [`mark_after`](Self::mark_after), minus the time spent in nested
    /// instrumented polls.
    pub fn mark_after_excluding(&mut self, at: Duration, nested: Duration) {
        self.after_at = Some(at);
        self.nested = nested;
        if let (Some(before), Some(after)) = (self.before_at, self.after_at) {
            self.occupancy = after.saturating_sub(before).saturating_sub(nested);
        }
    }
}

/// Identity-keyed task records of one session. Entries are never removed.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    records: HashMap<TaskId, TaskRecord>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a freshly created record, replacing any with the same id.
    pub fn insert(&mut self, record: TaskRecord) {
        self.records.insert(record.task_id, record);
    }

    /// Applies `mutator` to an existing record. Unknown ids are ignored.
    pub fn update(&mut self, task_id: TaskId, mutator: impl FnOnce(&mut TaskRecord)) -> bool {
        match self.records.get_mut(&task_id) {
            Some(record) => {
                mutator(record);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, task_id: TaskId) -> Option<&TaskRecord> {
        self.records.get(&task_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut records: Vec<Arc<TaskRecord>> =
            self.records.values().cloned().map(Arc::new).collect();
        records.sort_by_key(|r| r.task_id);
        RegistrySnapshot { records }
    }
}

/// Immutable copy of a registry, ordered by task id.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct RegistrySnapshot {
    records: Vec<Arc<TaskRecord>>,
}

impl RegistrySnapshot {
    pub fn records(&self) -> &[Arc<TaskRecord>] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TaskRecord>> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<TaskRecord> for RegistrySnapshot {
    fn from_iter<I: IntoIterator<Item = TaskRecord>>(iter: I) -> Self {
        let mut registry = TaskRegistry::new();
        for record in iter {
            registry.insert(record);
        }
        registry.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_new_record_has_no_occupancy() {
        let record = TaskRecord::new(TaskId::from_raw(7), TaskId::ROOT, TaskKind::Timeout, "<unknown>");
        assert_eq!(record.occupancy, Duration::ZERO);
        assert!(record.before_at.is_none());
        assert!(record.after_at.is_none());
        assert!(record.scheduler_generation.is_none());
    }

    #[test]
    fn test_repeated_runs_overwrite_occupancy() {
        let mut record = TaskRecord::new(TaskId::from_raw(1), TaskId::ROOT, TaskKind::Task, "a.rs:1:1");

        record.mark_before(ms(10), 3);
        record.mark_after(ms(50));
        assert_eq!(record.occupancy, ms(40));

        record.mark_before(ms(200), 4);
        // Mid-run, the previous interval still stands
        assert_eq!(record.occupancy, ms(40));
        record.mark_after(ms(290));

        assert_eq!(record.occupancy, ms(90));
        assert_eq!(record.scheduler_generation, Some(4));
    }

    #[test]
    fn test_after_without_before_keeps_zero() {
        let mut record = TaskRecord::new(TaskId::from_raw(1), TaskId::ROOT, TaskKind::Task, "a.rs:1:1");
        record.mark_after(ms(5));
        assert_eq!(record.occupancy, Duration::ZERO);
        assert_eq!(record.after_at, Some(ms(5)));
    }

    #[test]
    fn test_out_of_order_timestamps_never_go_negative() {
        let mut record = TaskRecord::new(TaskId::from_raw(1), TaskId::ROOT, TaskKind::Task, "a.rs:1:1");
        record.mark_before(ms(30), 1);
        record.mark_after(ms(20));
        assert_eq!(record.occupancy, Duration::ZERO);
    }

    #[test]
    fn test_nested_time_is_carved_out() {
        let mut record = TaskRecord::new(TaskId::from_raw(1), TaskId::ROOT, TaskKind::Session, "a.rs:1:1");
        record.mark_before(ms(0), 1);
        record.mark_after_excluding(ms(210), ms(200));
        assert_eq!(record.occupancy, ms(10));
        assert_eq!(record.nested, ms(200));

        // The next run starts from a clean slate
        record.mark_before(ms(300), 2);
        record.mark_after(ms(330));
        assert_eq!(record.occupancy, ms(30));
        assert_eq!(record.nested, Duration::ZERO);
    }

    #[test]
    fn test_update_ignores_unknown_ids() {
        let mut registry = TaskRegistry::new();
        let touched = registry.update(TaskId::from_raw(99), |r| r.mark_after(ms(1)));
        assert!(!touched);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_ordered_and_detached() {
        let mut registry = TaskRegistry::new();
        for id in [5, 2, 9] {
            registry.insert(TaskRecord::new(TaskId::from_raw(id), TaskId::ROOT, TaskKind::Task, "x"));
        }

        let snapshot = registry.snapshot();
        registry.update(TaskId::from_raw(2), |r| {
            r.mark_before(ms(0), 0);
            r.mark_after(ms(10));
        });

        let ids: Vec<u64> = snapshot.iter().map(|r| r.task_id.as_u64()).collect();
        assert_eq!(ids, vec![2, 5, 9]);
        assert_eq!(snapshot.records()[0].occupancy, Duration::ZERO);
        assert_eq!(registry.get(TaskId::from_raw(2)).unwrap().occupancy, ms(10));
    }

    #[test]
    fn test_record_serializes_millis() {
        let mut record = TaskRecord::new(TaskId::from_raw(3), TaskId::from_raw(1), TaskKind::Io, "w.rs:4:2");
        record.mark_before(ms(1), 8);
        record.mark_after(ms(3));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["task_id"], 3);
        assert_eq!(json["trigger_task_id"], 1);
        assert_eq!(json["kind"], "io");
        assert_eq!(json["occupancy"], 2.0);
        assert_eq!(json["scheduler_generation"], 8);
    }
}
