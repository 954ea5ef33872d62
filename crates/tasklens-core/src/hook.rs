//! Lifecycle Hook: observes every instrumented unit of work
//!
//! [`Instrumented`] is the one place where tasks are intercepted. Creating it
//! fires `created`; every poll is bracketed by `before`/`after`; the poll that
//! returns `Ready` also fires `settled`. Events go to the store that was
//! current when the task was created, and only while the store's
//! [`HookGate`] is engaged.
use crate::context::{self, ContextStore};
use crate::registry::{TaskId, TaskKind, TaskRecord};
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// `created_at` of tasks whose call site cannot be attributed.
pub const UNKNOWN_CALL_SITE: &str = "<unknown>";

/// Counts sessions with live instrumentation. Events are dropped while zero.
#[derive(Debug, Default)]
pub struct HookGate {
    engaged: AtomicUsize,
}

impl HookGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engage(self: &Arc<Self>) -> Engagement {
        if self.engaged.fetch_add(1, Ordering::AcqRel) == 0 {
            tracing::debug!("lifecycle hook engaged");
        }
        Engagement {
            gate: Arc::clone(self),
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engagements() > 0
    }

    pub fn engagements(&self) -> usize {
        self.engaged.load(Ordering::Acquire)
    }
}

/// Keeps the gate engaged until dropped.
#[derive(Debug)]
pub struct Engagement {
    gate: Arc<HookGate>,
}

impl Drop for Engagement {
    fn drop(&mut self) {
        if self.gate.engaged.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::debug!("lifecycle hook disengaged");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Created {
        kind: TaskKind,
        trigger: TaskId,
        created_at: String,
    },
    BeforeRun,
    /// `nested` is the time this poll spent inside nested instrumented polls
    AfterRun {
        nested: Duration,
    },
    Settled,
}

/// Applies one lifecycle event to `store`: a trace line always, a registry
/// change when the task has a record.
pub fn dispatch(store: &ContextStore, task_id: TaskId, event: LifecycleEvent) {
    if !store.gate().is_engaged() {
        return;
    }
    tracing::trace!(session = %store.session_id(), task = %task_id, ?event, "lifecycle event");

    match event {
        LifecycleEvent::Created {
            kind,
            trigger,
            created_at,
        } => {
            let line = format!("init: {} / {} / {} / {}", task_id, kind, trigger, created_at);
            store.record(line, |registry| {
                registry.insert(TaskRecord::new(task_id, trigger, kind, created_at))
            });
        }
        LifecycleEvent::BeforeRun => {
            let at = store.elapsed();
            let generation = store.generation();
            store.record(format!("before: {}", task_id), |registry| {
                registry.update(task_id, |record| record.mark_before(at, generation))
            });
        }
        LifecycleEvent::AfterRun { nested } => {
            let at = store.elapsed();
            store.record(format!("after: {}", task_id), |registry| {
                registry.update(task_id, |record| record.mark_after_excluding(at, nested))
            });
        }
        LifecycleEvent::Settled => store.push_trace(format!("settled: {}", task_id)),
    }
}

thread_local! {
    static CURRENT_TASK: Cell<Option<(TaskId, TaskId)>> = const { Cell::new(None) };
}

struct TaskGuard {
    prev: Option<(TaskId, TaskId)>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        CURRENT_TASK.with(|slot| slot.set(self.prev));
    }
}

fn enter_task(task_id: TaskId, trigger: TaskId) -> TaskGuard {
    let prev = CURRENT_TASK.with(|slot| slot.replace(Some((task_id, trigger))));
    TaskGuard { prev }
}

thread_local! {
    // Time spent in completed nested polls of the frame being polled; `None`
    // outside any instrumented poll
    static NESTED_TIME: Cell<Option<Duration>> = const { Cell::new(None) };
}

/// One instrumented poll. On drop its whole span is charged to the enclosing
/// frame, if any.
struct PollFrame {
    outer: Option<Duration>,
    started: Instant,
}

impl PollFrame {
    fn enter() -> Self {
        let outer = NESTED_TIME.with(|slot| slot.replace(Some(Duration::ZERO)));
        Self {
            outer,
            started: Instant::now(),
        }
    }

    fn nested(&self) -> Duration {
        NESTED_TIME.with(|slot| slot.get()).unwrap_or_default()
    }
}

impl Drop for PollFrame {
    fn drop(&mut self) {
        let span = self.started.elapsed();
        NESTED_TIME.with(|slot| slot.set(self.outer.map(|outer| outer + span)));
    }
}

/// Id of the instrumented task being polled on this thread, or [`TaskId::ROOT`].
pub fn current_task_id() -> TaskId {
    CURRENT_TASK.with(|slot| slot.get()).map_or(TaskId::ROOT, |(id, _)| id)
}

/// Id of the task that created the one being polled, or [`TaskId::ROOT`].
pub fn trigger_task_id() -> TaskId {
    CURRENT_TASK.with(|slot| slot.get()).map_or(TaskId::ROOT, |(_, trigger)| trigger)
}

// Frames inside this module say nothing about the workload
fn attribute(location: &Location<'_>) -> String {
    if location.file() == file!() {
        UNKNOWN_CALL_SITE.to_string()
    } else {
        location.to_string()
    }
}

/// A future whose lifecycle is reported to the store it was created under.
pub struct Instrumented<F> {
    inner: Pin<Box<F>>,
    task_id: TaskId,
    trigger: TaskId,
    kind: TaskKind,
    store: Option<Arc<ContextStore>>,
}

impl<F: Future> Instrumented<F> {
    #[track_caller]
    pub fn new(kind: TaskKind, future: F) -> Self {
        Self::with_location(kind, future, Location::caller())
    }

    pub(crate) fn with_location(kind: TaskKind, future: F, location: &'static Location<'static>) -> Self {
        let task_id = TaskId::next();
        let trigger = current_task_id();
        let store = context::current();
        if let Some(store) = &store {
            store.task_opened();
            dispatch(
                store,
                task_id,
                LifecycleEvent::Created {
                    kind,
                    trigger,
                    created_at: attribute(location),
                },
            );
        }

        Self {
            inner: Box::pin(future),
            task_id,
            trigger,
            kind,
            store,
        }
    }
}

impl<F> Instrumented<F> {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn trigger_task_id(&self) -> TaskId {
        self.trigger
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    fn emit(&self, event: LifecycleEvent) {
        if let Some(store) = &self.store {
            dispatch(store, self.task_id, event);
        }
    }
}

impl<F: Future> Future for Instrumented<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _store = context::enter(this.store.clone());
        let _task = enter_task(this.task_id, this.trigger);
        let frame = PollFrame::enter();

        this.emit(LifecycleEvent::BeforeRun);
        let poll = this.inner.as_mut().poll(cx);
        this.emit(LifecycleEvent::AfterRun {
            nested: frame.nested(),
        });
        if poll.is_ready() {
            this.emit(LifecycleEvent::Settled);
        }
        poll
    }
}

impl<F> Drop for Instrumented<F> {
    fn drop(&mut self) {
        if let Some(store) = &self.store {
            store.task_closed();
        }
    }
}

impl<F> fmt::Debug for Instrumented<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrumented")
            .field("task_id", &self.task_id)
            .field("trigger", &self.trigger)
            .field("kind", &self.kind)
            .field("session", &self.store.as_ref().map(|s| s.session_id()))
            .finish()
    }
}

/// Wraps `future` as a task of the given kind, awaited in place.
#[track_caller]
pub fn instrument<F: Future>(kind: TaskKind, future: F) -> Instrumented<F> {
    Instrumented::with_location(kind, future, Location::caller())
}

/// Spawns `future` on the tokio runtime as an instrumented task.
#[track_caller]
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(Instrumented::with_location(TaskKind::Task, future, Location::caller()))
}

/// Runs `callback` once `delay` has passed.
#[track_caller]
pub fn set_timeout<C>(delay: Duration, callback: C) -> JoinHandle<()>
where
    C: FnOnce() + Send + 'static,
{
    let timer = async move {
        tokio::time::sleep(delay).await;
        callback()
    };
    tokio::spawn(Instrumented::with_location(TaskKind::Timeout, timer, Location::caller()))
}

/// Runs `callback` after one trip through the scheduler.
#[track_caller]
pub fn set_immediate<C>(callback: C) -> JoinHandle<()>
where
    C: FnOnce() + Send + 'static,
{
    let deferred = async move {
        tokio::task::yield_now().await;
        callback()
    };
    tokio::spawn(Instrumented::with_location(TaskKind::Immediate, deferred, Location::caller()))
}

/// An instrumented timer to await in place.
#[track_caller]
pub fn sleep(duration: Duration) -> Instrumented<tokio::time::Sleep> {
    Instrumented::with_location(TaskKind::Timeout, tokio::time::sleep(duration), Location::caller())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lag::Generation;

    fn engaged_store() -> (Arc<ContextStore>, Engagement) {
        let gate = Arc::new(HookGate::new());
        let engagement = gate.engage();
        (ContextStore::new(Instant::now(), gate, Generation::new()), engagement)
    }

    #[tokio::test]
    async fn test_event_without_store_is_noop() {
        let (bystander, _engagement) = engaged_store();

        let task = Instrumented::new(TaskKind::Task, async { 7 });
        assert_eq!(task.await, 7);

        assert!(bystander.snapshot().is_empty());
        assert!(bystander.trace().is_empty());
    }

    #[tokio::test]
    async fn test_disengaged_gate_records_nothing() {
        let store = ContextStore::new(Instant::now(), Arc::new(HookGate::new()), Generation::new());

        let value = context::scope(store.clone(), async { spawn(async { 1 }).await.unwrap() }).await;

        assert_eq!(value, 1);
        assert!(store.snapshot().is_empty());
        assert!(store.trace().is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_lines_in_order() {
        let (store, _engagement) = engaged_store();

        let task = context::run(store.clone(), || instrument(TaskKind::Io, async {}));
        let id = task.task_id();
        task.await;

        assert_eq!(
            store.trace(),
            vec![
                format!("init: {} / Io / 0 / {}", id, UNKNOWN_CALL_SITE),
                format!("before: {}", id),
                format!("after: {}", id),
                format!("settled: {}", id),
            ]
        );
    }

    #[tokio::test]
    async fn test_spawned_descendants_inherit_store() {
        let (store, _engagement) = engaged_store();

        let (parent, child) = context::scope(store.clone(), async {
            spawn(async {
                let parent = current_task_id();
                let child = spawn(async { current_task_id() }).await.unwrap();
                (parent, child)
            })
            .await
            .unwrap()
        })
        .await;

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        let child_record = snapshot.iter().find(|r| r.task_id == child).unwrap();
        assert_eq!(child_record.trigger_task_id, parent);
        let parent_record = snapshot.iter().find(|r| r.task_id == parent).unwrap();
        assert_eq!(parent_record.trigger_task_id, TaskId::ROOT);
        assert!(snapshot.iter().all(|r| r.before_at.is_some() && r.after_at.is_some()));
    }

    #[tokio::test]
    async fn test_timeout_occupancy_is_callback_run() {
        let (store, _engagement) = engaged_store();

        let handle = context::run(store.clone(), || {
            set_timeout(Duration::from_millis(5), || {
                std::thread::sleep(Duration::from_millis(30));
            })
        });
        handle.await.unwrap();

        let snapshot = store.snapshot();
        let record = &snapshot.records()[0];
        assert_eq!(record.kind, TaskKind::Timeout);
        assert!(record.occupancy >= Duration::from_millis(30));
        assert_eq!(record.occupancy, record.after_at.unwrap() - record.before_at.unwrap());
    }

    #[tokio::test]
    async fn test_second_run_overwrites_first() {
        let (store, _engagement) = engaged_store();

        let task = context::run(store.clone(), || {
            instrument(TaskKind::Task, async {
                std::thread::sleep(Duration::from_millis(60));
                tokio::task::yield_now().await;
                std::thread::sleep(Duration::from_millis(90));
            })
        });
        let id = task.task_id();
        task.await;

        let snapshot = store.snapshot();
        let record = &snapshot.records()[0];
        assert!(record.occupancy >= Duration::from_millis(90));
        assert!(record.occupancy < Duration::from_millis(150));
        let befores = store.trace().iter().filter(|l| **l == format!("before: {}", id)).count();
        assert_eq!(befores, 2);
    }

    #[tokio::test]
    async fn test_nested_poll_time_is_not_counted_twice() {
        let (store, _engagement) = engaged_store();

        let outer = context::run(store.clone(), || {
            instrument(TaskKind::Session, async {
                instrument(TaskKind::Task, async {
                    std::thread::sleep(Duration::from_millis(200));
                })
                .await
            })
        });
        let outer_id = outer.task_id();
        outer.await;

        let snapshot = store.snapshot();
        let outer_record = snapshot.iter().find(|r| r.task_id == outer_id).unwrap();
        let inner_record = snapshot.iter().find(|r| r.task_id != outer_id).unwrap();

        assert!(inner_record.occupancy >= Duration::from_millis(200));
        assert!(outer_record.nested >= inner_record.occupancy);
        assert!(outer_record.occupancy < Duration::from_millis(100));
        let (before, after) = (outer_record.before_at.unwrap(), outer_record.after_at.unwrap());
        assert!(outer_record.occupancy + inner_record.occupancy <= after - before);
    }

    #[test]
    fn test_nested_time_resets_between_polls() {
        assert_eq!(NESTED_TIME.with(|slot| slot.get()), None);
        {
            let outer = PollFrame::enter();
            {
                let _inner = PollFrame::enter();
                std::thread::sleep(Duration::from_millis(5));
            }
            assert!(outer.nested() >= Duration::from_millis(5));
        }
        assert_eq!(NESTED_TIME.with(|slot| slot.get()), None);
    }

    #[tokio::test]
    async fn test_immediate_and_current_ids() {
        let (store, _engagement) = engaged_store();
        let (tx, rx) = tokio::sync::oneshot::channel();

        context::run(store.clone(), || {
            set_immediate(move || {
                let _ = tx.send((current_task_id(), trigger_task_id()));
            })
        })
        .await
        .unwrap();

        let (id, trigger) = rx.await.unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.records()[0].task_id, id);
        assert_eq!(snapshot.records()[0].kind, TaskKind::Immediate);
        assert_eq!(trigger, TaskId::ROOT);
        assert_eq!(current_task_id(), TaskId::ROOT);
    }

    #[tokio::test]
    async fn test_live_count_tracks_drop() {
        let (store, _engagement) = engaged_store();

        let pending = context::run(store.clone(), || sleep(Duration::from_secs(60)));
        assert_eq!(store.live_tasks(), 1);
        drop(pending);
        assert_eq!(store.live_tasks(), 0);
        // Dropped before its first poll: created, never run
        assert_eq!(store.snapshot().records()[0].occupancy, Duration::ZERO);
    }

    #[test]
    fn test_gate_counts_engagements() {
        let gate = Arc::new(HookGate::new());
        assert!(!gate.is_engaged());
        let a = gate.engage();
        let b = gate.engage();
        drop(a);
        assert!(gate.is_engaged());
        drop(b);
        assert!(!gate.is_engaged());
    }
}
