//! Context Store: request-scoped state shared by every descendant task
//!
//! A store becomes "current" on a thread for as long as a [`StoreGuard`] is
//! alive. Instrumented tasks capture the current store when they are created
//! and re-enter it around each poll, so anything they spawn inherits it too.
use crate::hook::HookGate;
use crate::lag::Generation;
use crate::registry::{RegistrySnapshot, TaskRegistry};
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Default)]
struct StoreState {
    trace: Vec<String>,
    registry: TaskRegistry,
}

#[derive(Debug)]
pub struct ContextStore {
    session_id: Uuid,
    origin: Instant,
    gate: Arc<HookGate>,
    generation: Generation,
    state: Mutex<StoreState>,
    live: AtomicUsize,
    idle: Notify,
}

impl ContextStore {
    pub fn new(origin: Instant, gate: Arc<HookGate>, generation: Generation) -> Arc<Self> {
        Arc::new(Self {
            session_id: Uuid::new_v4(),
            origin,
            gate,
            generation,
            state: Mutex::new(StoreState::default()),
            live: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// Time since the session origin. Task timestamps use this clock.
    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.origin)
    }

    /// Current lag sampler generation.
    pub fn generation(&self) -> u64 {
        self.generation.current()
    }

    pub(crate) fn gate(&self) -> &HookGate {
        &self.gate
    }

    pub fn push_trace(&self, line: impl Into<String>) {
        self.lock().trace.push(line.into());
    }

    pub fn trace(&self) -> Vec<String> {
        self.lock().trace.clone()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.lock().registry.snapshot()
    }

    pub fn task_count(&self) -> usize {
        self.lock().registry.len()
    }

    /// Appends `line` to the trace and applies `f` to the registry under one lock.
    pub(crate) fn record<R>(&self, line: String, f: impl FnOnce(&mut TaskRegistry) -> R) -> R {
        let mut state = self.lock();
        state.trace.push(line);
        f(&mut state.registry)
    }

    /// Number of instrumented tasks bound to this store that are still alive.
    pub fn live_tasks(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn task_opened(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn task_closed(&self) {
        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Resolves once no instrumented task bound to this store is alive.
    pub async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            if self.live_tasks() == 0 {
                return;
            }
            notified.await;
        }
    }

    // A panicking workload must not take the bookkeeping down with it
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

thread_local! {
    static CURRENT_STORE: RefCell<Option<Arc<ContextStore>>> = const { RefCell::new(None) };
}

/// Restores the previously current store on drop.
#[derive(Debug)]
pub struct StoreGuard {
    prev: Option<Arc<ContextStore>>,
}

impl Drop for StoreGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_STORE.with(|slot| {
            *slot.borrow_mut() = prev;
        });
    }
}

/// Returns the store active on this thread, if any.
pub fn current() -> Option<Arc<ContextStore>> {
    CURRENT_STORE.with(|slot| slot.borrow().clone())
}

/// Makes `store` current until the guard is dropped.
#[must_use]
pub fn enter(store: Option<Arc<ContextStore>>) -> StoreGuard {
    let prev = CURRENT_STORE.with(|slot| slot.replace(store));
    StoreGuard { prev }
}

/// Runs `body` synchronously with `store` current.
pub fn run<R>(store: Arc<ContextStore>, body: impl FnOnce() -> R) -> R {
    let _guard = enter(Some(store));
    body()
}

/// Appends a diagnostic line to the current store's trace. No-op outside a store.
pub fn note(line: impl Into<String>) {
    CURRENT_STORE.with(|slot| {
        if let Some(store) = slot.borrow().as_ref() {
            store.push_trace(line);
        }
    });
}

/// Polls `future` with `store` current.
pub fn scope<F: Future>(store: Arc<ContextStore>, future: F) -> Scoped<F> {
    Scoped {
        store,
        inner: Box::pin(future),
    }
}

#[derive(Debug)]
pub struct Scoped<F> {
    store: Arc<ContextStore>,
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for Scoped<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _guard = enter(Some(this.store.clone()));
        this.inner.as_mut().poll(cx)
    }
}
