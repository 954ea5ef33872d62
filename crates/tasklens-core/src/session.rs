//! Session: opens a store, runs a workload in it and summarizes the result
use crate::config::EngineConfig;
use crate::context::{self, ContextStore};
use crate::error::WorkloadError;
use crate::hook::{Engagement, HookGate, Instrumented};
use crate::lag::Generation;
use crate::registry::TaskKind;
use crate::report::SessionReport;
use crate::stats::{Aggregator, StatsSummary};
use chrono::{DateTime, Utc};
use std::any::Any;
use std::future::Future;
use std::panic::Location;
use std::sync::Arc;
use std::time::Instant;

/// Process-wide instrumentation state shared by all concurrent sessions.
#[derive(Debug, Clone)]
pub struct Engine {
    config: EngineConfig,
    gate: Arc<HookGate>,
    generation: Generation,
}

impl Engine {
    /// `generation` is the lag sampler's counter, read when tasks run.
    pub fn new(config: EngineConfig, generation: Generation) -> Self {
        Self {
            config,
            gate: Arc::new(HookGate::new()),
            generation,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn gate(&self) -> &Arc<HookGate> {
        &self.gate
    }

    pub fn open_session(&self) -> Session {
        self.open_session_at(Instant::now())
    }

    /// Starts a session whose clock begins at `start`.
    pub fn open_session_at(&self, start: Instant) -> Session {
        let engagement = self.gate.engage();
        let store = ContextStore::new(start, Arc::clone(&self.gate), self.generation.clone());
        let start_generation = self.generation.current();
        tracing::debug!(session = %store.session_id(), start_generation, "session opened");

        Session {
            store,
            start,
            started_at: Utc::now(),
            start_generation,
            aggregator: Aggregator::new(self.config.slow_task_threshold()),
            config: self.config.clone(),
            _engagement: engagement,
        }
    }

    /// Opens a session, runs `workload` in it and finishes it.
    #[track_caller]
    pub fn run<F, T>(&self, workload: F) -> impl Future<Output = SessionReport<T>> + Send + 'static
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let session = self.open_session();
        let running = session.run(workload);
        async move {
            let outcome = running.await;
            session.finish(outcome).await
        }
    }
}

/// One instrumented request. Keeps the hook engaged until finished.
#[derive(Debug)]
pub struct Session {
    store: Arc<ContextStore>,
    start: Instant,
    started_at: DateTime<Utc>,
    start_generation: u64,
    aggregator: Aggregator,
    config: EngineConfig,
    _engagement: Engagement,
}

impl Session {
    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn start_generation(&self) -> u64 {
        self.start_generation
    }

    /// Spawns `workload` as the session's root task. The returned future
    /// resolves with its outcome; the workload runs whether or not it is polled.
    #[track_caller]
    pub fn run<F, T>(&self, workload: F) -> impl Future<Output = Result<T, WorkloadError>> + Send + 'static
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let location = Location::caller();
        let root = {
            let _guard = context::enter(Some(Arc::clone(&self.store)));
            Instrumented::with_location(TaskKind::Session, workload, location)
        };
        let handle = tokio::spawn(root);

        async move {
            match handle.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(WorkloadError::Failed(err)),
                Err(join) if join.is_panic() => Err(WorkloadError::Panicked(panic_message(join.into_panic()))),
                Err(_) => Err(WorkloadError::Aborted),
            }
        }
    }

    /// Summarizes the registry as of now, with caller-supplied end markers.
    pub fn summarize(&self, end: Instant, start_generation: u64, end_generation: u64) -> StatsSummary {
        self.aggregator
            .aggregate(&self.store.snapshot(), self.start, end, start_generation, end_generation)
    }

    /// Waits for descendants if configured, then produces the report and
    /// releases the hook engagement.
    pub async fn finish<T>(self, outcome: Result<T, WorkloadError>) -> SessionReport<T> {
        let session_id = self.store.session_id();

        if self.config.await_descendants && self.store.live_tasks() > 0 {
            let drained = tokio::time::timeout(self.config.drain_timeout(), self.store.drained()).await;
            if drained.is_err() {
                tracing::warn!(
                    session = %session_id,
                    live = self.store.live_tasks(),
                    "descendant tasks still running at drain timeout"
                );
            }
        }

        let end = Instant::now();
        let end_generation = self.store.generation();
        let tasks = self.store.snapshot();
        let summary = self
            .aggregator
            .aggregate(&tasks, self.start, end, self.start_generation, end_generation);

        if let Err(err) = &outcome {
            tracing::warn!(session = %session_id, error = %err, "workload failed");
        }

        SessionReport {
            session_id,
            started_at: self.started_at,
            summary,
            trace: self.store.trace(),
            tasks,
            outcome,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
