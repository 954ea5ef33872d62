//! Tasklens Core: request-scoped async task instrumentation
//!
//! A [`Session`] opens a [`ContextStore`] for one request. Every task the
//! workload creates through [`hook`] (spawns, timers, deferred callbacks,
//! awaited I/O) is recorded in that store's registry with its scheduler
//! occupancy, and the finished session is folded into a [`StatsSummary`].
//! The [`LagSampler`] runs beside all sessions and reports scheduler stalls.
//!
//! # Example
//!
//! ```ignore
//! use tasklens_core::{hook, Engine, EngineConfig, Generation};
//!
//! let engine = Engine::new(EngineConfig::default(), Generation::new());
//! let report = engine
//!     .run(async {
//!         hook::sleep(std::time::Duration::from_millis(10)).await;
//!         Ok(())
//!     })
//!     .await;
//! println!("ratio: {}", report.summary.occupancy_ratio);
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod hook;
pub mod lag;
mod millis;
pub mod registry;
pub mod report;
pub mod session;
pub mod stats;

pub use config::EngineConfig;
pub use context::ContextStore;
pub use error::{TasklensError, WorkloadError};
pub use hook::{HookGate, Instrumented, LifecycleEvent};
pub use lag::{AnomalySink, Generation, LagAnomaly, LagSampler, LogSink};
pub use registry::{RegistrySnapshot, TaskId, TaskKind, TaskRecord, TaskRegistry};
pub use report::SessionReport;
pub use session::{Engine, Session};
pub use stats::{Aggregator, StatsSummary};

/// Engine version
pub const TASKLENS_VERSION: &str = env!("CARGO_PKG_VERSION");
