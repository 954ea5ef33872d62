//! Tasklens API: HTTP front end that runs instrumented request sessions
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod workload;

use anyhow::Context as _;
use axum::{routing::get, Router};
use std::sync::Arc;
use tasklens_core::{Engine, Generation, LagSampler};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::{ServerConfig, WorkloadConfig};
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub metrics: Arc<Metrics>,
    pub workload: Arc<WorkloadConfig>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(engine: Engine, metrics: Arc<Metrics>, workload: WorkloadConfig) -> Self {
        Self {
            engine,
            metrics,
            workload: Arc::new(workload),
            http: reqwest::Client::new(),
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::instrumented))
        .route("/slow", get(handlers::slow))
        .route("/test", get(handlers::proxy_slow))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .layer(axum::middleware::from_fn(middleware::request_logging))
        .layer(middleware::cors())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Installs the fmt subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Single-threaded runtime the server runs on: task bodies never run in parallel.
pub fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

/// Starts the lag sampler and serves until the listener fails.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new()?);
    let generation = Generation::new();
    let sampler = LagSampler::start(generation.clone(), &config.engine, metrics.anomaly_sink());

    let engine = Engine::new(config.engine.clone(), generation);
    let app = create_app(AppState::new(engine, metrics, config.workload.clone()));

    let listener = tokio::net::TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;

    tracing::info!("Tasklens API listening on {}", config.addr);
    let served = axum::serve(listener, app).await;

    sampler.shutdown();
    served.context("server error")
}
