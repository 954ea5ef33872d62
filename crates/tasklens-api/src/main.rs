//! Binary entrypoint for the Tasklens API server.
use anyhow::Context as _;
use tasklens_api::{build_runtime, config::ServerConfig, init_tracing, run};

fn main() -> anyhow::Result<()> {
    init_tracing();
    // Listen address can be overridden with TASKLENS_ADDR
    let config = ServerConfig::from_env()?;
    let runtime = build_runtime().context("failed to start runtime")?;
    runtime.block_on(run(config))
}
