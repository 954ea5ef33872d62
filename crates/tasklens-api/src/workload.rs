//! Synthetic request workload: busy loops, timer waits and a remote call.
//!
//! Every step writes its own lines to the session trace so the hook's
//! lifecycle lines can be read against what the workload was doing.
use crate::config::WorkloadConfig;
use std::hint::black_box;
use std::time::Instant;
use tasklens_core::{context, hook, TaskKind};

/// The chain run for every instrumented request.
pub async fn request_pipeline(config: WorkloadConfig, client: reqwest::Client) -> anyhow::Result<()> {
    context::note(format!(
        "request_pipeline: {} / {}",
        hook::current_task_id(),
        hook::trigger_task_id()
    ));

    let iterations = config.cpu_sync_iterations;
    hook::spawn(async move { cpu_task_sync(iterations) }).await?;

    for round in 0..config.rounds {
        if round > 0 {
            hook::spawn(cpu_task(config.cpu_iterations)).await?;
        }
        io_task(&config).await;
    }

    if let Some(url) = &config.remote_url {
        let body = slow_request(&client, url).await?;
        context::note(format!("slow_request: {} bytes", body.len()));
    }
    Ok(())
}

pub fn cpu_task_sync(iterations: u64) -> u64 {
    context::note(format!(
        "cpu_task_sync: {} / {}",
        hook::current_task_id(),
        hook::trigger_task_id()
    ));
    let start = Instant::now();
    let sum = spin(iterations);
    context::note(format!("{:.3}", start.elapsed().as_secs_f64() * 1000.0));
    sum
}

pub async fn cpu_task(iterations: u64) -> u64 {
    context::note(format!("cpu_task: {} / {}", hook::current_task_id(), hook::trigger_task_id()));
    let start = Instant::now();
    let sum = spin(iterations);
    context::note(format!("{:.3}", start.elapsed().as_secs_f64() * 1000.0));
    sum
}

pub async fn io_task(config: &WorkloadConfig) {
    context::note(format!("io_task: {} / {}", hook::current_task_id(), hook::trigger_task_id()));
    let start = Instant::now();
    hook::sleep(config.io_delay()).await;
    context::note(format!("{:.3}", start.elapsed().as_secs_f64() * 1000.0));
}

/// GETs `url`, with the request and the body read each recorded as I/O.
pub async fn slow_request(client: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    context::note(format!("slow_request: {} / {}", hook::current_task_id(), hook::trigger_task_id()));
    let response = hook::instrument(TaskKind::Io, client.get(url).send())
        .await?
        .error_for_status()?;
    let body = hook::instrument(TaskKind::Io, response.text()).await?;
    Ok(body)
}

fn spin(iterations: u64) -> u64 {
    let mut sum = 0u64;
    for _ in 0..iterations {
        sum = black_box(sum.wrapping_add(1));
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spin_counts_iterations() {
        assert_eq!(spin(1_000), 1_000);
        assert_eq!(cpu_task_sync(10), 10);
    }

    #[tokio::test]
    async fn test_pipeline_without_session_or_remote() {
        let config = WorkloadConfig {
            cpu_sync_iterations: 100,
            cpu_iterations: 100,
            io_delay_ms: 1,
            rounds: 2,
            slow_delay_ms: 1,
            remote_url: None,
        };
        request_pipeline(config, reqwest::Client::new()).await.unwrap();
    }
}
