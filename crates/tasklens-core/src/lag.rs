//! Lag Sampler: free-running scheduler responsiveness probe
//!
//! Each probe bumps the generation, yields back to the scheduler and measures
//! how long it took to get control back. Probes slower than the threshold are
//! reported to an [`AnomalySink`]. Sessions read the generation to correlate
//! their tasks with independently logged lag events.

use crate::config::EngineConfig;
use crate::millis;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Shared handle to the sampler's monotonic generation counter.
#[derive(Debug, Clone, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// A probe that took longer than the lag threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LagAnomaly {
    pub generation: u64,
    #[serde(serialize_with = "millis::serialize")]
    pub elapsed: Duration,
}

impl LagAnomaly {
    pub fn elapsed_ms(&self) -> f64 {
        millis::as_millis(&self.elapsed)
    }
}

/// Destination of lag anomalies.
pub trait AnomalySink: Send + Sync + 'static {
    fn report(&self, anomaly: LagAnomaly);
}

/// Writes each anomaly as an error-level log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl AnomalySink for LogSink {
    fn report(&self, anomaly: LagAnomaly) {
        tracing::error!(
            generation = anomaly.generation,
            elapsed_ms = anomaly.elapsed_ms(),
            "[LAG] {}: {:.3}ms",
            anomaly.generation,
            anomaly.elapsed_ms()
        );
    }
}

impl AnomalySink for UnboundedSender<LagAnomaly> {
    fn report(&self, anomaly: LagAnomaly) {
        if self.send(anomaly).is_err() {
            tracing::trace!(generation = anomaly.generation, "anomaly receiver dropped");
        }
    }
}

impl<S: AnomalySink> AnomalySink for Arc<S> {
    fn report(&self, anomaly: LagAnomaly) {
        (**self).report(anomaly)
    }
}

/// Running probe loop. Aborted on [`LagSampler::shutdown`] or drop.
#[derive(Debug)]
pub struct LagSampler {
    generation: Generation,
    handle: JoinHandle<()>,
}

impl LagSampler {
    /// Spawns the probe loop on the current tokio runtime.
    pub fn start(generation: Generation, config: &EngineConfig, sink: impl AnomalySink) -> Self {
        let threshold = config.lag_threshold();
        let interval = config.lag_probe_interval();
        tracing::debug!(
            threshold_ms = config.lag_threshold_ms,
            interval_ms = config.lag_probe_interval_ms,
            "lag sampler started"
        );
        let handle = tokio::spawn(probe_loop(generation.clone(), threshold, interval, sink));
        Self { generation, handle }
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn shutdown(self) {
        self.handle.abort();
        tracing::debug!(generation = self.generation.current(), "lag sampler stopped");
    }
}

impl Drop for LagSampler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn probe_loop(
    generation: Generation,
    threshold: Duration,
    interval: Duration,
    sink: impl AnomalySink,
) {
    loop {
        let current = generation.advance();
        let start = Instant::now();
        if interval.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(interval).await;
        }
        let elapsed = start.elapsed();
        if elapsed > threshold {
            sink.report(LagAnomaly {
                generation: current,
                elapsed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn config(threshold_ms: u64) -> EngineConfig {
        EngineConfig {
            lag_threshold_ms: threshold_ms,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_generation_advances_while_running() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sampler = LagSampler::start(Generation::new(), &config(100), tx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let first = sampler.generation().current();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(first > 0);
        assert!(sampler.generation().current() > first);
        assert!(sampler.is_running());
    }

    #[tokio::test]
    async fn test_stall_reports_once_and_keeps_sampling() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sampler = LagSampler::start(Generation::new(), &config(50), tx);

        tokio::time::sleep(Duration::from_millis(10)).await;
        // Blocks the only scheduler thread
        tokio::spawn(async { std::thread::sleep(Duration::from_millis(150)) });

        let anomaly = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no anomaly within 5s")
            .expect("sampler channel closed");
        assert!(anomaly.elapsed > Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sampler.generation().current() > anomaly.generation);
        assert!(sampler.is_running());

        while let Ok(other) = rx.try_recv() {
            assert_ne!(other.generation, anomaly.generation);
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_generation() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let generation = Generation::new();
        let sampler = LagSampler::start(generation.clone(), &config(100), tx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        sampler.shutdown();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let frozen = generation.current();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(generation.current(), frozen);
    }

    #[test]
    fn test_anomaly_serializes_millis() {
        let anomaly = LagAnomaly {
            generation: 12,
            elapsed: Duration::from_millis(150),
        };
        let json = serde_json::to_value(anomaly).unwrap();
        assert_eq!(json["generation"], 12);
        assert_eq!(json["elapsed"], 150.0);
    }
}
