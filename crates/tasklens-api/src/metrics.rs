//! Prometheus metrics for sessions and scheduler lag.
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use tasklens_core::{AnomalySink, LagAnomaly, LogSink, SessionReport};

const RATIO_BUCKETS: [f64; 8] = [0.01, 0.05, 0.1, 0.25, 0.5, 0.75, 0.9, 1.0];

pub struct Metrics {
    registry: Registry,
    sessions_total: IntCounter,
    session_failures_total: IntCounter,
    slow_tasks_total: IntCounter,
    lag_anomalies_total: IntCounter,
    occupancy_ratio: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let sessions_total = IntCounter::new("tasklens_sessions_total", "Instrumented sessions finished")?;
        let session_failures_total =
            IntCounter::new("tasklens_session_failures_total", "Sessions whose workload failed")?;
        let slow_tasks_total =
            IntCounter::new("tasklens_slow_tasks_total", "Tasks over the slow occupancy threshold")?;
        let lag_anomalies_total =
            IntCounter::new("tasklens_lag_anomalies_total", "Lag probes over the lag threshold")?;
        let occupancy_ratio = Histogram::with_opts(
            HistogramOpts::new(
                "tasklens_occupancy_ratio",
                "Share of session wall-clock time spent occupying the scheduler",
            )
            .buckets(RATIO_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(sessions_total.clone()))?;
        registry.register(Box::new(session_failures_total.clone()))?;
        registry.register(Box::new(slow_tasks_total.clone()))?;
        registry.register(Box::new(lag_anomalies_total.clone()))?;
        registry.register(Box::new(occupancy_ratio.clone()))?;

        Ok(Self {
            registry,
            sessions_total,
            session_failures_total,
            slow_tasks_total,
            lag_anomalies_total,
            occupancy_ratio,
        })
    }

    pub fn observe<T>(&self, report: &SessionReport<T>) {
        self.sessions_total.inc();
        if !report.is_success() {
            self.session_failures_total.inc();
        }
        self.slow_tasks_total.inc_by(report.summary.slow_tasks.len() as u64);
        self.occupancy_ratio.observe(report.summary.occupancy_ratio);
    }

    /// Sink for the lag sampler: counts each anomaly and logs it.
    pub fn anomaly_sink(&self) -> MetricsSink {
        MetricsSink {
            counter: self.lag_anomalies_total.clone(),
        }
    }

    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }
}

#[derive(Clone)]
pub struct MetricsSink {
    counter: IntCounter,
}

impl AnomalySink for MetricsSink {
    fn report(&self, anomaly: LagAnomaly) {
        self.counter.inc();
        LogSink.report(anomaly);
    }
}
