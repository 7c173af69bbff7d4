//! Observability infrastructure for the load-test harness
//!
//! Provides:
//! - Prometheus metrics (chaos rounds, measurement outcomes, SLO violations, gather latency)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, info, warn};

/// Histogram buckets for gather latency (in seconds)
const GATHER_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0];

static GLOBAL_METRICS: OnceLock<HarnessMetricsInner> = OnceLock::new();

struct HarnessMetricsInner {
    chaos_rounds: IntCounter,
    nodes_killed: IntCounter,
    node_failures: IntCounter,
    measurement_executions: IntCounterVec,
    slo_violations: IntCounterVec,
    gather_latency_seconds: Histogram,
    running_measurements: IntGauge,
}

impl HarnessMetricsInner {
    fn new() -> Self {
        Self {
            chaos_rounds: register_int_counter!(
                "load_harness_chaos_rounds_total",
                "Number of completed node failure rounds"
            )
            .expect("Failed to register chaos_rounds"),

            nodes_killed: register_int_counter!(
                "load_harness_nodes_killed_total",
                "Number of nodes selected for simulated failure"
            )
            .expect("Failed to register nodes_killed"),

            node_failures: register_int_counter!(
                "load_harness_node_failure_errors_total",
                "Number of nodes whose simulated failure could not be applied"
            )
            .expect("Failed to register node_failures"),

            measurement_executions: register_int_counter_vec!(
                "load_harness_measurement_executions_total",
                "Measurement executions by action and outcome",
                &["measurement", "action", "outcome"]
            )
            .expect("Failed to register measurement_executions"),

            slo_violations: register_int_counter_vec!(
                "load_harness_slo_violations_total",
                "Gathered summaries that breached an objective",
                &["measurement"]
            )
            .expect("Failed to register slo_violations"),

            gather_latency_seconds: register_histogram!(
                "load_harness_gather_latency_seconds",
                "Time spent gathering a measurement",
                GATHER_BUCKETS.to_vec()
            )
            .expect("Failed to register gather_latency_seconds"),

            running_measurements: register_int_gauge!(
                "load_harness_running_measurements",
                "Measurements started and not yet gathered"
            )
            .expect("Failed to register running_measurements"),
        }
    }
}

/// Harness metrics for Prometheus exposition
///
/// Lightweight handle to the process-wide metrics; clones share them.
#[derive(Clone)]
pub struct HarnessMetrics {
    _private: (),
}

impl Default for HarnessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(HarnessMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &HarnessMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Record a finished chaos round
    pub fn record_chaos_round(&self, killed: usize, failures: usize) {
        let inner = self.inner();
        inner.chaos_rounds.inc();
        inner.nodes_killed.inc_by(killed as u64);
        inner.node_failures.inc_by(failures as u64);
    }

    /// Record one `execute` call; `outcome` is `ok`, `violation` or `error`
    pub fn record_execution(&self, measurement: &str, action: &str, outcome: &str) {
        self.inner()
            .measurement_executions
            .with_label_values(&[measurement, action, outcome])
            .inc();
    }

    pub fn inc_slo_violations(&self, measurement: &str) {
        self.inner()
            .slo_violations
            .with_label_values(&[measurement])
            .inc();
    }

    pub fn observe_gather_latency(&self, elapsed: Duration) {
        self.inner()
            .gather_latency_seconds
            .observe(elapsed.as_secs_f64());
    }

    pub fn set_running_measurements(&self, count: i64) {
        self.inner().running_measurements.set(count);
    }

    /// Every registered metric in the Prometheus text format
    pub fn encode(&self) -> prometheus::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }
}

/// Structured logger for run events
///
/// Consistent JSON-shaped events for run start/stop, measurement results,
/// SLO violations and chaos rounds.
#[derive(Clone)]
pub struct StructuredLogger {
    run_name: String,
}

impl StructuredLogger {
    pub fn new(run_name: impl Into<String>) -> Self {
        Self {
            run_name: run_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, provider: &str, measurements: usize) {
        info!(
            event = "run_started",
            run = %self.run_name,
            harness_version = %version,
            provider = %provider,
            measurements = measurements,
            "Load harness run started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "run_finished",
            run = %self.run_name,
            reason = %reason,
            "Load harness run finished"
        );
    }

    /// Log the result of one `execute` call
    pub fn log_measurement_result(
        &self,
        measurement: &str,
        identifier: &str,
        action: &str,
        summaries: usize,
        error: Option<&str>,
    ) {
        match error {
            Some(error) => {
                error!(
                    event = "measurement_failed",
                    run = %self.run_name,
                    measurement = %measurement,
                    identifier = %identifier,
                    action = %action,
                    error = %error,
                    "Measurement failed"
                );
            }
            None => {
                info!(
                    event = "measurement_executed",
                    run = %self.run_name,
                    measurement = %measurement,
                    identifier = %identifier,
                    action = %action,
                    summaries = summaries,
                    "Measurement executed"
                );
            }
        }
    }

    pub fn log_violation(&self, measurement: &str, subject: &str, message: &str) {
        warn!(
            event = "slo_violation",
            run = %self.run_name,
            measurement = %measurement,
            subject = %subject,
            details = %message,
            "Objective violated"
        );
    }

    pub fn log_chaos_round(&self, nodes: &[String], failures: usize) {
        if failures > 0 {
            warn!(
                event = "chaos_round",
                run = %self.run_name,
                nodes = ?nodes,
                failures = failures,
                "Node failure round finished with errors"
            );
        } else {
            info!(
                event = "chaos_round",
                run = %self.run_name,
                nodes = ?nodes,
                "Node failure round finished"
            );
        }
    }
}
