//! Drives one run: start measurements, inject failures while load runs,
//! gather, dispose

use crate::config::{HarnessConfig, MeasurementStep};
use anyhow::{Context, Result};
use harness_lib::poll::stop_channel;
use harness_lib::{
    ChaosRound, HarnessContext, HarnessMetrics, Measurement, MeasurementConfig, MeasurementRegistry,
    MeasurementState, NodeKiller, Params, RemoteExecutor, RunPhase, StatusRegistry,
    StructuredLogger, Summary,
};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Outcome of a whole run
#[derive(Debug, Default)]
pub struct RunReport {
    pub summaries: Vec<Summary>,
    pub failed: Vec<String>,
    pub violated: Vec<String>,
    pub chaos_rounds: Vec<ChaosRound>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.violated.is_empty()
    }
}

struct Instance {
    step: MeasurementStep,
    measurement: Box<dyn Measurement>,
    started: bool,
}

pub struct Runner {
    pub registry: MeasurementRegistry,
    pub context: Arc<HarnessContext>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub status: StatusRegistry,
    pub metrics: HarnessMetrics,
    pub logger: StructuredLogger,
}

fn step_params(raw: &serde_json::Map<String, serde_json::Value>, action: &str) -> Params {
    Params::from(raw.clone()).set("action", action)
}

impl Runner {
    /// Run the plan; load lasts `config.load_duration` or until `interrupt`
    pub async fn run<F>(&self, config: &HarnessConfig, interrupt: F) -> Result<RunReport>
    where
        F: Future<Output = ()>,
    {
        let mut report = RunReport::default();
        let mut instances = Vec::with_capacity(config.measurements.len());
        for step in &config.measurements {
            let measurement = self
                .registry
                .create(&step.method)
                .with_context(|| format!("Measurement {}", step.identifier))?;
            self.status.register(&step.identifier).await;
            instances.push(Instance {
                step: step.clone(),
                measurement,
                started: false,
            });
        }

        let killer = match &config.chaos {
            Some(chaos) => Some(
                NodeKiller::new(
                    chaos.clone(),
                    self.context.cluster.clone(),
                    self.executor.clone(),
                    &config.provider,
                )
                .context("Failed to set up node failures")?
                .with_metrics(self.metrics.clone()),
            ),
            None => None,
        };

        self.status.set_phase(RunPhase::Starting).await;
        for instance in instances.iter_mut().filter(|i| !i.step.gather_only) {
            let params = step_params(&instance.step.start, "start");
            if self.execute(instance, params, "start", &mut report).await {
                instance.started = true;
                self.status
                    .set_measurement(&instance.step.identifier, MeasurementState::Running)
                    .await;
            }
        }
        let running = instances.iter().filter(|i| i.started).count();
        self.metrics.set_running_measurements(running as i64);
        self.status.set_phase(RunPhase::Running).await;

        let (chaos_stop, chaos_signal) = stop_channel();
        let chaos = killer.map(|mut killer| {
            tokio::spawn(async move { killer.run(chaos_signal).await })
        });

        info!(duration = ?config.load_duration, "Measurements running, waiting for load to finish");
        tokio::select! {
            _ = tokio::time::sleep(config.load_duration) => {}
            _ = interrupt => warn!("Interrupted, gathering early"),
        }

        chaos_stop.trigger();
        if let Some(handle) = chaos {
            match handle.await {
                Ok(rounds) => {
                    for round in &rounds {
                        self.logger.log_chaos_round(&round.nodes, round.failures());
                        self.status.record_chaos_round().await;
                    }
                    report.chaos_rounds = rounds;
                }
                Err(e) => warn!(error = %e, "Node failure task ended abnormally"),
            }
        }

        self.status.set_phase(RunPhase::Gathering).await;
        for instance in instances.iter_mut() {
            if !instance.started && !instance.step.gather_only {
                continue;
            }
            let params = step_params(&instance.step.gather, "gather");
            let timer = Instant::now();
            self.execute(instance, params, "gather", &mut report).await;
            self.metrics.observe_gather_latency(timer.elapsed());
        }
        self.metrics.set_running_measurements(0);

        for instance in instances.iter_mut() {
            instance.measurement.dispose().await;
        }
        self.status.set_phase(RunPhase::Finished).await;

        if let Some(dir) = &config.report_dir {
            write_summaries(dir, &report.summaries).await?;
        }
        Ok(report)
    }

    /// Run one action; true when it produced no error
    async fn execute(
        &self,
        instance: &mut Instance,
        params: Params,
        action: &str,
        report: &mut RunReport,
    ) -> bool {
        let id = instance.step.identifier.clone();
        let name = instance.measurement.name();
        let config = MeasurementConfig::new(params, self.context.clone());

        match instance.measurement.execute(&config).await {
            Ok(output) => {
                let count = output.summaries.len();
                for summary in &output.summaries {
                    match summary.to_pretty_json() {
                        Ok(json) => info!(measurement = name, summary = %summary.name, "{json}"),
                        Err(e) => warn!(measurement = name, error = %e, "Summary not printable"),
                    }
                }
                report.summaries.extend(output.summaries);

                let outcome = if let Some(violation) = output.violation {
                    self.logger
                        .log_violation(name, &violation.subject, &violation.message);
                    self.metrics.inc_slo_violations(name);
                    self.status
                        .set_measurement(&id, MeasurementState::Violated(violation.to_string()))
                        .await;
                    report.violated.push(id.clone());
                    "violation"
                } else {
                    if action == "gather" {
                        self.status
                            .set_measurement(&id, MeasurementState::Gathered)
                            .await;
                    }
                    "ok"
                };
                self.metrics.record_execution(name, action, outcome);
                self.logger
                    .log_measurement_result(name, &id, action, count, None);
                true
            }
            Err(e) => {
                let message = e.to_string();
                self.metrics.record_execution(name, action, "error");
                self.logger
                    .log_measurement_result(name, &id, action, 0, Some(&message));
                self.status
                    .set_measurement(&id, MeasurementState::Failed(message))
                    .await;
                report.failed.push(id);
                false
            }
        }
    }
}

async fn write_summaries(dir: &Path, summaries: &[Summary]) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let stamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%SZ");
    for summary in summaries {
        let path = dir.join(format!("{}_{}.json", summary.name, stamp));
        let json = summary.to_pretty_json()?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Summary written");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use harness_lib::{ClusterClient, PhysicalNode, Selector, WorkloadUnit};
    use std::time::Duration;

    struct EmptyCluster;

    #[async_trait]
    impl ClusterClient for EmptyCluster {
        async fn list_nodes(&self) -> anyhow::Result<Vec<PhysicalNode>> {
            Ok(Vec::new())
        }
        async fn list_pods(&self, _selector: &Selector) -> anyhow::Result<Vec<WorkloadUnit>> {
            Ok(Vec::new())
        }
        async fn create_namespace(&self, _name: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn delete_namespace(&self, _name: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn namespace_exists(&self, _name: &str) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    struct NoopExecutor;

    #[async_trait]
    impl RemoteExecutor for NoopExecutor {
        async fn run(&self, _command: &str, _node: &PhysicalNode) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    fn runner() -> Runner {
        Runner {
            registry: MeasurementRegistry::with_builtin(),
            context: Arc::new(HarnessContext::new(Arc::new(EmptyCluster))),
            executor: Arc::new(NoopExecutor),
            status: StatusRegistry::new(),
            metrics: HarnessMetrics::new(),
            logger: StructuredLogger::new("test"),
        }
    }

    fn config(steps: serde_json::Value) -> HarnessConfig {
        serde_json::from_value(serde_json::json!({
            "load_duration": "50ms",
            "measurements": steps,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_throughput_plan_gathers_summary() {
        let runner = runner();
        let config = config(serde_json::json!([{
            "method": "SchedulingThroughput",
            "identifier": "throughput",
            "start": {"namespace": "load", "interval": "10ms"},
        }]));

        let report = runner
            .run(&config, std::future::pending())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.summaries.len(), 1);
        assert_eq!(report.summaries[0].name, "SchedulingThroughput");

        let status = runner.status.status().await;
        assert_eq!(status.phase, RunPhase::Finished);
        assert_eq!(status.measurements["throughput"], MeasurementState::Gathered);
    }

    #[tokio::test]
    async fn test_failed_start_skips_gather() {
        let runner = runner();
        // No usage source configured
        let config = config(serde_json::json!([{
            "method": "ResourceUsageSummary",
            "identifier": "usage",
        }]));

        let report = runner.run(&config, async {}).await.unwrap();
        assert_eq!(report.failed, vec!["usage".to_string()]);
        assert!(!runner.status.status().await.healthy);
    }

    #[tokio::test]
    async fn test_unknown_method_is_rejected() {
        let runner = runner();
        let config = config(serde_json::json!([{
            "method": "NoSuchMeasurement",
            "identifier": "x",
        }]));
        assert!(runner.run(&config, async {}).await.is_err());
    }

    #[tokio::test]
    async fn test_chaos_requires_supported_provider() {
        let runner = runner();
        let mut config = config(serde_json::json!([]));
        config.provider = "kubemark".to_string();
        config.chaos = Some(harness_lib::NodeFailureConfig {
            failure_rate: 0.1,
            interval: Duration::from_secs(60),
            jitter_factor: 0.0,
            simulated_downtime: Duration::from_secs(1),
        });
        assert!(runner.run(&config, async {}).await.is_err());
    }

    #[tokio::test]
    async fn test_summaries_written_to_report_dir() {
        let dir = tempfile::tempdir().unwrap();
        let summaries = vec![Summary::raw("MetricsForE2E", serde_json::json!({"a": 1}))];
        write_summaries(dir.path(), &summaries).await.unwrap();

        let written: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(written.len(), 1);
    }
}
