//! In-cluster network and DNS latency probes
//!
//! Starting a probe deploys its workload into the `probes` namespace and
//! waits until the metrics backend scrapes every replica. Gathering reads the
//! probe's latency recording rule over the measured period.

use super::{Action, HarnessContext, Measurement, MeasurementConfig, MeasurementOutput, Summary};
use crate::error::{HarnessError, MetricViolationError, Result};
use crate::poll::{Poller, Tick};
use crate::query::{to_prometheus_duration, ScrapeTarget};
use crate::stats::{LatencyMetric, PerfData};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const PROBES_NAMESPACE: &str = "probes";

const CHECK_READY_INTERVAL: Duration = Duration::from_secs(15);
const CHECK_READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const NAMESPACE_DELETE_INTERVAL: Duration = Duration::from_secs(5);
const NAMESPACE_DELETE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Static description of one probe kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    pub name: &'static str,
    pub metric_version: &'static str,
    /// Query with a `{range}` placeholder
    pub query: &'static str,
    /// Manifest glob relative to the manifests root
    pub manifests: &'static str,
    /// `job` label values of the probe's scrape targets
    pub probe_label_values: &'static [&'static str],
}

impl ProbeConfig {
    pub const IN_CLUSTER_NETWORK_LATENCY: &'static str = "InClusterNetworkLatency";
    pub const DNS_LOOKUP_LATENCY: &'static str = "DnsLookupLatency";

    pub fn in_cluster_network_latency() -> Self {
        Self {
            name: Self::IN_CLUSTER_NETWORK_LATENCY,
            metric_version: "v1",
            query: "quantile_over_time(0.99, probes:in_cluster_network_latency:histogram_quantile[{range}])",
            manifests: "*.yaml",
            probe_label_values: &["ping-client", "ping-server"],
        }
    }

    pub fn dns_lookup_latency() -> Self {
        Self {
            name: Self::DNS_LOOKUP_LATENCY,
            metric_version: "v1",
            query: "quantile_over_time(0.99, probes:dns_lookup_latency:histogram_quantile[{range}])",
            manifests: "dnsLookup/*yaml",
            probe_label_values: &["dns"],
        }
    }

    fn render_query(&self, measured: Duration) -> String {
        self.query.replace("{range}", &to_prometheus_duration(measured))
    }

    fn is_probe_target(&self, target: &ScrapeTarget) -> bool {
        target.label("namespace") == Some(PROBES_NAMESPACE)
            && target
                .label("job")
                .is_some_and(|job| self.probe_label_values.contains(&job))
    }
}

/// Latency probe measurement
pub struct Probe {
    config: ProbeConfig,
    context: Option<Arc<HarnessContext>>,
    started_at: Option<DateTime<Utc>>,
}

impl Probe {
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            context: None,
            started_at: None,
        }
    }

    async fn start(&mut self, config: &MeasurementConfig) -> Result<MeasurementOutput> {
        let name = self.config.name;
        info!(measurement = name, "Starting probe");
        if self.started_at.is_some() || self.context.is_some() {
            return Err(HarnessError::AlreadyRunning(name.to_string()));
        }

        let replicas = config.params.get_int("replicasPerProbe")?;
        let replicas = usize::try_from(replicas)
            .map_err(|_| HarnessError::Config(format!("{name}: replicasPerProbe must be non-negative")))?;
        let interval = config
            .params
            .get_duration_or_default("readyCheckInterval", CHECK_READY_INTERVAL)?;
        let timeout = config
            .params
            .get_duration_or_default("readyTimeout", CHECK_READY_TIMEOUT)?;

        let ctx = config.context.clone();
        let applier = ctx
            .applier
            .clone()
            .ok_or_else(|| HarnessError::Setup(format!("{name}: no object applier configured")))?;
        let targets = ctx
            .targets
            .clone()
            .ok_or_else(|| HarnessError::Setup(format!("{name}: no scrape target source configured")))?;

        // From here on dispose must clean up the namespace
        self.context = Some(ctx.clone());

        ctx.cluster
            .create_namespace(PROBES_NAMESPACE)
            .await
            .map_err(|e| HarnessError::Setup(format!("{name}: creating namespace: {e:#}")))?;

        let mut mapping = Map::new();
        mapping.insert("Replicas".to_string(), json!(replicas));
        let pattern = ctx.manifests_root.join(self.config.manifests);
        applier
            .apply_manifests(&pattern.to_string_lossy(), &mapping)
            .await
            .map_err(|e| HarnessError::Setup(format!("{name}: applying manifests: {e:#}")))?;

        info!(measurement = name, "Waiting for probe to become ready");
        let expected = replicas * self.config.probe_label_values.len();
        let mut poller = Poller::new(interval).timeout(timeout);
        loop {
            match poller.tick().await {
                Tick::Ready => {}
                Tick::TimedOut | Tick::Stopped => {
                    return Err(HarnessError::Timeout(format!(
                        "{name}: probes not ready within {timeout:?}, expected {expected} healthy targets"
                    )));
                }
            }
            match targets.targets().await {
                Ok(all) => {
                    let healthy = all
                        .iter()
                        .filter(|t| self.config.is_probe_target(t) && t.healthy)
                        .count();
                    if healthy >= expected {
                        break;
                    }
                    info!(measurement = name, healthy, expected, "Probe targets not ready yet");
                }
                Err(e) => {
                    warn!(measurement = name, error = %format!("{e:#}"), "Listing scrape targets failed");
                }
            }
        }

        self.started_at = Some(Utc::now());
        Ok(MeasurementOutput::empty())
    }

    async fn gather(&mut self, config: &MeasurementConfig) -> Result<MeasurementOutput> {
        let name = self.config.name;
        info!(measurement = name, "Gathering metrics from probes");
        let started_at = self
            .started_at
            .ok_or_else(|| HarnessError::NotRunning(name.to_string()))?;
        let threshold = config
            .params
            .get_duration_or_default("threshold", Duration::ZERO)?;
        let client = config.context.require_query_client(name)?;

        let end = Utc::now();
        let measured = (end - started_at).to_std().unwrap_or_default();
        let samples = client
            .query(&self.config.render_query(measured), end)
            .await
            .map_err(HarnessError::query)?;
        let latency = LatencyMetric::from_samples(&samples)?;

        let mut violation = None;
        if !threshold.is_zero() {
            if let Some(breach) = latency.verify_threshold(threshold) {
                violation = Some(MetricViolationError::new(name, breach));
            }
        }
        info!(
            measurement = name,
            perc50 = ?latency.perc50,
            perc90 = ?latency.perc90,
            perc99 = ?latency.perc99,
            threshold = ?threshold,
            violated = violation.is_some(),
            "{}got latency",
            if violation.is_some() { "WARNING " } else { "" }
        );

        let labels = BTreeMap::from([("Metric".to_string(), name.to_string())]);
        let perf = PerfData {
            version: self.config.metric_version.to_string(),
            data_items: vec![latency.to_data_item(labels)],
        };
        let summary = Summary::perf(name, &perf)?;
        Ok(MeasurementOutput::summary(summary).with_violation(violation))
    }

    fn skip_reason(config: &MeasurementConfig) -> Option<&'static str> {
        if config.context.is_kubemark() {
            Some("probes cannot work in kubemark")
        } else if config.context.query_client.is_none() {
            Some("metrics backend is disabled")
        } else {
            None
        }
    }
}

#[async_trait]
impl Measurement for Probe {
    async fn execute(&mut self, config: &MeasurementConfig) -> Result<MeasurementOutput> {
        if let Some(reason) = Self::skip_reason(config) {
            info!(measurement = self.config.name, reason, "Skipping the measurement");
            return Ok(MeasurementOutput::empty());
        }
        match Action::from_params(&config.params)? {
            Action::Start => self.start(config).await,
            Action::Gather => self.gather(config).await,
        }
    }

    async fn dispose(&mut self) {
        let name = self.config.name;
        let Some(ctx) = self.context.take() else {
            info!(measurement = name, "Probe wasn't started, skipping dispose");
            return;
        };
        self.started_at = None;
        info!(measurement = name, "Stopping probe");

        if let Err(e) = ctx.cluster.delete_namespace(PROBES_NAMESPACE).await {
            error!(measurement = name, error = %format!("{e:#}"), "Error while deleting probes namespace");
        }

        let mut poller = Poller::new(NAMESPACE_DELETE_INTERVAL)
            .timeout(NAMESPACE_DELETE_TIMEOUT)
            .immediate();
        loop {
            if poller.tick().await != Tick::Ready {
                error!(measurement = name, "Timed out waiting for probes namespace deletion");
                return;
            }
            match ctx.cluster.namespace_exists(PROBES_NAMESPACE).await {
                Ok(false) => return,
                Ok(true) => {}
                Err(e) => {
                    warn!(measurement = name, error = %format!("{e:#}"), "Checking probes namespace failed");
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        self.config.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(job: &str, namespace: &str, healthy: bool) -> ScrapeTarget {
        ScrapeTarget {
            labels: BTreeMap::from([
                ("job".to_string(), job.to_string()),
                ("namespace".to_string(), namespace.to_string()),
            ]),
            healthy,
        }
    }

    #[test]
    fn test_probe_target_selection() {
        let config = ProbeConfig::in_cluster_network_latency();
        assert!(config.is_probe_target(&target("ping-client", "probes", true)));
        assert!(config.is_probe_target(&target("ping-server", "probes", false)));
        assert!(!config.is_probe_target(&target("ping-client", "default", true)));
        assert!(!config.is_probe_target(&target("dns", "probes", true)));
    }

    #[test]
    fn test_query_rendering() {
        let config = ProbeConfig::dns_lookup_latency();
        assert_eq!(
            config.render_query(Duration::from_secs(600)),
            "quantile_over_time(0.99, probes:dns_lookup_latency:histogram_quantile[600s])"
        );
    }
}
