//! Raw control-plane and kubelet metrics snapshot

use super::{Measurement, MeasurementConfig, MeasurementOutput, Summary};
use crate::error::{HarnessError, Result};
use crate::models::Sample;
use crate::query::QueryClient;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

const INTERESTING_APISERVER_METRICS: &[&str] = &[
    "apiserver_init_events_total",
    "apiserver_request_count",
    "apiserver_request_latencies_summary",
    "etcd_request_latencies_summary",
];

const INTERESTING_CONTROLLER_MANAGER_METRICS: &[&str] = &[
    "garbage_collector_attempt_to_delete_queue_latency",
    "garbage_collector_attempt_to_delete_work_duration",
    "garbage_collector_attempt_to_orphan_queue_latency",
    "garbage_collector_attempt_to_orphan_work_duration",
    "garbage_collector_dirty_processing_latency_microseconds",
    "garbage_collector_event_processing_latency_microseconds",
    "garbage_collector_graph_changes_queue_latency",
    "garbage_collector_graph_changes_work_duration",
    "garbage_collector_orphan_processing_latency_microseconds",
    "namespace_queue_latency",
    "namespace_queue_latency_sum",
    "namespace_queue_latency_count",
    "namespace_retries",
    "namespace_work_duration",
    "namespace_work_duration_sum",
    "namespace_work_duration_count",
];

const INTERESTING_KUBELET_METRICS: &[&str] = &[
    "kubelet_container_manager_latency_microseconds",
    "kubelet_docker_errors",
    "kubelet_docker_operations_latency_microseconds",
    "kubelet_generate_pod_status_latency_microseconds",
    "kubelet_pod_start_latency_microseconds",
    "kubelet_pod_worker_latency_microseconds",
    "kubelet_pod_worker_start_latency_microseconds",
    "kubelet_sync_pods_latency_microseconds",
];

/// Metric name -> samples
pub type ComponentMetrics = BTreeMap<String, Vec<Sample>>;

/// Metrics grabbed from each control-plane component and kubelet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricsCollection {
    pub api_server_metrics: ComponentMetrics,
    pub controller_manager_metrics: ComponentMetrics,
    /// Keyed by node name
    pub kubelet_metrics: BTreeMap<String, ComponentMetrics>,
}

impl MetricsCollection {
    /// Keep only the interesting metric names; missing ones become empty
    pub fn filter_interesting(self) -> Self {
        let keep = |mut grabbed: ComponentMetrics, names: &[&str]| -> ComponentMetrics {
            names
                .iter()
                .map(|name| (name.to_string(), grabbed.remove(*name).unwrap_or_default()))
                .collect()
        };
        Self {
            api_server_metrics: keep(self.api_server_metrics, INTERESTING_APISERVER_METRICS),
            controller_manager_metrics: keep(
                self.controller_manager_metrics,
                INTERESTING_CONTROLLER_MANAGER_METRICS,
            ),
            kubelet_metrics: self
                .kubelet_metrics
                .into_iter()
                .map(|(node, grabbed)| (node, keep(grabbed, INTERESTING_KUBELET_METRICS)))
                .collect(),
        }
    }
}

/// Grabs raw component metrics
#[async_trait]
pub trait MetricsGrabber: Send + Sync {
    async fn grab(&self, include_kubelets: bool) -> anyhow::Result<MetricsCollection>;
}

/// `MetricsGrabber` reading the interesting series from the metrics backend
pub struct PrometheusGrabber {
    client: Arc<dyn QueryClient>,
}

impl PrometheusGrabber {
    pub fn new(client: Arc<dyn QueryClient>) -> Self {
        Self { client }
    }

    /// Query every name for one scrape job; failures are logged and skipped
    async fn grab_job(&self, job: &str, names: &[&str]) -> Vec<Sample> {
        let now = Utc::now();
        let mut all = Vec::new();
        for name in names {
            let query = format!("{name}{{job=\"{job}\"}}");
            match self.client.query(&query, now).await {
                Ok(samples) => all.extend(samples),
                Err(e) => {
                    warn!(job, metric = name, error = %format!("{e:#}"), "Failed to grab metric");
                }
            }
        }
        all
    }
}

fn by_metric(samples: Vec<Sample>) -> ComponentMetrics {
    let mut out = ComponentMetrics::new();
    for sample in samples {
        out.entry(sample.metric.clone()).or_default().push(sample);
    }
    out
}

#[async_trait]
impl MetricsGrabber for PrometheusGrabber {
    async fn grab(&self, include_kubelets: bool) -> anyhow::Result<MetricsCollection> {
        let mut collection = MetricsCollection {
            api_server_metrics: by_metric(
                self.grab_job("apiserver", INTERESTING_APISERVER_METRICS).await,
            ),
            controller_manager_metrics: by_metric(
                self.grab_job("kube-controller-manager", INTERESTING_CONTROLLER_MANAGER_METRICS)
                    .await,
            ),
            kubelet_metrics: BTreeMap::new(),
        };

        if include_kubelets {
            for sample in self.grab_job("kubelet", INTERESTING_KUBELET_METRICS).await {
                let node = sample
                    .label("node")
                    .or_else(|| sample.label("instance"))
                    .unwrap_or_default()
                    .to_string();
                collection
                    .kubelet_metrics
                    .entry(node)
                    .or_default()
                    .entry(sample.metric.clone())
                    .or_default()
                    .push(sample);
            }
        }
        Ok(collection)
    }
}

/// Single-shot snapshot of interesting component metrics
#[derive(Default)]
pub struct MetricsForE2E;

impl MetricsForE2E {
    pub const NAME: &'static str = "MetricsForE2E";

    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Measurement for MetricsForE2E {
    async fn execute(&mut self, config: &MeasurementConfig) -> Result<MeasurementOutput> {
        let provider = config
            .params
            .get_string_or_default("provider", &config.context.provider)?;
        let include_kubelets = config
            .params
            .get_bool_or_default("gatherKubeletsMetrics", false)?
            && !provider.eq_ignore_ascii_case("kubemark");

        let grabber = config.context.grabber.clone().ok_or_else(|| {
            HarnessError::Setup(format!("{}: no metrics grabber configured", Self::NAME))
        })?;

        info!(measurement = Self::NAME, include_kubelets, "Grabbing component metrics");
        let received = grabber
            .grab(include_kubelets)
            .await
            .map_err(HarnessError::query)?;

        let content = serde_json::to_value(received.filter_interesting())?;
        Ok(MeasurementOutput::summary(Summary::raw(Self::NAME, content)))
    }

    async fn dispose(&mut self) {}

    fn name(&self) -> &'static str {
        Self::NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_keeps_only_interesting() {
        let mut collection = MetricsCollection::default();
        collection.api_server_metrics.insert(
            "apiserver_request_count".to_string(),
            vec![Sample::new("apiserver_request_count", 10.0)],
        );
        collection
            .api_server_metrics
            .insert("go_goroutines".to_string(), vec![Sample::new("go_goroutines", 1.0)]);
        collection.kubelet_metrics.insert(
            "node-1".to_string(),
            BTreeMap::from([("kubelet_docker_errors".to_string(), vec![])]),
        );

        let filtered = collection.filter_interesting();
        assert_eq!(
            filtered.api_server_metrics.len(),
            INTERESTING_APISERVER_METRICS.len()
        );
        assert!(!filtered.api_server_metrics.contains_key("go_goroutines"));
        assert_eq!(filtered.api_server_metrics["apiserver_request_count"].len(), 1);
        assert_eq!(
            filtered.controller_manager_metrics.len(),
            INTERESTING_CONTROLLER_MANAGER_METRICS.len()
        );
        assert_eq!(
            filtered.kubelet_metrics["node-1"].len(),
            INTERESTING_KUBELET_METRICS.len()
        );
    }
}
