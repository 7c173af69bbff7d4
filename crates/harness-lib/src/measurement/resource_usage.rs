//! Per-container resource usage collector
//!
//! Control-plane nodes are sampled on a fast cadence and every other node on
//! a slow one. Each tick fans out one task per node to the `UsageSource`.
//! Gathering computes percentiles per container and checks the 99th
//! percentile against the configured constraints.

use super::{Action, Measurement, MeasurementConfig, MeasurementOutput, Summary};
use crate::cluster::{is_master_node, ClusterClient};
use crate::error::{HarnessError, MetricViolationError, Result, ViolationSet};
use crate::models::{NodeSelection, PhysicalNode, ResourceConstraint, Sample, Selector};
use crate::poll::{stop_channel, Poller, StopSignal, StopTrigger, Tick, TaskGroup};
use crate::query::QueryClient;
use crate::stats::{percentile_sorted, DataItem, PerfData};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const DEFAULT_GATHERING_PERIOD: Duration = Duration::from_secs(60);
const DEFAULT_MASTER_GATHERING_PERIOD: Duration = Duration::from_secs(10);
const PERCENTILES: [u32; 4] = [50, 90, 99, 100];
const MB: f64 = 1024.0 * 1024.0;

/// Usage of one container at one instant
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerUsage {
    /// `pod/container`
    pub name: String,
    /// Cores
    pub cpu: f64,
    /// Working set bytes
    pub memory: u64,
}

/// Source of per-container usage on a node
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn container_usage(&self, node: &PhysicalNode) -> anyhow::Result<Vec<ContainerUsage>>;
}

/// `UsageSource` backed by cAdvisor series in the metrics backend
pub struct PrometheusUsageSource {
    client: Arc<dyn QueryClient>,
}

impl PrometheusUsageSource {
    pub fn new(client: Arc<dyn QueryClient>) -> Self {
        Self { client }
    }

    fn cpu_query(node: &str) -> String {
        format!(
            "sum(rate(container_cpu_usage_seconds_total{{node=\"{node}\",container!=\"\",container!=\"POD\"}}[1m])) \
             by (namespace, pod, container)"
        )
    }

    fn memory_query(node: &str) -> String {
        format!(
            "sum(container_memory_working_set_bytes{{node=\"{node}\",container!=\"\",container!=\"POD\"}}) \
             by (namespace, pod, container)"
        )
    }
}

#[async_trait]
impl UsageSource for PrometheusUsageSource {
    async fn container_usage(&self, node: &PhysicalNode) -> anyhow::Result<Vec<ContainerUsage>> {
        let now = Utc::now();
        let cpu = self.client.query(&Self::cpu_query(&node.name), now).await?;
        let memory = self.client.query(&Self::memory_query(&node.name), now).await?;

        let name_of = |s: &Sample| {
            format!(
                "{}/{}",
                s.label("pod").unwrap_or_default(),
                s.label("container").unwrap_or_default()
            )
        };

        let mut usage: BTreeMap<String, ContainerUsage> = BTreeMap::new();
        for sample in &cpu {
            let name = name_of(sample);
            usage
                .entry(name.clone())
                .or_insert(ContainerUsage { name, cpu: 0.0, memory: 0 })
                .cpu = sample.value;
        }
        for sample in &memory {
            let name = name_of(sample);
            usage
                .entry(name.clone())
                .or_insert(ContainerUsage { name, cpu: 0.0, memory: 0 })
                .memory = sample.value.max(0.0) as u64;
        }
        Ok(usage.into_values().collect())
    }
}

/// Collected series of one container
#[derive(Debug, Default, Clone)]
struct UsageSeries {
    cpu: Vec<f64>,
    memory: Vec<u64>,
}

type UsageStore = Arc<Mutex<BTreeMap<String, UsageSeries>>>;

/// Constraint as written in configuration
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConstraint {
    cpu_constraint: Option<f64>,
    memory_constraint: Option<u64>,
}

struct Collector {
    stop: StopTrigger,
    tasks: Vec<JoinHandle<()>>,
    store: UsageStore,
}

impl Collector {
    async fn finish(self) -> BTreeMap<String, UsageSeries> {
        self.stop.trigger();
        for task in self.tasks {
            let _ = task.await;
        }
        let mut store = self.store.lock().await;
        std::mem::take(&mut *store)
    }
}

/// Resource usage collector with optional per-container constraints
#[derive(Default)]
pub struct ResourceUsageSummary {
    collector: Option<Collector>,
    constraints: HashMap<String, ResourceConstraint>,
}

impl ResourceUsageSummary {
    pub const NAME: &'static str = "ResourceUsageSummary";

    pub fn new() -> Self {
        Self::default()
    }

    async fn start(&mut self, config: &MeasurementConfig) -> Result<MeasurementOutput> {
        if self.collector.is_some() {
            return Err(HarnessError::AlreadyRunning(Self::NAME.to_string()));
        }
        let params = &config.params;
        let mode = NodeSelection::from_param(&params.get_string_or_default("nodeMode", "")?);
        let period = params.get_duration_or_default("gatheringPeriod", DEFAULT_GATHERING_PERIOD)?;
        let master_period = params
            .get_duration_or_default("masterGatheringPeriod", DEFAULT_MASTER_GATHERING_PERIOD)?;
        if period.is_zero() || master_period.is_zero() {
            return Err(HarnessError::Config(format!(
                "{}: gathering periods must be positive",
                Self::NAME
            )));
        }

        self.constraints = match params.get("resourceConstraints") {
            None | Some(serde_json::Value::Null) => HashMap::new(),
            Some(serde_json::Value::String(path)) if path.is_empty() => HashMap::new(),
            Some(serde_json::Value::String(path)) => load_constraints_file(path).await?,
            Some(inline) => parse_constraints(inline.clone())?,
        };

        let source = config
            .context
            .usage_source
            .clone()
            .ok_or_else(|| HarnessError::Setup(format!("{}: no usage source configured", Self::NAME)))?;

        let (masters, others) = resolve_nodes(config.context.cluster.as_ref(), mode).await?;
        info!(
            measurement = Self::NAME,
            mode = ?mode,
            master_nodes = masters.len(),
            other_nodes = others.len(),
            "Starting resource usage collecting"
        );

        let store: UsageStore = Arc::default();
        let (stop, signal) = stop_channel();
        let mut tasks = Vec::new();
        for (nodes, every) in [(masters, master_period), (others, period)] {
            if nodes.is_empty() {
                continue;
            }
            tasks.push(tokio::spawn(sample_nodes(
                source.clone(),
                nodes,
                every,
                signal.clone(),
                store.clone(),
            )));
        }

        self.collector = Some(Collector { stop, tasks, store });
        Ok(MeasurementOutput::empty())
    }

    async fn gather(&mut self) -> Result<MeasurementOutput> {
        let collector = self
            .collector
            .take()
            .ok_or_else(|| HarnessError::NotRunning(Self::NAME.to_string()))?;
        info!(measurement = Self::NAME, "Gathering resource usage");

        let series = collector.finish().await;
        let summary = summarize(series);
        let violation = self.verify(&summary);

        let mut items = Vec::with_capacity(summary.len() * 2);
        for (name, stats) in &summary {
            let mut cpu = DataItem::new("cores")
                .with_label("Name", name.clone())
                .with_label("Resource", "cpu");
            let mut memory = DataItem::new("bytes")
                .with_label("Name", name.clone())
                .with_label("Resource", "memory");
            for (p, (c, m)) in &stats.percentiles {
                cpu.data.insert(format!("Perc{p}"), *c);
                memory.data.insert(format!("Perc{p}"), *m as f64);
            }
            items.push(cpu);
            items.push(memory);
        }

        let summary = Summary::perf(Self::NAME, &PerfData::new(items))?;
        Ok(MeasurementOutput::summary(summary).with_violation(violation))
    }

    /// Accumulate every p99 breach of a constrained container
    fn verify(&self, summary: &BTreeMap<String, ContainerStats>) -> Option<MetricViolationError> {
        let mut violations = ViolationSet::new();
        for (name, stats) in summary {
            let container = name.split_once('/').map_or(name.as_str(), |(_, c)| c);
            let Some(constraint) = self.constraints.get(container) else {
                continue;
            };
            let Some((cpu, memory)) = stats.percentiles.get(&99) else {
                continue;
            };
            if *cpu > constraint.cpu {
                violations.push(format!(
                    "container {name} is using {cpu}/{} CPU",
                    constraint.cpu
                ));
            }
            if *memory > constraint.memory {
                violations.push(format!(
                    "container {name} is using {}/{} MB of memory",
                    *memory as f64 / MB,
                    constraint.memory as f64 / MB
                ));
            }
        }
        for v in violations.iter() {
            error!(measurement = Self::NAME, "violation: {v}");
        }
        violations.into_error("resource constraints", |v| {
            format!("{} constraints violated: {:?}", v.len(), v)
        })
    }
}

#[async_trait]
impl Measurement for ResourceUsageSummary {
    async fn execute(&mut self, config: &MeasurementConfig) -> Result<MeasurementOutput> {
        match Action::from_params(&config.params)? {
            Action::Start => self.start(config).await,
            Action::Gather => self.gather().await,
        }
    }

    async fn dispose(&mut self) {
        if let Some(collector) = self.collector.take() {
            collector.finish().await;
        }
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }
}

/// Percentile -> (cpu cores, memory bytes)
#[derive(Debug, Default)]
struct ContainerStats {
    percentiles: BTreeMap<u32, (f64, u64)>,
}

fn summarize(series: BTreeMap<String, UsageSeries>) -> BTreeMap<String, ContainerStats> {
    series
        .into_iter()
        .filter(|(_, s)| !s.cpu.is_empty())
        .map(|(name, mut s)| {
            s.cpu.sort_by(|a, b| a.total_cmp(b));
            s.memory.sort_unstable();
            let memory: Vec<f64> = s.memory.iter().map(|m| *m as f64).collect();
            let percentiles = PERCENTILES
                .iter()
                .map(|p| {
                    let cpu = percentile_sorted(f64::from(*p), &s.cpu).unwrap_or_default();
                    let mem = percentile_sorted(f64::from(*p), &memory).unwrap_or_default();
                    (*p, (cpu, mem as u64))
                })
                .collect();
            (name, ContainerStats { percentiles })
        })
        .collect()
}

/// Split the selected nodes into the fast (control-plane) and slow cadence
async fn resolve_nodes(
    cluster: &dyn ClusterClient,
    mode: NodeSelection,
) -> Result<(Vec<PhysicalNode>, Vec<PhysicalNode>)> {
    let nodes = cluster.list_nodes().await.map_err(HarnessError::cluster)?;

    let dns_nodes: BTreeSet<String> = if mode == NodeSelection::MasterAndDns {
        let selector = Selector::new(Some("kube-system".to_string()), "k8s-app=kube-dns", "");
        cluster
            .list_pods(&selector)
            .await
            .map_err(HarnessError::cluster)?
            .into_iter()
            .filter(|p| p.is_scheduled())
            .map(|p| p.node_name)
            .collect()
    } else {
        BTreeSet::new()
    };

    let (masters, others): (Vec<_>, Vec<_>) = nodes.into_iter().partition(is_master_node);
    let others = match mode {
        NodeSelection::All => others,
        NodeSelection::Master => Vec::new(),
        NodeSelection::MasterAndDns => others
            .into_iter()
            .filter(|n| dns_nodes.contains(&n.name))
            .collect(),
    };
    Ok((masters, others))
}

async fn sample_nodes(
    source: Arc<dyn UsageSource>,
    nodes: Vec<PhysicalNode>,
    period: Duration,
    stop: StopSignal,
    store: UsageStore,
) {
    let mut poller = Poller::new(period).stop_on(stop).immediate();
    while poller.tick().await == Tick::Ready {
        let mut group = TaskGroup::new();
        for node in &nodes {
            let source = source.clone();
            let node = node.clone();
            group.spawn(node.name.clone(), async move { source.container_usage(&node).await });
        }

        let outcomes = group.join_all().await;
        let mut store = store.lock().await;
        for outcome in outcomes {
            match outcome.result {
                Ok(usages) => {
                    for usage in usages {
                        let series = store.entry(usage.name).or_default();
                        series.cpu.push(usage.cpu);
                        series.memory.push(usage.memory);
                    }
                }
                Err(e) => {
                    warn!(
                        measurement = ResourceUsageSummary::NAME,
                        node = %outcome.label,
                        error = %format!("{e:#}"),
                        "Failed to read container usage"
                    );
                }
            }
        }
    }
}

async fn load_constraints_file(path: &str) -> Result<HashMap<String, ResourceConstraint>> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        HarnessError::Config(format!("resource constraints reading error: {path}: {e}"))
    })?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    parse_constraints(value)
}

fn parse_constraints(value: serde_json::Value) -> Result<HashMap<String, ResourceConstraint>> {
    let raw: HashMap<String, RawConstraint> = serde_json::from_value(value)?;
    Ok(raw
        .into_iter()
        .map(|(name, c)| (name, ResourceConstraint::new(c.cpu_constraint, c.memory_constraint)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeQueryClient;

    #[test]
    fn test_zero_constraints_become_unbounded() {
        let parsed = parse_constraints(serde_json::json!({
            "etcd": {"cpuConstraint": 0.5, "memoryConstraint": 0},
            "kube-apiserver": {},
        }))
        .unwrap();
        assert_eq!(parsed["etcd"].cpu, 0.5);
        assert_eq!(parsed["etcd"].memory, u64::MAX);
        assert_eq!(parsed["kube-apiserver"].cpu, f64::MAX);
    }

    #[test]
    fn test_summarize_percentiles() {
        let mut series = BTreeMap::new();
        series.insert(
            "p/c".to_string(),
            UsageSeries {
                cpu: vec![0.4, 0.1, 0.3, 0.2],
                memory: vec![40, 10, 30, 20],
            },
        );
        let stats = summarize(series);
        let c = &stats["p/c"].percentiles;
        assert_eq!(c[&50], (0.2, 20));
        assert_eq!(c[&99], (0.4, 40));
        assert_eq!(c[&100], (0.4, 40));
    }

    #[tokio::test]
    async fn test_prometheus_usage_source_joins_series() {
        let client = FakeQueryClient::new()
            .respond(
                "container_cpu_usage_seconds_total",
                vec![Sample::new("cpu", 0.25)
                    .with_label("pod", "etcd-0")
                    .with_label("container", "etcd")],
            )
            .respond(
                "container_memory_working_set_bytes",
                vec![Sample::new("mem", 1048576.0)
                    .with_label("pod", "etcd-0")
                    .with_label("container", "etcd")],
            );
        let client = Arc::new(client);
        let source = PrometheusUsageSource::new(client.clone());

        let usage = source
            .container_usage(&PhysicalNode::new("master-0"))
            .await
            .unwrap();
        assert_eq!(
            usage,
            vec![ContainerUsage {
                name: "etcd-0/etcd".to_string(),
                cpu: 0.25,
                memory: 1048576,
            }]
        );
        assert!(client.issued()[0].contains("node=\"master-0\""));
    }
}
