//! Periodic node failure injection
//!
//! Every round picks a random share of the schedulable nodes that host no
//! monitoring pod and were not failed earlier in the run, stops their
//! container runtime and kubelet, waits the simulated downtime and reboots
//! them. Nodes of one round fail in parallel; rounds never overlap.

use crate::cluster::{schedulable_untainted_nodes, ClusterClient, RemoteExecutor};
use crate::error::{HarnessError, Result};
use crate::models::{PhysicalNode, Selector};
use crate::observability::HarnessMetrics;
use crate::poll::{jittered, Poller, StopSignal, TaskGroup, Tick};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{error, info};

pub const MONITORING_NAMESPACE: &str = "monitoring";
pub const PROMETHEUS_LABEL: &str = "prometheus=k8s";

const STOP_COMMAND: &str = "sudo systemctl stop docker kubelet";
const REBOOT_COMMAND: &str = "sudo reboot";
const SUPPORTED_PROVIDERS: [&str; 2] = ["gce", "gke"];

/// Node failure schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailureConfig {
    /// Share of eligible nodes failed per round, in `[0, 1]`
    pub failure_rate: f64,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default)]
    pub jitter_factor: f64,
    #[serde(with = "humantime_serde")]
    pub simulated_downtime: Duration,
}

impl NodeFailureConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(HarnessError::Config(format!(
                "failure rate must be within [0, 1], got {}",
                self.failure_rate
            )));
        }
        if self.interval.is_zero() {
            return Err(HarnessError::Config("node failure interval must be positive".into()));
        }
        if self.jitter_factor < 0.0 {
            return Err(HarnessError::Config("jitter factor must not be negative".into()));
        }
        Ok(())
    }
}

/// Result of failing one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeOutcome {
    pub node: String,
    /// `None` when both the stop and the reboot went through
    pub error: Option<String>,
}

impl NodeOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// One select-and-fail cycle
#[derive(Debug, Clone, Serialize)]
pub struct ChaosRound {
    pub timestamp: DateTime<Utc>,
    pub nodes: Vec<String>,
    pub outcomes: Vec<NodeOutcome>,
}

impl ChaosRound {
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_ok()).count()
    }
}

/// Pick `floor(rate * |eligible|)` random nodes among `candidates` that are
/// not in `excluded`
pub fn select_nodes<R: Rng + ?Sized>(
    candidates: Vec<PhysicalNode>,
    excluded: &HashSet<String>,
    failure_rate: f64,
    rng: &mut R,
) -> Vec<PhysicalNode> {
    let mut eligible: Vec<PhysicalNode> = candidates
        .into_iter()
        .filter(|n| !excluded.contains(&n.name))
        .collect();
    eligible.shuffle(rng);
    let count = ((failure_rate * eligible.len() as f64).floor() as usize).min(eligible.len());
    eligible.truncate(count);
    eligible
}

/// Simulates node failures on a jittered schedule
pub struct NodeKiller {
    config: NodeFailureConfig,
    cluster: Arc<dyn ClusterClient>,
    executor: Arc<dyn RemoteExecutor>,
    provider: String,
    /// Nodes failed in this run; never selected again
    killed: HashSet<String>,
    rng: StdRng,
    metrics: Option<HarnessMetrics>,
}

impl NodeKiller {
    pub fn new(
        config: NodeFailureConfig,
        cluster: Arc<dyn ClusterClient>,
        executor: Arc<dyn RemoteExecutor>,
        provider: &str,
    ) -> Result<Self> {
        if !SUPPORTED_PROVIDERS.contains(&provider) {
            return Err(HarnessError::Config(format!(
                "provider {provider:?} is not supported by NodeKiller"
            )));
        }
        config.validate()?;
        Ok(Self {
            config,
            cluster,
            executor,
            provider: provider.to_string(),
            killed: HashSet::new(),
            rng: StdRng::from_entropy(),
            metrics: None,
        })
    }

    /// Deterministic node selection
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_metrics(mut self, metrics: HarnessMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Names of every node failed so far
    pub fn killed(&self) -> &HashSet<String> {
        &self.killed
    }

    /// Run rounds until `stop` fires; returns every completed round
    pub async fn run(&mut self, stop: StopSignal) -> Vec<ChaosRound> {
        info!(provider = %self.provider, config = ?self.config, "NodeKiller started");
        let mut history = Vec::new();

        // The first round waits one jittered interval too
        let first = jittered(self.config.interval, self.config.jitter_factor);
        tokio::select! {
            _ = sleep(first) => {}
            _ = stop.wait() => {
                info!("NodeKiller stopped before the first round");
                return history;
            }
        }

        let mut poller = Poller::new(self.config.interval)
            .jitter(self.config.jitter_factor)
            .stop_on(stop)
            .immediate();
        while poller.tick().await == Tick::Ready {
            if let Some(round) = self.round().await {
                history.push(round);
            }
        }

        info!(rounds = history.len(), killed = self.killed.len(), "NodeKiller stopped");
        history
    }

    /// Select and fail one batch of nodes; `None` when selection failed
    pub async fn round(&mut self) -> Option<ChaosRound> {
        let nodes = match self.pick_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(error = %e, "NodeKiller: unable to pick nodes to kill");
                return None;
            }
        };

        let timestamp = Utc::now();
        let outcomes = self.kill(&nodes).await;
        let round = ChaosRound {
            timestamp,
            nodes: nodes.into_iter().map(|n| n.name).collect(),
            outcomes,
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_chaos_round(round.nodes.len(), round.failures());
        }
        Some(round)
    }

    async fn pick_nodes(&mut self) -> Result<Vec<PhysicalNode>> {
        let all = self.cluster.list_nodes().await.map_err(HarnessError::cluster)?;
        let candidates = schedulable_untainted_nodes(all);

        let selector = Selector::new(Some(MONITORING_NAMESPACE.to_string()), PROMETHEUS_LABEL, "");
        let monitoring = self
            .cluster
            .list_pods(&selector)
            .await
            .map_err(HarnessError::cluster)?;

        let mut excluded = self.killed.clone();
        excluded.extend(
            monitoring
                .into_iter()
                .filter(|p| p.is_scheduled())
                .map(|p| p.node_name),
        );

        Ok(select_nodes(
            candidates,
            &excluded,
            self.config.failure_rate,
            &mut self.rng,
        ))
    }

    /// Fail every node concurrently and wait for all of them
    async fn kill(&mut self, nodes: &[PhysicalNode]) -> Vec<NodeOutcome> {
        // Marked before the fan-out; workers never read the set
        self.killed.extend(nodes.iter().map(|n| n.name.clone()));

        let started = Instant::now();
        let mut group = TaskGroup::new();
        for node in nodes {
            let executor = self.executor.clone();
            let downtime = self.config.simulated_downtime;
            let node = node.clone();
            group.spawn(node.name.clone(), async move {
                info!(node = %node.name, "NodeKiller: stopping docker and kubelet to simulate failure");
                executor
                    .run(STOP_COMMAND, &node)
                    .await
                    .map_err(|e| e.context(format!("stopping node {}", node.name)))?;

                sleep(downtime).await;

                info!(node = %node.name, "NodeKiller: rebooting to repair the node");
                executor
                    .run(REBOOT_COMMAND, &node)
                    .await
                    .map_err(|e| e.context(format!("rebooting node {}", node.name)))?;
                Ok(())
            });
        }

        let mut outcomes: BTreeMap<String, Option<String>> = nodes
            .iter()
            .map(|n| (n.name.clone(), None))
            .collect();
        for outcome in group.join_all().await {
            if let Err(e) = outcome.result {
                error!(node = %outcome.label, error = %format!("{e:#}"), "NodeKiller: node failure not applied");
                outcomes.insert(outcome.label, Some(format!("{e:#}")));
            }
        }
        info!(
            nodes = nodes.len(),
            elapsed = ?started.elapsed(),
            "NodeKiller: round finished"
        );

        outcomes
            .into_iter()
            .map(|(node, error)| NodeOutcome { node, error })
            .collect()
    }
}
