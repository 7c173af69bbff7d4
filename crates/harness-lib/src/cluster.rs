//! Collaborator interfaces to the orchestrated cluster
//!
//! The library never talks to the cluster directly. Adapters implement:
//! - `ClusterClient` for node, pod and namespace access
//! - `ObjectApplier` for applying rendered manifests
//! - `RemoteExecutor` for running commands on nodes

use crate::models::{PhysicalNode, PodKey, Selector, WorkloadUnit};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::pin::Pin;
use tokio_stream::Stream;

/// A change observed on the pod watch stream
#[derive(Debug, Clone)]
pub enum PodEvent {
    /// Pod created or updated
    Applied(WorkloadUnit),
    /// Pod removed
    Deleted(PodKey),
    /// Watch restarted; the full current set
    Restarted(Vec<WorkloadUnit>),
}

pub type PodEventStream = Pin<Box<dyn Stream<Item = anyhow::Result<PodEvent>> + Send>>;

/// Trait for orchestration API access
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_nodes(&self) -> anyhow::Result<Vec<PhysicalNode>>;

    async fn list_pods(&self, selector: &Selector) -> anyhow::Result<Vec<WorkloadUnit>>;

    /// Stream pod changes. `None` when the client cannot watch, in which
    /// case trackers fall back to periodic listing.
    async fn watch_pods(&self, _selector: &Selector) -> anyhow::Result<Option<PodEventStream>> {
        Ok(None)
    }

    async fn create_namespace(&self, name: &str) -> anyhow::Result<()>;

    async fn delete_namespace(&self, name: &str) -> anyhow::Result<()>;

    async fn namespace_exists(&self, name: &str) -> anyhow::Result<bool>;
}

/// Applies manifests matching a path pattern, templated with `mapping`
#[async_trait]
pub trait ObjectApplier: Send + Sync {
    async fn apply_manifests(
        &self,
        path_pattern: &str,
        mapping: &Map<String, Value>,
    ) -> anyhow::Result<()>;
}

/// Runs a shell command on a node and returns its output
///
/// Calls are not cancelled once issued.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(&self, command: &str, node: &PhysicalNode) -> anyhow::Result<String>;
}

/// Nodes new pods can land on: schedulable, ready, and free of
/// `NoSchedule`/`NoExecute` taints
pub fn schedulable_untainted_nodes(nodes: Vec<PhysicalNode>) -> Vec<PhysicalNode> {
    nodes
        .into_iter()
        .filter(|n| n.schedulable && n.ready && !n.taints.iter().any(|t| t.blocks_scheduling()))
        .collect()
}

/// Control-plane detection by role label or the legacy name suffix
pub fn is_master_node(node: &PhysicalNode) -> bool {
    node.labels.contains_key("node-role.kubernetes.io/control-plane")
        || node.labels.contains_key("node-role.kubernetes.io/master")
        || node.name.ends_with("master")
}
