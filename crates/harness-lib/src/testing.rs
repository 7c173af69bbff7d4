//! In-memory collaborators for unit tests

use crate::cluster::{ClusterClient, ObjectApplier, PodEvent, PodEventStream, RemoteExecutor};
use crate::models::{PhysicalNode, Sample, Selector, WorkloadUnit};
use crate::query::{QueryClient, ScrapeTarget, TargetSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Default)]
pub struct FakeCluster {
    pub nodes: Mutex<Vec<PhysicalNode>>,
    pub pods: Mutex<Vec<WorkloadUnit>>,
    pub namespaces: Mutex<HashSet<String>>,
    pub fail_list_pods: AtomicBool,
    pub fail_list_nodes: AtomicBool,
    pub list_pods_calls: AtomicUsize,
    watch: Mutex<Option<mpsc::UnboundedReceiver<anyhow::Result<PodEvent>>>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(self, nodes: Vec<PhysicalNode>) -> Self {
        *self.nodes.lock().unwrap() = nodes;
        self
    }

    pub fn with_pods(self, pods: Vec<WorkloadUnit>) -> Self {
        *self.pods.lock().unwrap() = pods;
        self
    }

    /// Enable watching; events sent on the returned channel reach the tracker
    pub fn with_watch(self) -> (Self, mpsc::UnboundedSender<anyhow::Result<PodEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.watch.lock().unwrap() = Some(rx);
        (self, tx)
    }

    pub fn set_pods(&self, pods: Vec<WorkloadUnit>) {
        *self.pods.lock().unwrap() = pods;
    }

    pub fn update_pods(&self, f: impl FnOnce(&mut Vec<WorkloadUnit>)) {
        f(&mut self.pods.lock().unwrap());
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_nodes(&self) -> anyhow::Result<Vec<PhysicalNode>> {
        if self.fail_list_nodes.load(Ordering::SeqCst) {
            anyhow::bail!("node listing unavailable");
        }
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn list_pods(&self, selector: &Selector) -> anyhow::Result<Vec<WorkloadUnit>> {
        self.list_pods_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list_pods.load(Ordering::SeqCst) {
            anyhow::bail!("pod listing unavailable");
        }
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| selector.namespace.as_ref().map_or(true, |ns| *ns == p.namespace))
            .filter(|p| selector.matches_labels(&p.labels))
            .cloned()
            .collect())
    }

    async fn watch_pods(&self, _selector: &Selector) -> anyhow::Result<Option<PodEventStream>> {
        Ok(self
            .watch
            .lock()
            .unwrap()
            .take()
            .map(|rx| Box::pin(UnboundedReceiverStream::new(rx)) as PodEventStream))
    }

    async fn create_namespace(&self, name: &str) -> anyhow::Result<()> {
        self.namespaces.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> anyhow::Result<()> {
        self.namespaces.lock().unwrap().remove(name);
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.namespaces.lock().unwrap().contains(name))
    }
}

/// Returns canned samples for any query containing a registered fragment
#[derive(Default)]
pub struct FakeQueryClient {
    responses: Mutex<Vec<(String, Vec<Sample>)>>,
    failing: Mutex<Vec<String>>,
    pub queries: Mutex<Vec<String>>,
}

impl FakeQueryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, fragment: &str, samples: Vec<Sample>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push((fragment.to_string(), samples));
        self
    }

    pub fn fail_on(self, fragment: &str) -> Self {
        self.failing.lock().unwrap().push(fragment.to_string());
        self
    }

    pub fn issued(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryClient for FakeQueryClient {
    async fn query(&self, query: &str, _at: DateTime<Utc>) -> anyhow::Result<Vec<Sample>> {
        self.queries.lock().unwrap().push(query.to_string());
        if self.failing.lock().unwrap().iter().any(|f| query.contains(f)) {
            anyhow::bail!("query failed: {query}");
        }
        Ok(self
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(fragment, _)| query.contains(fragment.as_str()))
            .map(|(_, samples)| samples.clone())
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeTargets {
    pub targets: Mutex<Vec<ScrapeTarget>>,
}

#[async_trait]
impl TargetSource for FakeTargets {
    async fn targets(&self) -> anyhow::Result<Vec<ScrapeTarget>> {
        Ok(self.targets.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeApplier {
    pub applied: Mutex<Vec<(String, Map<String, Value>)>>,
}

#[async_trait]
impl ObjectApplier for FakeApplier {
    async fn apply_manifests(
        &self,
        path_pattern: &str,
        mapping: &Map<String, Value>,
    ) -> anyhow::Result<()> {
        self.applied
            .lock()
            .unwrap()
            .push((path_pattern.to_string(), mapping.clone()));
        Ok(())
    }
}

/// Records commands; fails on selected nodes
#[derive(Default)]
pub struct FakeExecutor {
    pub calls: Mutex<Vec<(String, String)>>,
    pub failing_nodes: Mutex<HashSet<String>>,
    pub delay: Option<Duration>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(self, node: &str) -> Self {
        self.failing_nodes.lock().unwrap().insert(node.to_string());
        self
    }

    pub fn commands_for(&self, node: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == node)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn run(&self, command: &str, node: &PhysicalNode) -> anyhow::Result<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls
            .lock()
            .unwrap()
            .push((node.name.clone(), command.to_string()));
        if self.failing_nodes.lock().unwrap().contains(&node.name) {
            anyhow::bail!("ssh to {} failed", node.name);
        }
        Ok(String::new())
    }
}
