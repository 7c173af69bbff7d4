//! Core data models for the load harness

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle phase of a workload unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Parse a phase as reported by the orchestration API; anything
    /// unrecognized maps to `Unknown`.
    pub fn from_api(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// Terminal phases count as inactive for readiness accounting
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// Identity of a workload unit: `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A single observed pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadUnit {
    pub name: String,
    pub namespace: String,
    pub phase: PodPhase,
    /// Empty until the scheduler has assigned a node
    pub node_name: String,
    pub labels: BTreeMap<String, String>,
    /// Pod Ready condition
    pub ready: bool,
    /// Deletion has been requested
    pub terminating: bool,
}

impl WorkloadUnit {
    /// Convenience constructor used by adapters and tests
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, phase: PodPhase) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            phase,
            node_name: String::new(),
            labels: BTreeMap::new(),
            ready: phase == PodPhase::Running,
            terminating: false,
        }
    }

    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.node_name = node.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    pub fn key(&self) -> PodKey {
        PodKey::new(&self.namespace, &self.name)
    }

    pub fn is_scheduled(&self) -> bool {
        !self.node_name.is_empty()
    }
}

/// Node taint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub value: Option<String>,
    /// `NoSchedule`, `PreferNoSchedule` or `NoExecute`
    pub effect: String,
}

impl Taint {
    /// Whether this taint keeps new pods off the node
    pub fn blocks_scheduling(&self) -> bool {
        self.effect == "NoSchedule" || self.effect == "NoExecute"
    }
}

/// A physical (or virtual) machine of the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalNode {
    pub name: String,
    pub schedulable: bool,
    pub ready: bool,
    pub taints: Vec<Taint>,
    pub zone: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// Address used to reach the node for remote execution
    pub address: Option<String>,
}

impl PhysicalNode {
    /// A ready, schedulable node without taints
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schedulable: true,
            ready: true,
            taints: Vec::new(),
            zone: None,
            labels: BTreeMap::new(),
            address: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_taint(mut self, key: impl Into<String>, effect: impl Into<String>) -> Self {
        self.taints.push(Taint {
            key: key.into(),
            value: None,
            effect: effect.into(),
        });
        self
    }
}

/// Namespace plus label and field selectors
///
/// An absent namespace selects across all namespaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub namespace: Option<String>,
    pub label_selector: String,
    pub field_selector: String,
}

impl Selector {
    pub fn new(
        namespace: Option<String>,
        label_selector: impl Into<String>,
        field_selector: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()),
            label_selector: label_selector.into(),
            field_selector: field_selector.into(),
        }
    }

    /// Evaluate the equality-based subset of label selectors
    /// (`a=b`, `a==b`, `a!=b`, `a`, `!a`) against a label set.
    ///
    /// Used by in-memory cluster clients; real adapters forward the
    /// selector to the API server.
    pub fn matches_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        self.label_selector
            .split(',')
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .all(|term| {
                if let Some((k, v)) = term.split_once("!=") {
                    labels.get(k.trim()).map(String::as_str) != Some(v.trim())
                } else if let Some((k, v)) = term.split_once("==") {
                    labels.get(k.trim()).map(String::as_str) == Some(v.trim())
                } else if let Some((k, v)) = term.split_once('=') {
                    labels.get(k.trim()).map(String::as_str) == Some(v.trim())
                } else if let Some(k) = term.strip_prefix('!') {
                    !labels.contains_key(k.trim())
                } else {
                    labels.contains_key(term)
                }
            })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "namespace({}), labelSelector({}), fieldSelector({})",
            self.namespace.as_deref().unwrap_or(""),
            self.label_selector,
            self.field_selector
        )
    }
}

/// One labeled value returned by a time-series query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub metric: String,
    pub value: f64,
    pub labels: BTreeMap<String, String>,
}

impl Sample {
    pub fn new(metric: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            metric: metric.into(),
            value,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Per-container resource ceilings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceConstraint {
    /// CPU ceiling in cores
    pub cpu: f64,
    /// Memory ceiling in bytes
    pub memory: u64,
}

impl ResourceConstraint {
    /// Build a constraint where missing or zero ceilings are unbounded
    pub fn new(cpu: Option<f64>, memory: Option<u64>) -> Self {
        Self {
            cpu: cpu.filter(|c| *c != 0.0).unwrap_or(f64::MAX),
            memory: memory.filter(|m| *m != 0).unwrap_or(u64::MAX),
        }
    }
}

impl Default for ResourceConstraint {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Which nodes resource usage is sampled on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeSelection {
    #[default]
    All,
    Master,
    MasterAndDns,
}

impl NodeSelection {
    /// Parse the `nodeMode` parameter; unknown values select all nodes
    pub fn from_param(mode: &str) -> Self {
        match mode.to_ascii_lowercase().as_str() {
            "master" => NodeSelection::Master,
            "masteranddns" => NodeSelection::MasterAndDns,
            _ => NodeSelection::All,
        }
    }
}
