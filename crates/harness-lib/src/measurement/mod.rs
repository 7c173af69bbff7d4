//! Stateful measurements run around a load phase
//!
//! A measurement is created from the `MeasurementRegistry`, started with
//! `action: start`, left to collect in the background and finally gathered
//! with `action: gather`. Gathering returns its summaries together with an
//! optional SLO violation so callers never lose a valid result.

mod api_responsiveness;
mod metrics_for_e2e;
mod params;
mod probes;
mod registry;
mod resource_usage;
mod scheduling_throughput;


pub use api_responsiveness::ApiResponsiveness;
pub use metrics_for_e2e::{MetricsCollection, MetricsForE2E, MetricsGrabber, PrometheusGrabber};
pub use params::Params;
pub use probes::{Probe, ProbeConfig};
pub use registry::{factory, MeasurementFactory, MeasurementRegistry};
pub use resource_usage::{ContainerUsage, PrometheusUsageSource, ResourceUsageSummary, UsageSource};
pub use scheduling_throughput::SchedulingThroughput;

use crate::cluster::{ClusterClient, ObjectApplier};
use crate::error::{HarnessError, MetricViolationError, Result};
use crate::query::{QueryClient, TargetSource};
use crate::stats::PerfData;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Named JSON result of a measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub name: String,
    pub content: serde_json::Value,
}

impl Summary {
    /// Statistical summary with `{version, dataItems}` content
    pub fn perf(name: impl Into<String>, perf: &PerfData) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            content: serde_json::to_value(perf)?,
        })
    }

    /// Flat JSON summary
    pub fn raw(name: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            content,
        }
    }

    pub fn to_pretty_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.content)?)
    }
}

/// What `execute` produced
#[derive(Debug, Clone, Default)]
pub struct MeasurementOutput {
    pub summaries: Vec<Summary>,
    /// Set when the data breached an objective; summaries are still valid
    pub violation: Option<MetricViolationError>,
}

impl MeasurementOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn summary(summary: Summary) -> Self {
        Self {
            summaries: vec![summary],
            violation: None,
        }
    }

    pub fn with_violation(mut self, violation: Option<MetricViolationError>) -> Self {
        self.violation = violation;
        self
    }

    /// Fold the violation into an error, discarding the summaries
    pub fn into_result(self) -> Result<Vec<Summary>> {
        match self.violation {
            Some(v) => Err(HarnessError::MetricViolation(v)),
            None => Ok(self.summaries),
        }
    }
}

/// Lifecycle action of a measurement step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Gather,
}

impl Action {
    pub fn from_params(params: &Params) -> Result<Self> {
        match params.get_string("action")?.as_str() {
            "start" => Ok(Action::Start),
            "gather" => Ok(Action::Gather),
            other => Err(HarnessError::Config(format!("unknown action {other}"))),
        }
    }
}

/// Collaborators shared by every measurement of a run
#[derive(Clone)]
pub struct HarnessContext {
    pub cluster: Arc<dyn ClusterClient>,
    pub applier: Option<Arc<dyn ObjectApplier>>,
    pub query_client: Option<Arc<dyn QueryClient>>,
    pub targets: Option<Arc<dyn TargetSource>>,
    pub usage_source: Option<Arc<dyn UsageSource>>,
    pub grabber: Option<Arc<dyn MetricsGrabber>>,
    /// Cloud provider name, e.g. `gce`, `gke`, `kubemark`
    pub provider: String,
    /// Root directory of probe manifests
    pub manifests_root: PathBuf,
}

impl HarnessContext {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            cluster,
            applier: None,
            query_client: None,
            targets: None,
            usage_source: None,
            grabber: None,
            provider: String::new(),
            manifests_root: PathBuf::from("manifests"),
        }
    }

    pub fn with_applier(mut self, applier: Arc<dyn ObjectApplier>) -> Self {
        self.applier = Some(applier);
        self
    }

    pub fn with_query_client(mut self, client: Arc<dyn QueryClient>) -> Self {
        self.query_client = Some(client);
        self
    }

    pub fn with_targets(mut self, targets: Arc<dyn TargetSource>) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn with_usage_source(mut self, source: Arc<dyn UsageSource>) -> Self {
        self.usage_source = Some(source);
        self
    }

    pub fn with_grabber(mut self, grabber: Arc<dyn MetricsGrabber>) -> Self {
        self.grabber = Some(grabber);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_manifests_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.manifests_root = root.into();
        self
    }

    pub fn is_kubemark(&self) -> bool {
        self.provider.eq_ignore_ascii_case("kubemark")
    }

    pub(crate) fn require_query_client(&self, who: &str) -> Result<Arc<dyn QueryClient>> {
        self.query_client
            .clone()
            .ok_or_else(|| HarnessError::Setup(format!("{who}: no metrics query client configured")))
    }
}

/// Parameters of one `execute` call plus the run's collaborators
#[derive(Clone)]
pub struct MeasurementConfig {
    pub params: Params,
    pub context: Arc<HarnessContext>,
}

impl MeasurementConfig {
    pub fn new(params: Params, context: Arc<HarnessContext>) -> Self {
        Self { params, context }
    }
}

/// A stateful measurement
#[async_trait]
pub trait Measurement: Send {
    /// Run the action named by the `action` parameter
    async fn execute(&mut self, config: &MeasurementConfig) -> Result<MeasurementOutput>;

    /// Release background resources; no-op when never started
    async fn dispose(&mut self);

    fn name(&self) -> &'static str;
}
