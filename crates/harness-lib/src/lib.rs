//! Measurement and fault-injection engine for cluster load tests
//!
//! This crate provides the core functionality for:
//! - Tracking pod lifecycles and waiting for readiness
//! - Stateful measurements started and gathered around a load phase
//! - Percentile aggregation and SLO verification
//! - Periodic node failure injection
//! - Run status and observability

pub mod chaos;
pub mod cluster;
pub mod error;
pub mod measurement;
pub mod models;
pub mod observability;
pub mod poll;
pub mod query;
pub mod slo;
pub mod stats;
pub mod status;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;

pub use chaos::{select_nodes, ChaosRound, NodeFailureConfig, NodeKiller, NodeOutcome};
pub use cluster::{ClusterClient, ObjectApplier, PodEvent, PodEventStream, RemoteExecutor};
pub use error::{HarnessError, MetricViolationError, Result};
pub use measurement::{
    HarnessContext, Measurement, MeasurementConfig, MeasurementOutput, MeasurementRegistry,
    Params, Summary,
};
pub use models::*;
pub use observability::{HarnessMetrics, StructuredLogger};
pub use query::{QueryClient, ScrapeTarget, TargetSource};
pub use status::{MeasurementState, ReadinessResponse, RunPhase, StatusRegistry, StatusResponse};
pub use tracker::{wait_for_pods, PodTracker, PodsStatus, Snapshot, WaitForPodsOptions};
