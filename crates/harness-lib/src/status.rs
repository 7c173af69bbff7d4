//! Run status tracking for liveness and readiness endpoints
//!
//! The registry records the phase of the measurement plan and the last known
//! state of every measurement instance.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Phase of the measurement plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Initializing,
    Starting,
    Running,
    Gathering,
    Finished,
}

impl RunPhase {
    /// True once every measurement has been asked to start
    pub fn is_started(&self) -> bool {
        !matches!(self, RunPhase::Initializing | RunPhase::Starting)
    }
}

/// Last known state of one measurement instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "message")]
pub enum MeasurementState {
    Pending,
    Running,
    Gathered,
    /// Gathered with a breached objective
    Violated(String),
    Failed(String),
}

impl MeasurementState {
    pub fn is_failed(&self) -> bool {
        matches!(self, MeasurementState::Failed(_))
    }
}

/// Status snapshot served by `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub phase: RunPhase,
    pub healthy: bool,
    pub measurements: HashMap<String, MeasurementState>,
    pub chaos_rounds: usize,
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug)]
struct RunStatus {
    phase: RunPhase,
    measurements: HashMap<String, MeasurementState>,
    chaos_rounds: usize,
}

/// Shared run status
#[derive(Debug, Clone)]
pub struct StatusRegistry {
    inner: Arc<RwLock<RunStatus>>,
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RunStatus {
                phase: RunPhase::Initializing,
                measurements: HashMap::new(),
                chaos_rounds: 0,
            })),
        }
    }

    /// Register a measurement identifier as pending
    pub async fn register(&self, identifier: &str) {
        self.set_measurement(identifier, MeasurementState::Pending).await;
    }

    pub async fn set_measurement(&self, identifier: &str, state: MeasurementState) {
        let mut status = self.inner.write().await;
        status.measurements.insert(identifier.to_string(), state);
    }

    pub async fn set_phase(&self, phase: RunPhase) {
        self.inner.write().await.phase = phase;
    }

    pub async fn record_chaos_round(&self) {
        self.inner.write().await.chaos_rounds += 1;
    }

    pub async fn status(&self) -> StatusResponse {
        let status = self.inner.read().await;
        StatusResponse {
            phase: status.phase,
            healthy: !status.measurements.values().any(MeasurementState::is_failed),
            measurements: status.measurements.clone(),
            chaos_rounds: status.chaos_rounds,
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let phase = self.inner.read().await.phase;
        if phase.is_started() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some("Measurement plan not started yet".to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_state() {
        let registry = StatusRegistry::new();
        let status = registry.status().await;

        assert_eq!(status.phase, RunPhase::Initializing);
        assert!(status.healthy);
        assert!(status.measurements.is_empty());
        assert!(!registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_failed_measurement_is_unhealthy() {
        let registry = StatusRegistry::new();
        registry.register("throughput").await;
        registry
            .set_measurement("latency", MeasurementState::Violated("too slow".into()))
            .await;
        assert!(registry.status().await.healthy);

        registry
            .set_measurement("throughput", MeasurementState::Failed("boom".into()))
            .await;
        assert!(!registry.status().await.healthy);
    }

    #[tokio::test]
    async fn test_ready_once_started() {
        let registry = StatusRegistry::new();
        registry.set_phase(RunPhase::Starting).await;
        assert!(!registry.readiness().await.ready);

        registry.set_phase(RunPhase::Running).await;
        assert!(registry.readiness().await.ready);
        registry.set_phase(RunPhase::Finished).await;
        assert!(registry.readiness().await.ready);
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_value(MeasurementState::Failed("x".into())).unwrap();
        assert_eq!(json, serde_json::json!({"state": "failed", "message": "x"}));
        let json = serde_json::to_value(MeasurementState::Running).unwrap();
        assert_eq!(json, serde_json::json!({"state": "running"}));
    }
}
