//! Metrics backend interfaces
//!
//! `QueryClient` evaluates instant queries; `TargetSource` lists scrape
//! targets. Both are implemented over the Prometheus HTTP API by the binary.

use crate::models::Sample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Executes an instant query and returns labeled samples
#[async_trait]
pub trait QueryClient: Send + Sync {
    async fn query(&self, query: &str, at: DateTime<Utc>) -> anyhow::Result<Vec<Sample>>;
}

/// A scrape target of the metrics backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeTarget {
    pub labels: BTreeMap<String, String>,
    pub healthy: bool,
}

impl ScrapeTarget {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

#[async_trait]
pub trait TargetSource: Send + Sync {
    async fn targets(&self) -> anyhow::Result<Vec<ScrapeTarget>>;
}

/// Render a duration as a PromQL range, in whole seconds
pub fn to_prometheus_duration(d: Duration) -> String {
    format!("{}s", d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_duration() {
        assert_eq!(to_prometheus_duration(Duration::from_secs(300)), "300s");
        assert_eq!(to_prometheus_duration(Duration::from_millis(61_900)), "61s");
    }
}
