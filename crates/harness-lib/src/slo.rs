//! API call latency objectives
//!
//! Latency and count samples are grouped per `(resource, subresource, verb,
//! scope)`; each group is checked against the threshold for its verb and
//! scope. Every breach is collected into one aggregate violation.

use crate::error::{MetricViolationError, Result, ViolationSet};
use crate::models::Sample;
use crate::stats::{parse_quantile, seconds_to_duration, DataItem, LatencyMetric, PerfData};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{info, warn};

/// Number of slowest calls always logged
pub const TOP_TO_PRINT: usize = 5;

/// Latency objectives by call kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SloThresholds {
    /// Single-object calls (anything but LIST)
    #[serde(with = "humantime_serde")]
    pub resource: Duration,
    /// Namespace-scoped LIST
    #[serde(with = "humantime_serde")]
    pub namespace: Duration,
    /// Cluster-scoped LIST
    #[serde(with = "humantime_serde")]
    pub cluster: Duration,
}

impl Default for SloThresholds {
    fn default() -> Self {
        Self {
            resource: Duration::from_secs(1),
            namespace: Duration::from_secs(5),
            cluster: Duration::from_secs(30),
        }
    }
}

impl SloThresholds {
    pub fn threshold_for(&self, verb: &str, scope: &str) -> Duration {
        if verb != "LIST" {
            self.resource
        } else if scope == "cluster" {
            self.cluster
        } else {
            self.namespace
        }
    }
}

/// Grouping key of an API call
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApiCallKey {
    pub resource: String,
    pub subresource: String,
    pub verb: String,
    pub scope: String,
}

impl ApiCallKey {
    fn from_sample(sample: &Sample) -> Self {
        let get = |k: &str| sample.label(k).unwrap_or_default().to_string();
        Self {
            resource: get("resource"),
            subresource: get("subresource"),
            verb: get("verb"),
            scope: get("scope"),
        }
    }
}

/// Latency percentiles and call count for one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCall {
    #[serde(flatten)]
    pub key: ApiCallKey,
    pub latency: LatencyMetric,
    pub count: u64,
}

/// Merge latency samples (tagged with `quantile`) and count samples per key.
/// Zero counts are skipped.
pub fn group_api_calls(latency: &[Sample], counts: &[Sample]) -> Result<Vec<ApiCall>> {
    let mut calls: HashMap<ApiCallKey, ApiCall> = HashMap::new();

    for sample in latency {
        let q = parse_quantile(sample)?;
        let key = ApiCallKey::from_sample(sample);
        let Some(value) = seconds_to_duration(sample.value) else {
            warn!(
                resource = %key.resource,
                subresource = %key.subresource,
                verb = %key.verb,
                scope = %key.scope,
                quantile = q,
                value = sample.value,
                "Skipping invalid latency sample"
            );
            continue;
        };
        slot(&mut calls, key).latency.set_quantile(q, value);
    }

    for sample in counts {
        let count = sample.value.round();
        if count.is_nan() || count <= 0.0 {
            continue;
        }
        slot(&mut calls, ApiCallKey::from_sample(sample)).count = count as u64;
    }

    Ok(calls.into_values().collect())
}

fn slot(calls: &mut HashMap<ApiCallKey, ApiCall>, key: ApiCallKey) -> &mut ApiCall {
    calls.entry(key.clone()).or_insert_with(|| ApiCall {
        key,
        latency: LatencyMetric::default(),
        count: 0,
    })
}

/// Sort calls by descending p99, log the slowest and every breach, and
/// collect breaches into one violation
pub fn verify_api_calls(
    measurement: &str,
    calls: &mut [ApiCall],
    thresholds: &SloThresholds,
) -> Option<MetricViolationError> {
    calls.sort_by(|a, b| b.latency.perc99.cmp(&a.latency.perc99));

    let mut violations = ViolationSet::new();
    for (rank, call) in calls.iter().enumerate() {
        let threshold = thresholds.threshold_for(&call.key.verb, &call.key.scope);
        let breach = call.latency.verify_threshold(threshold);
        let is_bad = breach.is_some();
        if let Some(msg) = breach {
            violations.push(msg);
        }
        if rank < TOP_TO_PRINT || is_bad {
            let prefix = if is_bad { "WARNING " } else { "" };
            info!(
                measurement = %measurement,
                resource = %call.key.resource,
                subresource = %call.key.subresource,
                verb = %call.key.verb,
                scope = %call.key.scope,
                count = call.count,
                perc99 = ?call.latency.perc99,
                threshold = ?threshold,
                "{prefix}Top latency metric"
            );
        }
    }

    violations.into_error("top latency metric", |v| {
        format!("there should be no high-latency requests, but: {v:?}")
    })
}

/// One data item per call, labeled with its key and count
pub fn api_calls_to_perf_data(calls: &[ApiCall]) -> PerfData {
    let items = calls
        .iter()
        .map(|call| {
            let labels = BTreeMap::from([
                ("Resource".to_string(), call.key.resource.clone()),
                ("Subresource".to_string(), call.key.subresource.clone()),
                ("Verb".to_string(), call.key.verb.clone()),
                ("Scope".to_string(), call.key.scope.clone()),
                ("Count".to_string(), call.count.to_string()),
            ]);
            call.latency.to_data_item(labels)
        })
        .collect::<Vec<DataItem>>();
    PerfData::new(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latency(resource: &str, verb: &str, scope: &str, q: &str, secs: f64) -> Sample {
        Sample::new("lat", secs)
            .with_label("resource", resource)
            .with_label("verb", verb)
            .with_label("scope", scope)
            .with_label("quantile", q)
    }

    fn count(resource: &str, verb: &str, scope: &str, n: f64) -> Sample {
        Sample::new("count", n)
            .with_label("resource", resource)
            .with_label("verb", verb)
            .with_label("scope", scope)
    }

    #[test]
    fn test_threshold_selection() {
        let t = SloThresholds::default();
        assert_eq!(t.threshold_for("GET", "namespace"), Duration::from_secs(1));
        assert_eq!(t.threshold_for("LIST", "cluster"), Duration::from_secs(30));
        assert_eq!(t.threshold_for("LIST", "namespace"), Duration::from_secs(5));
        assert_eq!(t.threshold_for("LIST", "resource"), Duration::from_secs(5));
    }

    #[test]
    fn test_grouping_merges_quantiles_and_counts() {
        let lat = vec![
            latency("pods", "GET", "namespace", "0.50", 0.01),
            latency("pods", "GET", "namespace", "0.99", 0.2),
            latency("nodes", "LIST", "cluster", "0.99", 2.0),
        ];
        let counts = vec![
            count("pods", "GET", "namespace", 41.6),
            count("nodes", "LIST", "cluster", 0.2),
            count("secrets", "GET", "namespace", 0.0),
        ];

        let mut calls = group_api_calls(&lat, &counts).unwrap();
        calls.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(calls.len(), 2);

        let nodes = &calls[0];
        assert_eq!(nodes.key.resource, "nodes");
        assert_eq!(nodes.count, 0);

        let pods = &calls[1];
        assert_eq!(pods.count, 42);
        assert_eq!(pods.latency.perc50, Duration::from_millis(10));
        assert_eq!(pods.latency.perc99, Duration::from_millis(200));
    }

    #[test]
    fn test_grouping_skips_non_finite_latency() {
        let lat = vec![
            latency("pods", "GET", "namespace", "0.99", 0.2),
            latency("nodes", "GET", "namespace", "0.99", f64::NAN),
            latency("nodes", "GET", "namespace", "0.50", 0.05),
            latency("secrets", "GET", "namespace", "0.99", f64::INFINITY),
        ];
        let counts = vec![count("secrets", "GET", "namespace", f64::NAN)];

        let mut calls = group_api_calls(&lat, &counts).unwrap();
        calls.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(calls.len(), 2);

        assert_eq!(calls[0].key.resource, "nodes");
        assert_eq!(calls[0].latency.perc50, Duration::from_millis(50));
        assert_eq!(calls[0].latency.perc99, Duration::ZERO);
        assert_eq!(calls[1].key.resource, "pods");
        assert_eq!(calls[1].latency.perc99, Duration::from_millis(200));
    }

    #[test]
    fn test_verify_sorts_and_aggregates() {
        let lat = vec![
            latency("pods", "GET", "namespace", "0.99", 1.5),
            latency("nodes", "LIST", "cluster", "0.99", 10.0),
            latency("configmaps", "LIST", "namespace", "0.99", 6.0),
        ];
        let mut calls = group_api_calls(&lat, &[]).unwrap();
        let violation = verify_api_calls("test", &mut calls, &SloThresholds::default());

        assert_eq!(calls[0].key.resource, "nodes");
        assert_eq!(calls[2].key.resource, "pods");

        let violation = violation.unwrap();
        assert_eq!(violation.subject, "top latency metric");
        // nodes LIST cluster is under 30s; the other two breach
        assert!(violation.message.contains("got 1.5s"));
        assert!(violation.message.contains("got 6s"));
        assert!(!violation.message.contains("got 10s"));
    }

    #[test]
    fn test_no_breach_no_violation() {
        let lat = vec![latency("pods", "GET", "namespace", "0.99", 0.25)];
        let mut calls = group_api_calls(&lat, &[]).unwrap();
        assert!(verify_api_calls("test", &mut calls, &SloThresholds::default()).is_none());

        let perf = api_calls_to_perf_data(&calls);
        assert_eq!(perf.data_items[0].labels["Verb"], "GET");
        assert_eq!(perf.data_items[0].data["Perc99"], 250.0);
    }
}
