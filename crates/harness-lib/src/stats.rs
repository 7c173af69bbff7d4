//! Statistical aggregation of collected samples
//!
//! Percentiles use the nearest-rank rule: sort ascending and take index
//! `ceil(p * n / 100) - 1`, clamped to the valid range.

use crate::error::{HarnessError, Result};
use crate::models::Sample;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

/// Version tag on every statistical summary
pub const PERF_DATA_VERSION: &str = "v1";

/// Nearest-rank index for percentile `p` over `n` sorted values
pub fn percentile_index(p: f64, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let rank = (p * n as f64 / 100.0).ceil() as i64 - 1;
    rank.clamp(0, n as i64 - 1) as usize
}

/// Percentile `p` (0-100) of `values`; `None` for empty input
pub fn percentile(p: f64, values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(sorted[percentile_index(p, sorted.len())])
}

/// Percentile over already sorted values
pub fn percentile_sorted(p: f64, sorted: &[f64]) -> Option<f64> {
    sorted.get(percentile_index(p, sorted.len())).copied()
}

pub fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// One entry of a statistical summary
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataItem {
    pub data: BTreeMap<String, f64>,
    pub unit: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl DataItem {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            ..Default::default()
        }
    }

    pub fn with_value(mut self, key: impl Into<String>, value: f64) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Statistical summary content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfData {
    pub version: String,
    #[serde(rename = "dataItems")]
    pub data_items: Vec<DataItem>,
}

impl PerfData {
    pub fn new(data_items: Vec<DataItem>) -> Self {
        Self {
            version: PERF_DATA_VERSION.to_string(),
            data_items,
        }
    }
}

/// Latency at the 50th, 90th and 99th percentile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LatencyMetric {
    #[serde(with = "humantime_serde")]
    pub perc50: Duration,
    #[serde(with = "humantime_serde")]
    pub perc90: Duration,
    #[serde(with = "humantime_serde")]
    pub perc99: Duration,
}

impl LatencyMetric {
    /// Store `latency` under quantile `q` (0-1); other quantiles are ignored
    pub fn set_quantile(&mut self, q: f64, latency: Duration) {
        const EPS: f64 = 1e-9;
        if (q - 0.5).abs() < EPS {
            self.perc50 = latency;
        } else if (q - 0.9).abs() < EPS {
            self.perc90 = latency;
        } else if (q - 0.99).abs() < EPS {
            self.perc99 = latency;
        }
    }

    /// Build from samples tagged with a `quantile` label, values in seconds
    pub fn from_samples(samples: &[Sample]) -> Result<Self> {
        let mut metric = LatencyMetric::default();
        for sample in samples {
            let q = parse_quantile(sample)?;
            match seconds_to_duration(sample.value) {
                Some(latency) => metric.set_quantile(q, latency),
                None => warn!(
                    metric = %sample.metric,
                    quantile = q,
                    value = sample.value,
                    "Skipping invalid latency sample"
                ),
            }
        }
        Ok(metric)
    }

    /// Describe the breach when p99 exceeds `threshold`
    pub fn verify_threshold(&self, threshold: Duration) -> Option<String> {
        (self.perc99 > threshold).then(|| {
            format!(
                "too high latency 99th percentile: got {:?} expected: {:?}",
                self.perc99, threshold
            )
        })
    }

    /// Milliseconds per percentile
    pub fn to_data_item(&self, labels: BTreeMap<String, String>) -> DataItem {
        DataItem {
            data: BTreeMap::from([
                ("Perc50".to_string(), as_millis(self.perc50)),
                ("Perc90".to_string(), as_millis(self.perc90)),
                ("Perc99".to_string(), as_millis(self.perc99)),
            ]),
            unit: "ms".to_string(),
            labels,
        }
    }
}

/// Read the `quantile` label of a sample
pub fn parse_quantile(sample: &Sample) -> Result<f64> {
    let raw = sample.label("quantile").ok_or_else(|| {
        HarnessError::Query(format!("sample of {} has no quantile label", sample.metric))
    })?;
    raw.parse::<f64>()
        .map_err(|_| HarnessError::Query(format!("malformed quantile label {raw:?}")))
}

/// Convert a latency in seconds into a duration; `None` for NaN, infinities
/// and negatives
pub fn seconds_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

fn as_millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_percentile_nearest_rank() {
        let v = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(percentile(50.0, &v), Some(2.0));
        assert_eq!(percentile(90.0, &v), Some(4.0));
        assert_eq!(percentile(100.0, &v), Some(4.0));
        assert_eq!(percentile(25.0, &v), Some(1.0));
    }

    #[test]
    fn test_percentile_clamps_low_p() {
        assert_eq!(percentile_index(0.0, 5), 0);
        assert_eq!(percentile(1.0, &[7.0]), Some(7.0));
        assert_eq!(percentile(0.0, &[3.0, 9.0]), Some(3.0));
    }

    #[test]
    fn test_percentile_empty() {
        assert_eq!(percentile(50.0, &[]), None);
        assert_eq!(average(&[]), 0.0);
    }

    #[test]
    fn test_latency_from_samples() {
        let samples = vec![
            Sample::new("lat", 0.1).with_label("quantile", "0.50"),
            Sample::new("lat", 0.4).with_label("quantile", "0.90"),
            Sample::new("lat", 1.5).with_label("quantile", "0.99"),
            Sample::new("lat", 9.0).with_label("quantile", "0.75"),
        ];
        let m = LatencyMetric::from_samples(&samples).unwrap();
        assert_eq!(m.perc50, Duration::from_millis(100));
        assert_eq!(m.perc90, Duration::from_millis(400));
        assert_eq!(m.perc99, Duration::from_millis(1500));

        assert!(m.verify_threshold(Duration::from_secs(2)).is_none());
        assert!(m.verify_threshold(Duration::from_secs(1)).is_some());

        let item = m.to_data_item(BTreeMap::new());
        assert_eq!(item.unit, "ms");
        assert_eq!(item.data["Perc99"], 1500.0);
    }

    #[test]
    fn test_missing_quantile_label_is_error() {
        let samples = vec![Sample::new("lat", 0.1)];
        assert!(LatencyMetric::from_samples(&samples).is_err());

        let samples = vec![Sample::new("lat", 0.1).with_label("quantile", "p99")];
        assert!(LatencyMetric::from_samples(&samples).is_err());
    }

    #[test]
    fn test_non_finite_latency_is_skipped() {
        let samples = vec![
            Sample::new("lat", 0.1).with_label("quantile", "0.50"),
            Sample::new("lat", f64::NAN).with_label("quantile", "0.90"),
            Sample::new("lat", f64::INFINITY).with_label("quantile", "0.99"),
            Sample::new("lat", -0.5).with_label("quantile", "0.99"),
            Sample::new("lat", f64::NEG_INFINITY).with_label("quantile", "0.99"),
        ];
        let m = LatencyMetric::from_samples(&samples).unwrap();
        assert_eq!(m.perc50, Duration::from_millis(100));
        assert_eq!(m.perc90, Duration::ZERO);
        assert_eq!(m.perc99, Duration::ZERO);

        assert_eq!(seconds_to_duration(0.25), Some(Duration::from_millis(250)));
        assert_eq!(seconds_to_duration(f64::NAN), None);
    }

    #[test]
    fn test_perf_data_shape() {
        let perf = PerfData::new(vec![DataItem::new("1/s").with_value("Average", 2.0)]);
        let json = serde_json::to_value(&perf).unwrap();
        assert_eq!(json["version"], "v1");
        assert_eq!(json["dataItems"][0]["data"]["Average"], 2.0);
        assert!(json["dataItems"][0].get("labels").is_none());
    }

    proptest! {
        #[test]
        fn prop_p100_is_max(values in prop::collection::vec(-1e6f64..1e6, 1..200)) {
            let max = values.iter().cloned().fold(f64::MIN, f64::max);
            prop_assert_eq!(percentile(100.0, &values), Some(max));
        }

        #[test]
        fn prop_percentile_is_a_member(
            values in prop::collection::vec(0f64..1e3, 1..100),
            p in 0f64..=100.0,
        ) {
            let got = percentile(p, &values).unwrap();
            prop_assert!(values.contains(&got));
        }
    }
}
