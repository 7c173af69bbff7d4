//! API call latency verification against the metrics backend

use super::{Action, Measurement, MeasurementConfig, MeasurementOutput, Summary};
use crate::error::{HarnessError, Result};
use crate::models::Sample;
use crate::query::{to_prometheus_duration, QueryClient};
use crate::slo::{api_calls_to_perf_data, group_api_calls, verify_api_calls, SloThresholds};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{error, info};

const FILTERS: &str = r#"resource!="events", verb!~"WATCH|WATCHLIST|PROXY|proxy|CONNECT""#;
const LATENCY_WINDOW: Duration = Duration::from_secs(5 * 60);
const MIN_LATENCY_RANGE: Duration = Duration::from_secs(60);
const SIMPLE_QUANTILES: [f64; 3] = [0.5, 0.9, 0.99];

fn latency_query(range: &str) -> String {
    format!(
        "quantile_over_time(0.99, apiserver:apiserver_request_latency_1m:histogram_quantile{{{FILTERS}}}[{range}])"
    )
}

fn simple_latency_query(quantile: f64, range: &str) -> String {
    format!(
        "histogram_quantile({quantile:.2}, sum(rate(apiserver_request_duration_seconds_bucket{{{FILTERS}}}[{range}])) \
         by (resource, subresource, verb, scope, le))"
    )
}

fn count_query(range: &str) -> String {
    format!(
        "sum(increase(apiserver_request_duration_seconds_count{{{FILTERS}}}[{range}])) \
         by (resource, subresource, scope, verb)"
    )
}

/// Verifies API server latency percentiles per call kind
#[derive(Default)]
pub struct ApiResponsiveness {
    started_at: Option<DateTime<Utc>>,
}

impl ApiResponsiveness {
    pub const NAME: &'static str = "APIResponsivenessPrometheus";

    pub fn new() -> Self {
        Self::default()
    }

    fn start(&mut self) -> Result<MeasurementOutput> {
        if self.started_at.is_some() {
            return Err(HarnessError::AlreadyRunning(Self::NAME.to_string()));
        }
        self.started_at = Some(Utc::now());
        info!(measurement = Self::NAME, "Measurement started");
        Ok(MeasurementOutput::empty())
    }

    async fn gather(&mut self, config: &MeasurementConfig) -> Result<MeasurementOutput> {
        let started_at = self
            .started_at
            .ok_or_else(|| HarnessError::NotRunning(Self::NAME.to_string()))?;
        let client = config.context.require_query_client(Self::NAME)?;
        let params = &config.params;

        let defaults = SloThresholds::default();
        let thresholds = SloThresholds {
            resource: params.get_duration_or_default("resourceThreshold", defaults.resource)?,
            namespace: params.get_duration_or_default("namespaceThreshold", defaults.namespace)?,
            cluster: params.get_duration_or_default("clusterThreshold", defaults.cluster)?,
        };
        let use_simple = params.get_bool_or_default("useSimpleLatencyQuery", false)?;
        let summary_name = params.get_string_or_default("summaryName", Self::NAME)?;

        let end = Utc::now();
        let duration = (end - started_at).to_std().unwrap_or_default();

        let (latency, counts) = gather_samples(client.as_ref(), end, duration, use_simple)
            .await
            .map_err(|e| {
                error!(measurement = Self::NAME, error = %e, "Samples gathering error");
                e
            })?;

        let mut calls = group_api_calls(&latency, &counts)?;
        let violation = verify_api_calls(Self::NAME, &mut calls, &thresholds);
        let summary = Summary::perf(summary_name, &api_calls_to_perf_data(&calls))?;
        Ok(MeasurementOutput::summary(summary).with_violation(violation))
    }
}

/// Latency samples tagged with `quantile`, and call counts
async fn gather_samples(
    client: &dyn QueryClient,
    end: DateTime<Utc>,
    duration: Duration,
    use_simple: bool,
) -> Result<(Vec<Sample>, Vec<Sample>)> {
    let mut latency = Vec::new();
    if use_simple {
        let range = to_prometheus_duration(duration);
        for q in SIMPLE_QUANTILES {
            let samples = client
                .query(&simple_latency_query(q, &range), end)
                .await
                .map_err(HarnessError::query)?;
            latency.extend(
                samples
                    .into_iter()
                    .map(|s| s.with_label("quantile", format!("{q:.2}"))),
            );
        }
    } else {
        // The recording rule aggregates over a 5m window; skip the warm-up
        let range = duration.saturating_sub(LATENCY_WINDOW).max(MIN_LATENCY_RANGE);
        latency = client
            .query(&latency_query(&to_prometheus_duration(range)), end)
            .await
            .map_err(HarnessError::query)?;
    }

    let counts = client
        .query(&count_query(&to_prometheus_duration(duration)), end)
        .await
        .map_err(HarnessError::query)?;
    Ok((latency, counts))
}

#[async_trait]
impl Measurement for ApiResponsiveness {
    async fn execute(&mut self, config: &MeasurementConfig) -> Result<MeasurementOutput> {
        match Action::from_params(&config.params)? {
            Action::Start => self.start(),
            Action::Gather => self.gather(config).await,
        }
    }

    async fn dispose(&mut self) {
        self.started_at = None;
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }
}
