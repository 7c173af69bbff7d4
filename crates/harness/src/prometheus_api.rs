//! Prometheus HTTP API client

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use harness_lib::{QueryClient, Sample, ScrapeTarget, TargetSource};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use url::Url;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    status: String,
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    result: Vec<VectorSample>,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    metric: BTreeMap<String, String>,
    /// `[unix seconds, "value"]`
    value: (f64, String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetsData {
    active_targets: Vec<ActiveTarget>,
}

#[derive(Debug, Deserialize)]
struct ActiveTarget {
    labels: BTreeMap<String, String>,
    health: String,
}

/// Client for `/api/v1/query` and `/api/v1/targets`
pub struct PrometheusClient {
    client: Client,
    base_url: Url,
}

impl PrometheusClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid Prometheus URL")?;

        Ok(Self { client, base_url })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        let body: ApiResponse<T> = response
            .json()
            .await
            .with_context(|| format!("Failed to parse response ({status})"))?;

        if body.status != "success" {
            anyhow::bail!(
                "Prometheus error ({}): {}",
                status,
                body.error.unwrap_or_default()
            );
        }
        body.data.context("Prometheus response has no data")
    }
}

fn to_sample(raw: VectorSample) -> Result<Sample> {
    let (ts, value) = raw.value;
    let value: f64 = value
        .parse()
        .with_context(|| format!("Malformed sample value {value:?}"))?;
    let timestamp = Utc
        .timestamp_millis_opt((ts * 1000.0) as i64)
        .single()
        .unwrap_or_else(Utc::now);
    let mut labels = raw.metric;
    let metric = labels.remove("__name__").unwrap_or_default();
    Ok(Sample {
        timestamp,
        metric,
        value,
        labels,
    })
}

#[async_trait]
impl QueryClient for PrometheusClient {
    async fn query(&self, query: &str, at: DateTime<Utc>) -> Result<Vec<Sample>> {
        let data: QueryData = self
            .get(
                "api/v1/query",
                &[("query", query.to_string()), ("time", at.to_rfc3339())],
            )
            .await
            .with_context(|| format!("Query failed: {query}"))?;

        if data.result_type != "vector" {
            anyhow::bail!("Unexpected result type {}", data.result_type);
        }
        data.result.into_iter().map(to_sample).collect()
    }
}

#[async_trait]
impl TargetSource for PrometheusClient {
    async fn targets(&self) -> Result<Vec<ScrapeTarget>> {
        let data: TargetsData = self
            .get("api/v1/targets", &[("state", "active".to_string())])
            .await
            .context("Failed to list scrape targets")?;

        Ok(data
            .active_targets
            .into_iter()
            .map(|t| ScrapeTarget {
                healthy: t.health == "up",
                labels: t.labels,
            })
            .collect())
    }
}
