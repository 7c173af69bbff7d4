//! Harness configuration
//!
//! Sources, lowest precedence first: optional config file, `HARNESS_`
//! environment variables (`__` separates nested keys), command-line flags.

use anyhow::{Context, Result};
use harness_lib::NodeFailureConfig;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One measurement of the plan
#[derive(Debug, Clone, Deserialize)]
pub struct MeasurementStep {
    /// Registry name, e.g. `APIResponsivenessPrometheus`
    pub method: String,
    /// Unique name of this instance within the run
    pub identifier: String,
    /// Parameters of the `start` call; `action` is filled in
    #[serde(default)]
    pub start: Map<String, Value>,
    /// Parameters of the `gather` call; `action` is filled in
    #[serde(default)]
    pub gather: Map<String, Value>,
    /// Single-shot measurements only run at gather time
    #[serde(default)]
    pub gather_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HarnessConfig {
    #[serde(default = "default_run_name")]
    pub run_name: String,

    /// Cloud provider: `gce`, `gke`, `kubemark`, ...
    #[serde(default)]
    pub provider: String,

    /// Prometheus base URL; metrics-backed measurements are disabled without it
    #[serde(default)]
    pub prometheus_url: Option<String>,

    /// API server port for status/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_manifests_root")]
    pub manifests_root: PathBuf,

    /// User for remote commands on nodes
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    /// How long load runs between start and gather
    #[serde(default = "default_load_duration", with = "humantime_serde")]
    pub load_duration: Duration,

    /// Directory summaries are written to; logged only when unset
    #[serde(default)]
    pub report_dir: Option<PathBuf>,

    #[serde(default)]
    pub measurements: Vec<MeasurementStep>,

    #[serde(default)]
    pub chaos: Option<NodeFailureConfig>,
}

fn default_run_name() -> String {
    "load-test".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_manifests_root() -> PathBuf {
    PathBuf::from("manifests")
}

fn default_ssh_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
}

fn default_load_duration() -> Duration {
    Duration::from_secs(10 * 60)
}

/// Values given on the command line
#[derive(Debug, Default)]
pub struct Overrides {
    pub run_name: Option<String>,
    pub provider: Option<String>,
    pub prometheus_url: Option<String>,
    pub api_port: Option<u16>,
    pub report_dir: Option<String>,
    pub load_duration: Option<String>,
}

impl HarnessConfig {
    /// Load configuration from file, environment and overrides
    pub fn load(path: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder
            .add_source(
                config::Environment::with_prefix("HARNESS")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("run_name", overrides.run_name)?
            .set_override_option("provider", overrides.provider)?
            .set_override_option("prometheus_url", overrides.prometheus_url)?
            .set_override_option("api_port", overrides.api_port.map(i64::from))?
            .set_override_option("report_dir", overrides.report_dir)?
            .set_override_option("load_duration", overrides.load_duration)?;

        let config: HarnessConfig = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.measurements {
            if !seen.insert(step.identifier.as_str()) {
                anyhow::bail!("duplicate measurement identifier {}", step.identifier);
            }
        }
        if let Some(chaos) = &self.chaos {
            chaos.validate().context("Invalid chaos configuration")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_plan_from_file() {
        let (_dir, path) = write_config(
            r#"
run_name: density
provider: gce
load_duration: 5m
measurements:
  - method: SchedulingThroughput
    identifier: throughput
    start:
      namespace: load
      labelSelector: group=load
chaos:
  failure_rate: 0.01
  interval: 1m
  jitter_factor: 10.0
  simulated_downtime: 10m
"#,
        );
        let config = HarnessConfig::load(
            Some(&path),
            Overrides {
                api_port: Some(9191),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(config.run_name, "density");
        assert_eq!(config.api_port, 9191);
        assert_eq!(config.load_duration, Duration::from_secs(300));
        assert_eq!(config.measurements.len(), 1);
        assert_eq!(config.measurements[0].start.len(), 2);
        let chaos = config.chaos.unwrap();
        assert_eq!(chaos.simulated_downtime, Duration::from_secs(600));
    }

    #[test]
    fn test_duplicate_identifiers_rejected() {
        let (_dir, path) = write_config(
            r#"
measurements:
  - method: SchedulingThroughput
    identifier: same
  - method: ResourceUsageSummary
    identifier: same
"#,
        );
        assert!(HarnessConfig::load(Some(&path), Overrides::default()).is_err());
    }
}
