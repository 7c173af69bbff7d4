//! Load Harness - measurement and chaos driver for cluster load tests
//!
//! Starts the configured measurements, optionally injects node failures
//! while the load runs, then gathers and verifies the results.

use anyhow::{Context, Result};
use clap::Parser;
use harness_lib::measurement::{PrometheusGrabber, PrometheusUsageSource};
use harness_lib::{
    HarnessContext, HarnessMetrics, MeasurementRegistry, StatusRegistry, StructuredLogger,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod kube_cluster;
mod plan;
mod prometheus_api;
mod ssh;

const HARNESS_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "load-harness")]
#[command(author, version, about = "Measurement and chaos driver for cluster load tests")]
struct Args {
    /// Path to the run configuration (YAML, TOML or JSON)
    #[arg(short, long, env = "HARNESS_CONFIG")]
    config: Option<PathBuf>,

    /// Cloud provider of the cluster under test
    #[arg(long)]
    provider: Option<String>,

    /// Prometheus base URL
    #[arg(long)]
    prometheus_url: Option<String>,

    /// Port of the status and metrics server
    #[arg(long)]
    api_port: Option<u16>,

    /// Name of this run, attached to every log line
    #[arg(long)]
    run_name: Option<String>,

    /// Directory to write summaries to
    #[arg(long)]
    report_dir: Option<String>,

    /// How long load runs before gathering (e.g. 10m)
    #[arg(long)]
    load_duration: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = Args::parse();
    let config = config::HarnessConfig::load(
        args.config.as_deref(),
        config::Overrides {
            run_name: args.run_name,
            provider: args.provider,
            prometheus_url: args.prometheus_url,
            api_port: args.api_port,
            report_dir: args.report_dir,
            load_duration: args.load_duration,
        },
    )?;

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let cluster = Arc::new(kube_cluster::KubeCluster::new(client));

    let mut context = HarnessContext::new(cluster)
        .with_provider(config.provider.clone())
        .with_manifests_root(config.manifests_root.clone());
    match &config.prometheus_url {
        Some(url) => {
            let prometheus = Arc::new(prometheus_api::PrometheusClient::new(url)?);
            context = context
                .with_query_client(prometheus.clone())
                .with_targets(prometheus.clone())
                .with_usage_source(Arc::new(PrometheusUsageSource::new(prometheus.clone())))
                .with_grabber(Arc::new(PrometheusGrabber::new(prometheus)));
        }
        None => warn!("No Prometheus URL configured, metric-backed measurements will fail"),
    }

    let status = StatusRegistry::new();
    let metrics = HarnessMetrics::new();
    let logger = StructuredLogger::new(&config.run_name);
    logger.log_startup(HARNESS_VERSION, &config.provider, config.measurements.len());

    let app_state = Arc::new(api::AppState::new(status.clone(), metrics.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let runner = plan::Runner {
        registry: MeasurementRegistry::with_builtin(),
        context: Arc::new(context),
        executor: Arc::new(ssh::SshExecutor::new(config.ssh_user.clone())),
        status,
        metrics,
        logger: logger.clone(),
    };

    let report = runner
        .run(&config, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        })
        .await;
    api_handle.abort();

    let report = match report {
        Ok(report) => report,
        Err(e) => {
            logger.log_shutdown("run aborted");
            return Err(e);
        }
    };
    logger.log_shutdown("run finished");
    info!(
        summaries = report.summaries.len(),
        chaos_rounds = report.chaos_rounds.len(),
        "Run complete"
    );

    if !report.is_success() {
        anyhow::bail!(
            "Run failed: errors in [{}], violations in [{}]",
            report.failed.join(", "),
            report.violated.join(", ")
        );
    }
    Ok(())
}
