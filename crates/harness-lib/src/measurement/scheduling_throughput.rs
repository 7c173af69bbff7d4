//! Pod scheduling throughput sampler

use super::{Action, Measurement, MeasurementConfig, MeasurementOutput, Summary};
use crate::error::{HarnessError, Result};
use crate::poll::{stop_channel, Poller, StopTrigger, Tick};
use crate::stats::{average, percentile_sorted, DataItem, PerfData};
use crate::tracker::{PodTracker, PodsStatus};
use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Samples how many pods get scheduled per second while load runs
#[derive(Default)]
pub struct SchedulingThroughput {
    sampler: Option<Sampler>,
}

struct Sampler {
    stop: StopTrigger,
    task: JoinHandle<Vec<f64>>,
}

impl Sampler {
    async fn finish(self) -> Result<Vec<f64>> {
        self.stop.trigger();
        self.task
            .await
            .map_err(|e| HarnessError::Setup(format!("throughput sampler task failed: {e}")))
    }
}

impl SchedulingThroughput {
    pub const NAME: &'static str = "SchedulingThroughput";

    pub fn new() -> Self {
        Self::default()
    }

    async fn start(&mut self, config: &MeasurementConfig) -> Result<MeasurementOutput> {
        if self.sampler.is_some() {
            return Err(HarnessError::AlreadyRunning(Self::NAME.to_string()));
        }
        let selector = config.params.selector()?;
        let interval = config
            .params
            .get_duration_or_default("interval", DEFAULT_INTERVAL)?;
        if interval.is_zero() {
            return Err(HarnessError::Config(format!("{}: interval must be positive", Self::NAME)));
        }

        let tracker =
            PodTracker::start(config.context.cluster.clone(), selector.clone(), interval).await?;
        let (stop, signal) = stop_channel();

        info!(measurement = Self::NAME, selector = %selector, "Starting collecting throughput data");

        let task = tokio::spawn(async move {
            let mut poller = Poller::new(interval).stop_on(signal);
            let mut series = Vec::new();
            let mut last_scheduled = 0usize;
            while poller.tick().await == Tick::Ready {
                let status = PodsStatus::compute(&tracker.list(), 0);
                let throughput =
                    (status.scheduled as f64 - last_scheduled as f64) / interval.as_secs_f64();
                series.push(throughput);
                last_scheduled = status.scheduled;
                info!(
                    measurement = SchedulingThroughput::NAME,
                    selector = %selector,
                    scheduled = last_scheduled,
                    "{} pods scheduled",
                    last_scheduled
                );
            }
            tracker.shutdown().await;
            series
        });

        self.sampler = Some(Sampler { stop, task });
        Ok(MeasurementOutput::empty())
    }

    async fn gather(&mut self) -> Result<MeasurementOutput> {
        let sampler = self
            .sampler
            .take()
            .ok_or_else(|| HarnessError::NotRunning(Self::NAME.to_string()))?;
        let mut series = sampler.finish().await?;
        info!(measurement = Self::NAME, samples = series.len(), "Gathering data");

        series.sort_by(|a, b| a.total_cmp(b));
        let item = DataItem::new("1/s")
            .with_value("Average", average(&series))
            .with_value("Perc50", percentile_sorted(50.0, &series).unwrap_or_default())
            .with_value("Perc90", percentile_sorted(90.0, &series).unwrap_or_default())
            .with_value("Perc99", percentile_sorted(99.0, &series).unwrap_or_default());

        let summary = Summary::perf(Self::NAME, &PerfData::new(vec![item]))?;
        Ok(MeasurementOutput::summary(summary))
    }
}

#[async_trait]
impl Measurement for SchedulingThroughput {
    async fn execute(&mut self, config: &MeasurementConfig) -> Result<MeasurementOutput> {
        match Action::from_params(&config.params)? {
            Action::Start => self.start(config).await,
            Action::Gather => self.gather().await,
        }
    }

    async fn dispose(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            let _ = sampler.finish().await;
        }
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }
}
