//! Block until a desired number of pods is running

use super::{PodTracker, PodsStatus};
use crate::cluster::ClusterClient;
use crate::error::{HarnessError, Result};
use crate::models::{PodKey, Selector};
use crate::poll::{Poller, StopSignal, Tick};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Options for `wait_for_pods`
#[derive(Debug, Clone)]
pub struct WaitForPodsOptions {
    pub selector: Selector,
    pub desired_pod_count: usize,
    /// Log the pod status on every poll
    pub enable_logging: bool,
    /// Prefix of every log line
    pub caller_name: String,
    pub interval: Duration,
}

impl WaitForPodsOptions {
    pub fn new(selector: Selector, desired_pod_count: usize) -> Self {
        Self {
            selector,
            desired_pod_count,
            enable_logging: false,
            caller_name: "wait_for_pods".to_string(),
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scaling {
    Up,
    Down,
    None,
}

/// Wait until exactly `desired_pod_count` pods are running and every other
/// matching pod is inactive.
///
/// Pods disappearing while not scaling down, or appearing while not scaling
/// up, are logged as anomalies but never fail the wait. Returns a timeout
/// error carrying the last observed counts once `stop` fires.
pub async fn wait_for_pods(
    cluster: Arc<dyn ClusterClient>,
    stop: StopSignal,
    options: WaitForPodsOptions,
) -> Result<()> {
    let tracker = PodTracker::start(cluster, options.selector.clone(), options.interval).await?;
    let caller = options.caller_name.as_str();
    let selector = &options.selector;
    let desired = options.desired_pod_count;

    let mut old = tracker.list();
    let scaling = match old.len() {
        n if n == desired => Scaling::None,
        n if n < desired => Scaling::Up,
        _ => Scaling::Down,
    };
    let mut status = PodsStatus::compute(&old, desired);
    let mut poller = Poller::new(options.interval).stop_on(stop);

    let result = loop {
        if poller.tick().await != Tick::Ready {
            info!(caller = %caller, selector = %selector, "{caller}: {selector}: pods status: {status}");
            break Err(HarnessError::Timeout(format!(
                "timeout while waiting for {} pods to be running in namespace '{}' with labels '{}' \
                 and fields '{}' - only {} found running",
                desired,
                selector.namespace.as_deref().unwrap_or(""),
                selector.label_selector,
                selector.field_selector,
                status.running
            )));
        }

        let pods = tracker.list();
        status = PodsStatus::compute(&pods, desired);

        let diff = old.diff(&pods);
        if scaling != Scaling::Down && !diff.removed.is_empty() {
            error!(
                caller = %caller,
                selector = %selector,
                count = diff.removed.len(),
                "{caller}: {selector}: {} pods disappeared: {}",
                diff.removed.len(),
                join_keys(&diff.removed)
            );
        }
        if scaling != Scaling::Up && !diff.added.is_empty() {
            error!(
                caller = %caller,
                selector = %selector,
                count = diff.added.len(),
                "{caller}: {selector}: {} pods appeared: {}",
                diff.added.len(),
                join_keys(&diff.added)
            );
        }
        if options.enable_logging {
            info!(caller = %caller, selector = %selector, "{caller}: {selector}: {status}");
        }

        // Evicted or completed pods may linger as long as the rest converge
        if pods.len() == status.running + status.inactive && status.running == desired {
            break Ok(());
        }
        old = pods;
    };

    tracker.shutdown().await;
    result
}

fn join_keys(keys: &[PodKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
