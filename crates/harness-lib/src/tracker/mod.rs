//! Live view of the pods matching a selector
//!
//! A single writer task folds watch events (or periodic listings when the
//! cluster client cannot watch) into the current snapshot. Readers get an
//! `Arc<Snapshot>` that is never mutated after publication.

mod waiter;


pub use waiter::{wait_for_pods, WaitForPodsOptions};

use crate::cluster::{ClusterClient, PodEvent, PodEventStream};
use crate::error::{HarnessError, Result};
use crate::models::{PodKey, PodPhase, Selector, WorkloadUnit};
use crate::poll::{stop_channel, Poller, StopSignal, StopTrigger, Tick};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Pods matching a selector at one instant, keyed by identity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    units: BTreeMap<PodKey, WorkloadUnit>,
}

impl Snapshot {
    /// Later observations of the same identity supersede earlier ones
    pub fn from_units(units: impl IntoIterator<Item = WorkloadUnit>) -> Self {
        Self {
            units: units.into_iter().map(|u| (u.key(), u)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, key: &PodKey) -> Option<&WorkloadUnit> {
        self.units.get(key)
    }

    pub fn contains(&self, key: &PodKey) -> bool {
        self.units.contains_key(key)
    }

    pub fn units(&self) -> impl Iterator<Item = &WorkloadUnit> {
        self.units.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &PodKey> {
        self.units.keys()
    }

    /// What changed going from `self` to `newer`
    pub fn diff(&self, newer: &Snapshot) -> Diff {
        Diff {
            added: newer
                .keys()
                .filter(|k| !self.contains(k))
                .cloned()
                .collect(),
            removed: self
                .keys()
                .filter(|k| !newer.contains(k))
                .cloned()
                .collect(),
        }
    }

    fn with_applied(&self, unit: WorkloadUnit) -> Self {
        let mut next = self.clone();
        next.units.insert(unit.key(), unit);
        next
    }

    fn with_deleted(&self, key: &PodKey) -> Self {
        let mut next = self.clone();
        next.units.remove(key);
        next
    }
}

/// Identities added and removed between two snapshots; never overlapping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub added: Vec<PodKey>,
    pub removed: Vec<PodKey>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Per-state pod counts over a snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PodsStatus {
    pub expected: usize,
    pub created: usize,
    /// Running and ready
    pub running: usize,
    pub running_not_ready: usize,
    /// Scheduled but not yet running
    pub pending: usize,
    /// Not yet scheduled
    pub waiting: usize,
    /// Node assigned
    pub scheduled: usize,
    /// Succeeded or failed
    pub inactive: usize,
    pub terminating: usize,
    pub unknown: usize,
}

impl PodsStatus {
    pub fn compute(snapshot: &Snapshot, expected: usize) -> Self {
        let mut status = PodsStatus {
            expected,
            ..Default::default()
        };
        for unit in snapshot.units() {
            status.created += 1;
            if unit.is_scheduled() {
                status.scheduled += 1;
            }
            if unit.terminating {
                status.terminating += 1;
                continue;
            }
            match unit.phase {
                PodPhase::Running if unit.ready => status.running += 1,
                PodPhase::Running => status.running_not_ready += 1,
                PodPhase::Pending if unit.is_scheduled() => status.pending += 1,
                PodPhase::Pending => status.waiting += 1,
                PodPhase::Succeeded | PodPhase::Failed => status.inactive += 1,
                PodPhase::Unknown => status.unknown += 1,
            }
        }
        status
    }
}

impl fmt::Display for PodsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pods: {} out of {} created, {} running, {} pending scheduled, {} not scheduled, \
             {} inactive, {} terminating, {} unknown, {} runningButNotReady",
            self.created,
            self.expected,
            self.running,
            self.pending,
            self.waiting,
            self.inactive,
            self.terminating,
            self.unknown,
            self.running_not_ready
        )
    }
}

/// Watches pods matching a selector
///
/// Created by `start`; released by `stop` or on drop.
pub struct PodTracker {
    selector: Selector,
    snapshot: watch::Receiver<Arc<Snapshot>>,
    stop: Option<StopTrigger>,
    task: Option<JoinHandle<()>>,
}

impl PodTracker {
    /// List once and spawn the writer task. Fails if the initial listing fails.
    pub async fn start(
        cluster: Arc<dyn ClusterClient>,
        selector: Selector,
        resync: Duration,
    ) -> Result<Self> {
        let initial = cluster.list_pods(&selector).await.map_err(|e| {
            HarnessError::Setup(format!("pod tracker for {selector}: initial listing failed: {e:#}"))
        })?;

        let (tx, rx) = watch::channel(Arc::new(Snapshot::from_units(initial)));
        let (trigger, signal) = stop_channel();
        let task = tokio::spawn(run_writer(cluster, selector.clone(), resync, tx, signal));

        debug!(selector = %selector, "Pod tracker started");

        Ok(Self {
            selector,
            snapshot: rx,
            stop: Some(trigger),
            task: Some(task),
        })
    }

    /// Latest observed snapshot
    pub fn list(&self) -> Arc<Snapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Release watch resources; safe to call more than once
    pub fn stop(&mut self) {
        if let Some(trigger) = self.stop.take() {
            trigger.trigger();
            debug!(selector = %self.selector, "Pod tracker stopped");
        }
    }

    /// Stop and wait for the writer task to exit
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PodTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_writer(
    cluster: Arc<dyn ClusterClient>,
    selector: Selector,
    resync: Duration,
    tx: watch::Sender<Arc<Snapshot>>,
    stop: StopSignal,
) {
    match cluster.watch_pods(&selector).await {
        Ok(Some(stream)) => {
            if fold_watch(stream, &tx, &stop).await {
                return;
            }
            info!(selector = %selector, "Pod watch ended, falling back to periodic listing");
        }
        Ok(None) => {}
        Err(e) => {
            warn!(selector = %selector, error = %format!("{e:#}"), "Pod watch failed, using periodic listing");
        }
    }

    let mut poller = Poller::new(resync).stop_on(stop);
    while poller.tick().await == Tick::Ready {
        match cluster.list_pods(&selector).await {
            Ok(units) => {
                tx.send_replace(Arc::new(Snapshot::from_units(units)));
            }
            Err(e) => {
                warn!(selector = %selector, error = %format!("{e:#}"), "Pod listing failed, keeping last snapshot");
            }
        }
    }
}

/// Apply watch events until stopped (`true`) or the stream ends (`false`)
async fn fold_watch(
    mut stream: PodEventStream,
    tx: &watch::Sender<Arc<Snapshot>>,
    stop: &StopSignal,
) -> bool {
    loop {
        tokio::select! {
            _ = stop.wait() => return true,
            event = stream.next() => match event {
                Some(Ok(event)) => apply_event(tx, event),
                Some(Err(e)) => {
                    warn!(error = %format!("{e:#}"), "Pod watch error, keeping last snapshot");
                }
                None => return false,
            },
        }
    }
}

fn apply_event(tx: &watch::Sender<Arc<Snapshot>>, event: PodEvent) {
    let current = tx.borrow().clone();
    let next = match event {
        PodEvent::Applied(unit) => current.with_applied(unit),
        PodEvent::Deleted(key) => current.with_deleted(&key),
        PodEvent::Restarted(units) => Snapshot::from_units(units),
    };
    tx.send_replace(Arc::new(next));
}
