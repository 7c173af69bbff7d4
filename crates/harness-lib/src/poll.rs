//! Polling, fan-out and stop-signal primitives shared by every background task
//!
//! - `Poller`: interval ticks with optional jitter, deadline and stop signal
//! - `TaskGroup`: spawn labeled tasks and join them all, keeping every result
//! - `stop_channel`: one-shot stop broadcast that any number of tasks can await

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};

/// Create a linked stop trigger and signal
pub fn stop_channel() -> (StopTrigger, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (
        StopTrigger { tx },
        StopSignal {
            rx,
            _sender: None,
        },
    )
}

/// Fires the stop signal. Dropping the trigger also counts as a stop.
#[derive(Debug)]
pub struct StopTrigger {
    tx: watch::Sender<bool>,
}

impl StopTrigger {
    /// Fire the signal; repeated calls are no-ops
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// A new signal linked to this trigger
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
            _sender: None,
        }
    }
}

/// Receiving side of a stop channel, cheap to clone
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
    /// Held by `never` signals so the channel stays open
    _sender: Option<Arc<watch::Sender<bool>>>,
}

impl StopSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _sender: Some(Arc::new(tx)),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once the trigger fires or is dropped
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Outcome of one `Poller::tick`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The interval elapsed; do the next unit of work
    Ready,
    /// The stop signal fired
    Stopped,
    /// The deadline passed before the next tick
    TimedOut,
}

/// Bounded polling combinator
///
/// Each `tick` sleeps one (optionally jittered) interval and reports whether
/// the caller should poll, stop, or give up.
#[derive(Debug)]
pub struct Poller {
    interval: Duration,
    jitter_factor: f64,
    deadline: Option<Instant>,
    stop: Option<StopSignal>,
    immediate: bool,
    started: bool,
}

impl Poller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            jitter_factor: 0.0,
            deadline: None,
            stop: None,
            immediate: false,
            started: false,
        }
    }

    /// Add up to `factor * interval` of random delay to every tick
    pub fn jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.max(0.0);
        self
    }

    /// Give up once `timeout` has elapsed from now
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn stop_on(mut self, stop: StopSignal) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Make the first tick fire without sleeping
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next tick
    pub async fn tick(&mut self) -> Tick {
        if self.stop.as_ref().is_some_and(StopSignal::is_triggered) {
            return Tick::Stopped;
        }

        let delay = if self.immediate && !self.started {
            Duration::ZERO
        } else {
            self.next_delay()
        };
        self.started = true;

        let wake = Instant::now() + delay;
        let (wake, times_out) = match self.deadline {
            Some(deadline) if deadline <= wake => (deadline, true),
            _ => (wake, false),
        };

        let stop = self.stop.clone();
        tokio::select! {
            _ = sleep_until(wake) => {
                if times_out { Tick::TimedOut } else { Tick::Ready }
            }
            _ = wait_for_stop(stop) => Tick::Stopped,
        }
    }

    fn next_delay(&self) -> Duration {
        jittered(self.interval, self.jitter_factor)
    }
}

/// `base` plus a uniform random share of `factor * base`
pub fn jittered(base: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return base;
    }
    let extra = rand::random::<f64>() * factor;
    base + base.mul_f64(extra)
}

async fn wait_for_stop(stop: Option<StopSignal>) {
    match stop {
        Some(signal) => signal.wait().await,
        None => std::future::pending::<()>().await,
    }
}

/// Result of one task in a `TaskGroup`
#[derive(Debug)]
pub struct TaskOutcome<T> {
    pub label: String,
    pub result: anyhow::Result<T>,
}

/// Fan-out/join over labeled tasks
///
/// A failing or panicking task never aborts its siblings; every outcome is
/// returned by `join_all`.
pub struct TaskGroup<T> {
    set: JoinSet<TaskOutcome<T>>,
}

impl<T: Send + 'static> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> TaskGroup<T> {
    pub fn new() -> Self {
        Self {
            set: JoinSet::new(),
        }
    }

    pub fn spawn<F>(&mut self, label: impl Into<String>, task: F)
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let label = label.into();
        self.set.spawn(async move {
            // The inner spawn turns a panic into a labeled error
            let result = match tokio::spawn(task).await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("task panicked: {e}")),
            };
            TaskOutcome { label, result }
        });
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Wait for every task, in completion order
    pub async fn join_all(mut self) -> Vec<TaskOutcome<T>> {
        let mut outcomes = Vec::with_capacity(self.set.len());
        while let Some(joined) = self.set.join_next().await {
            if let Ok(outcome) = joined {
                outcomes.push(outcome);
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_stop_signal_wakes_waiter() {
        let (trigger, signal) = stop_channel();
        let mut wait = tokio_test::task::spawn(signal.wait());
        tokio_test::assert_pending!(wait.poll());

        trigger.trigger();
        assert!(wait.is_woken());
        tokio_test::assert_ready!(wait.poll());
        assert!(signal.is_triggered());
    }

    #[test]
    fn test_never_signal_stays_pending() {
        let signal = StopSignal::never();
        let copy = signal.clone();
        drop(signal);

        assert!(!copy.is_triggered());
        let mut wait = tokio_test::task::spawn(copy.wait());
        tokio_test::assert_pending!(wait.poll());
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(10);
        assert_eq!(jittered(base, 0.0), base);
        for _ in 0..100 {
            let d = jittered(base, 0.5);
            assert!(d >= base);
            assert!(d <= Duration::from_secs(15));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_times_out() {
        let mut poller = Poller::new(Duration::from_secs(2)).timeout(Duration::from_secs(5));
        assert_eq!(poller.tick().await, Tick::Ready);
        assert_eq!(poller.tick().await, Tick::Ready);
        assert_eq!(poller.tick().await, Tick::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_immediate_first_tick() {
        let start = Instant::now();
        let mut poller = Poller::new(Duration::from_secs(30)).immediate();
        assert_eq!(poller.tick().await, Tick::Ready);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_stops_mid_sleep() {
        let (trigger, signal) = stop_channel();
        let mut poller = Poller::new(Duration::from_secs(3600)).stop_on(signal);

        let handle = tokio::spawn(async move { poller.tick().await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.trigger();

        assert_eq!(handle.await.unwrap(), Tick::Stopped);
    }

    #[tokio::test]
    async fn test_dropped_trigger_counts_as_stop() {
        let (trigger, signal) = stop_channel();
        assert!(!signal.is_triggered());
        drop(trigger);
        assert!(signal.is_triggered());
        signal.wait().await;
    }

    #[tokio::test]
    async fn test_task_group_keeps_all_outcomes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut group = TaskGroup::new();

        for i in 0..5 {
            let counter = counter.clone();
            group.spawn(format!("task-{i}"), async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if i == 2 {
                    anyhow::bail!("task {i} failed");
                }
                Ok(i)
            });
        }
        group.spawn("panics", async {
            let missing: Option<usize> = None;
            Ok(missing.expect("boom"))
        });

        let outcomes = group.join_all().await;
        assert_eq!(outcomes.len(), 6);
        assert_eq!(counter.load(Ordering::SeqCst), 5);

        let failed: Vec<_> = outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.label.as_str())
            .collect();
        assert_eq!(failed.len(), 2);
        assert!(failed.contains(&"task-2"));
        assert!(failed.contains(&"panics"));
    }
}
