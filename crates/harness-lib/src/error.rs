//! Error types for the harness library

use std::fmt;
use thiserror::Error;

/// Result type used across the library
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Harness errors
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Bad or missing measurement parameter, unknown measurement name
    #[error("configuration error: {0}")]
    Config(String),

    /// A measurement or tracker could not be set up
    #[error("setup error: {0}")]
    Setup(String),

    /// A bounded wait ran out of time or was stopped
    #[error("timeout: {0}")]
    Timeout(String),

    /// Collected data breached a threshold. The result is still valid.
    #[error(transparent)]
    MetricViolation(#[from] MetricViolationError),

    /// Gather called before start
    #[error("{0} is not running")]
    NotRunning(String),

    /// Start called twice
    #[error("{0} is already running")]
    AlreadyRunning(String),

    /// The orchestration API failed
    #[error("cluster error: {0}")]
    Cluster(String),

    /// The metrics backend failed
    #[error("query error: {0}")]
    Query(String),

    /// Remote command execution failed
    #[error("remote execution error: {0}")]
    Remote(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Soft failures carry a valid result alongside the breach
    pub fn is_metric_violation(&self) -> bool {
        matches!(self, HarnessError::MetricViolation(_))
    }

    pub fn cluster(err: anyhow::Error) -> Self {
        HarnessError::Cluster(format!("{err:#}"))
    }

    pub fn query(err: anyhow::Error) -> Self {
        HarnessError::Query(format!("{err:#}"))
    }

    pub fn remote(err: anyhow::Error) -> Self {
        HarnessError::Remote(format!("{err:#}"))
    }
}

/// A measured value exceeded its objective
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct MetricViolationError {
    /// What was measured, e.g. `resource constraints`
    pub subject: String,
    pub message: String,
}

impl MetricViolationError {
    pub fn new(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for MetricViolationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.subject, self.message)
    }
}

/// Accumulates individual threshold breaches into one aggregate error
#[derive(Debug, Clone, Default)]
pub struct ViolationSet {
    violations: Vec<String>,
}

impl ViolationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, violation: impl Into<String>) {
        self.violations.push(violation.into());
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.violations.iter().map(String::as_str)
    }

    /// Promote a non-empty set to a single error; `None` when nothing breached.
    /// The message is built by `describe` from the collected entries.
    pub fn into_error(
        self,
        subject: &str,
        describe: impl FnOnce(&[String]) -> String,
    ) -> Option<MetricViolationError> {
        if self.violations.is_empty() {
            return None;
        }
        Some(MetricViolationError::new(subject, describe(&self.violations)))
    }
}
