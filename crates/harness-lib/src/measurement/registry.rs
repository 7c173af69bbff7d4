//! Name-to-constructor mapping for measurements

use super::{
    ApiResponsiveness, Measurement, MetricsForE2E, Probe, ProbeConfig, ResourceUsageSummary,
    SchedulingThroughput,
};
use crate::error::{HarnessError, Result};
use std::collections::HashMap;

/// Builds a fresh measurement instance
pub type MeasurementFactory = Box<dyn Fn() -> Box<dyn Measurement> + Send + Sync>;

/// Wrap a constructor as a `MeasurementFactory`
pub fn factory<M, F>(build: F) -> MeasurementFactory
where
    M: Measurement + 'static,
    F: Fn() -> M + Send + Sync + 'static,
{
    Box::new(move || -> Box<dyn Measurement> { Box::new(build()) })
}

/// Registry of measurement constructors
///
/// Filled once at startup; every `create` returns an instance with fresh state.
#[derive(Default)]
pub struct MeasurementRegistry {
    factories: HashMap<String, MeasurementFactory>,
}

impl MeasurementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in measurement
    pub fn with_builtin() -> Self {
        Self::with_factories(builtin_factories())
    }

    fn with_factories(factories: Vec<(&'static str, MeasurementFactory)>) -> Self {
        let mut registry = Self::new();
        for (name, factory) in factories {
            registry
                .register(name, factory)
                .expect("built-in measurement names must be unique");
        }
        registry
    }

    /// Fails if `name` is already taken
    pub fn register(&mut self, name: &str, factory: MeasurementFactory) -> Result<()> {
        if self.factories.contains_key(name) {
            return Err(HarnessError::Config(format!(
                "measurement {name} is already registered"
            )));
        }
        self.factories.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Measurement>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| HarnessError::Config(format!("unknown measurement {name}")))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn builtin_factories() -> Vec<(&'static str, MeasurementFactory)> {
    vec![
        (
            ResourceUsageSummary::NAME,
            factory(ResourceUsageSummary::new),
        ),
        (
            SchedulingThroughput::NAME,
            factory(SchedulingThroughput::new),
        ),
        (
            ApiResponsiveness::NAME,
            factory(ApiResponsiveness::new),
        ),
        (
            ProbeConfig::IN_CLUSTER_NETWORK_LATENCY,
            factory(|| Probe::new(ProbeConfig::in_cluster_network_latency())),
        ),
        (
            ProbeConfig::DNS_LOOKUP_LATENCY,
            factory(|| Probe::new(ProbeConfig::dns_lookup_latency())),
        ),
        (
            MetricsForE2E::NAME,
            factory(MetricsForE2E::new),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names() {
        let registry = MeasurementRegistry::with_builtin();
        assert_eq!(
            registry.names(),
            vec![
                "APIResponsivenessPrometheus",
                "DnsLookupLatency",
                "InClusterNetworkLatency",
                "MetricsForE2E",
                "ResourceUsageSummary",
                "SchedulingThroughput",
            ]
        );
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = MeasurementRegistry::with_builtin();
        let err = registry
            .register(SchedulingThroughput::NAME, factory(SchedulingThroughput::new))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    #[should_panic(expected = "built-in measurement names must be unique")]
    fn test_duplicate_builtin_name_panics() {
        let mut factories = builtin_factories();
        factories.push((MetricsForE2E::NAME, factory(MetricsForE2E::new)));
        MeasurementRegistry::with_factories(factories);
    }

    #[test]
    fn test_create_returns_named_instances() {
        let registry = MeasurementRegistry::with_builtin();
        let m = registry.create("DnsLookupLatency").unwrap();
        assert_eq!(m.name(), "DnsLookupLatency");
        assert!(matches!(
            registry.create("Nope"),
            Err(HarnessError::Config(_))
        ));
    }
}
