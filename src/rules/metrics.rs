use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    default_registry, Gauge, Histogram, HistogramOpts, IntCounter, Opts, Registry,
};
use tracing::warn;

use crate::rules::alerts_error::{AlertsError, AlertsResult};

/// Process-wide counters shared by all groups and executors.
pub struct ProcessMetrics {
    /// vmalert_execution_total
    pub exec_total: IntCounter,
    /// vmalert_execution_errors_total
    pub exec_errors: IntCounter,
    /// vmalert_alerts_fired_total. Incremented by alerting-rule
    /// implementations when an alert switches to the firing state.
    pub alerts_fired: IntCounter,
    /// vmalert_remotewrite_total
    pub remote_write_total: IntCounter,
    /// vmalert_remotewrite_errors_total
    pub remote_write_errors: IntCounter,
}

impl ProcessMetrics {
    fn new(registry: &Registry) -> ProcessMetrics {
        ProcessMetrics {
            exec_total: int_counter(
                registry,
                "vmalert_execution_total",
                "Total number of rule executions",
            ),
            exec_errors: int_counter(
                registry,
                "vmalert_execution_errors_total",
                "Total number of failed rule executions",
            ),
            alerts_fired: int_counter(
                registry,
                "vmalert_alerts_fired_total",
                "Total number of alerts switched to the firing state",
            ),
            remote_write_total: int_counter(
                registry,
                "vmalert_remotewrite_total",
                "Total number of samples pushed to remote write",
            ),
            remote_write_errors: int_counter(
                registry,
                "vmalert_remotewrite_errors_total",
                "Total number of failed remote write pushes",
            ),
        }
    }
}

/// Returns the process-wide counters, registering them on the default
/// registry on first use.
pub fn process_metrics() -> &'static ProcessMetrics {
    static METRICS: OnceLock<ProcessMetrics> = OnceLock::new();
    METRICS.get_or_init(|| ProcessMetrics::new(default_registry()))
}

fn int_counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    // the names are literals, creation can only fail on an invalid name
    let counter = IntCounter::with_opts(Opts::new(name, help)).expect("valid metric definition");
    register(registry, Box::new(counter.clone()));
    counter
}

fn register(registry: &Registry, collector: Box<dyn Collector>) {
    if let Err(err) = registry.register(collector) {
        // a collector that failed to register keeps counting, it just isn't
        // exported
        warn!("metrics registration failed: {}", err);
    }
}

/// Per-group metric set, labelled with the group name and file. Registered on
/// group creation and unregistered exactly once, on group close.
pub struct GroupMetrics {
    /// vmalert_iteration_total
    pub iteration_total: IntCounter,
    /// vmalert_iteration_missed_total
    pub iteration_missed: IntCounter,
    /// vmalert_iteration_duration_seconds
    pub iteration_duration: Histogram,
    /// vmalert_iteration_interval_seconds
    pub iteration_interval: Gauge,
    registry: Registry,
}

impl GroupMetrics {
    pub(crate) fn new(
        registry: &Registry,
        group: &str,
        file: &str,
        interval: Duration,
    ) -> AlertsResult<GroupMetrics> {
        let labels: HashMap<String, String> = [
            ("group".to_string(), group.to_string()),
            ("file".to_string(), file.to_string()),
        ]
        .into_iter()
        .collect();

        let iteration_total = IntCounter::with_opts(
            Opts::new(
                "vmalert_iteration_total",
                "Total number of group evaluation iterations",
            )
            .const_labels(labels.clone()),
        )
        .map_err(metric_err)?;

        let iteration_missed = IntCounter::with_opts(
            Opts::new(
                "vmalert_iteration_missed_total",
                "Total number of group evaluation iterations missed due to slow evaluation",
            )
            .const_labels(labels.clone()),
        )
        .map_err(metric_err)?;

        let iteration_duration = Histogram::with_opts(
            HistogramOpts::new(
                "vmalert_iteration_duration_seconds",
                "Wall-clock duration of group evaluation iterations",
            )
            .const_labels(labels.clone()),
        )
        .map_err(metric_err)?;

        let iteration_interval = Gauge::with_opts(
            Opts::new(
                "vmalert_iteration_interval_seconds",
                "Configured evaluation interval of the group",
            )
            .const_labels(labels),
        )
        .map_err(metric_err)?;
        iteration_interval.set(interval.as_secs_f64());

        register(registry, Box::new(iteration_total.clone()));
        register(registry, Box::new(iteration_missed.clone()));
        register(registry, Box::new(iteration_duration.clone()));
        register(registry, Box::new(iteration_interval.clone()));

        Ok(GroupMetrics {
            iteration_total,
            iteration_missed,
            iteration_duration,
            iteration_interval,
            registry: registry.clone(),
        })
    }

    /// unregister removes the group's collectors from the registry.
    pub(crate) fn unregister(&self) {
        let _ = self
            .registry
            .unregister(Box::new(self.iteration_total.clone()));
        let _ = self
            .registry
            .unregister(Box::new(self.iteration_missed.clone()));
        let _ = self
            .registry
            .unregister(Box::new(self.iteration_duration.clone()));
        let _ = self
            .registry
            .unregister(Box::new(self.iteration_interval.clone()));
    }
}

fn metric_err(err: prometheus::Error) -> AlertsError {
    AlertsError::InvalidConfiguration(format!("failed to create group metrics: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_metrics_register_and_unregister() {
        let registry = Registry::new();
        let metrics = GroupMetrics::new(
            &registry,
            "test-group",
            "rules.yaml",
            Duration::from_secs(30),
        )
        .unwrap();

        metrics.iteration_total.inc();
        metrics.iteration_duration.observe(0.25);
        assert_eq!(metrics.iteration_total.get(), 1);
        assert_eq!(metrics.iteration_interval.get(), 30.0);
        assert_eq!(registry.gather().len(), 4);

        metrics.unregister();
        assert!(registry.gather().is_empty());
    }

    #[test]
    fn duplicate_registration_keeps_collectors_usable() {
        let registry = Registry::new();
        let first =
            GroupMetrics::new(&registry, "dup", "rules.yaml", Duration::from_secs(1)).unwrap();
        let second =
            GroupMetrics::new(&registry, "dup", "rules.yaml", Duration::from_secs(1)).unwrap();

        first.iteration_total.inc();
        second.iteration_total.inc();
        assert_eq!(first.iteration_total.get(), 1);
        assert_eq!(second.iteration_total.get(), 1);
    }

    #[test]
    fn process_metrics_are_singletons() {
        let metrics = process_metrics();
        let before = metrics.alerts_fired.get();
        metrics.alerts_fired.inc();
        assert_eq!(process_metrics().alerts_fired.get(), before + 1);
    }
}
