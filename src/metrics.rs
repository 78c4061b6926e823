use kube::ResourceExt;
use prometheus::{
    histogram_opts, opts, HistogramTimer, HistogramVec, IntCounter, IntCounterVec, Registry,
};

use crate::Error;

/// Prometheus metrics shared by every controller
///
/// Reconcile metrics are labelled with the controller name, so a network
/// controller and the deletion guards it installs are counted separately.
#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounterVec,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub scope_cache_hits: IntCounter,
    pub scope_cache_misses: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "orc_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["kind"],
        )
        .expect("valid histogram options");
        let failures = IntCounterVec::new(
            opts!("orc_reconciliation_errors_total", "reconciliation errors"),
            &["kind", "instance", "error"],
        )
        .expect("valid counter options");
        let reconciliations = IntCounterVec::new(
            opts!("orc_reconciliations_total", "reconciliations"),
            &["kind"],
        )
        .expect("valid counter options");
        let scope_cache_hits = IntCounter::new(
            "orc_scope_cache_hits_total",
            "client scopes served from the credential cache",
        )
        .expect("valid counter options");
        let scope_cache_misses = IntCounter::new(
            "orc_scope_cache_misses_total",
            "client scopes which required authentication",
        )
        .expect("valid counter options");
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            scope_cache_hits,
            scope_cache_misses,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.scope_cache_hits.clone()))?;
        registry.register(Box::new(self.scope_cache_misses.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure<K: ResourceExt>(&self, controller: &str, obj: &K, e: &Error) {
        let instance = match obj.namespace() {
            Some(ns) => format!("{ns}/{}", obj.name_any()),
            None => obj.name_any(),
        };
        self.failures
            .with_label_values(&[controller, instance.as_ref(), e.metric_label().as_ref()])
            .inc()
    }

    pub fn count_and_measure(&self, controller: &str) -> ReconcileMeasurer {
        self.reconciliations.with_label_values(&[controller]).inc();
        ReconcileMeasurer {
            _timer: self
                .reconcile_duration
                .with_label_values(&[controller])
                .start_timer(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    _timer: HistogramTimer,
}
