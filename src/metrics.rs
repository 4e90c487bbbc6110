use std::marker::PhantomData;

use kube::ResourceExt;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

use crate::Error;

#[derive(Clone)]
pub struct Metrics {
    reconciliations: IntCounter,
    failures: IntCounterVec,
    reconcile_duration: HistogramVec,
}

impl Metrics {
    /// Creates the reconcile metrics and registers them with the given
    /// registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let reconciliations =
            IntCounter::new("cfapi_operator_reconciliations_total", "reconciliations")?;
        let failures = IntCounterVec::new(
            opts!(
                "cfapi_operator_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["kind", "instance", "error"],
        )?;
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "cfapi_operator_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["kind"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(Metrics {
            reconciliations,
            failures,
            reconcile_duration,
        })
    }

    pub fn reconcile_failure<T: kube::Resource<DynamicType = ()>>(&self, resource: &T, e: &Error) {
        self.failures
            .with_label_values(&[
                T::kind(&()).as_ref(),
                resource.name_any().as_ref(),
                e.metric_label(),
            ])
            .inc()
    }

    /// Counts a reconcile and returns a guard that records its duration in
    /// the histogram on drop.
    pub fn count_and_measure<T: kube::Resource<DynamicType = ()>>(&self) -> ReconcileMeasurer<T> {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            _resource_type: PhantomData,
        }
    }
}

pub struct ReconcileMeasurer<T: kube::Resource<DynamicType = ()>> {
    start: Instant,
    metric: HistogramVec,
    _resource_type: PhantomData<T>,
}

impl<T: kube::Resource<DynamicType = ()>> Drop for ReconcileMeasurer<T> {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[T::kind(&()).as_ref()])
            .observe(duration);
    }
}
