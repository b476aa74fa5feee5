use crate::{reconcile::Outcome, Error};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

/// Counts reconciliation passes and their durations.
#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    passes: Family<PassLabels, Counter>,
    duration: Family<TriggerLabels, Histogram>,
}

/// Counts generation attempts by result.
#[derive(Clone, Debug, Default)]
pub struct GenerationMetrics {
    attempts: Family<ResultLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct PassLabels {
    trigger: &'static str,
    outcome: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct TriggerLabels {
    trigger: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ResultLabels {
    result: &'static str,
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let passes = Family::<PassLabels, Counter>::default();
        reg.register(
            "passes",
            "Total number of reconciliation passes by trigger and outcome",
            passes.clone(),
        );

        let duration = Family::<TriggerLabels, Histogram>::new_with_constructor(|| {
            // Passes are dominated by generation, which is bounded by a
            // deadline of a minute or two.
            Histogram::new([0.1, 1.0, 10.0, 30.0, 90.0, 300.0].into_iter())
        });
        reg.register_with_unit(
            "duration",
            "Histogram of reconciliation pass durations",
            Unit::Seconds,
            duration.clone(),
        );

        Self { passes, duration }
    }

    pub(crate) fn record(&self, trigger: &'static str, outcome: &Outcome, start: time::Instant) {
        self.passes
            .get_or_create(&PassLabels {
                trigger,
                outcome: outcome.label(),
            })
            .inc();
        self.duration
            .get_or_create(&TriggerLabels { trigger })
            .observe(start.elapsed().as_secs_f64());
    }
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

// === impl GenerationMetrics ===

impl GenerationMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let attempts = Family::<ResultLabels, Counter>::default();
        reg.register(
            "attempts",
            "Total number of policy generation attempts by result",
            attempts.clone(),
        );
        Self { attempts }
    }

    pub(crate) fn record<T>(&self, result: &Result<T, Error>) {
        let result = match result {
            Ok(_) => "ok",
            Err(error) => error.kind(),
        };
        self.attempts.get_or_create(&ResultLabels { result }).inc();
    }

    #[cfg(test)]
    pub(crate) fn count(&self, result: &'static str) -> u64 {
        self.attempts.get_or_create(&ResultLabels { result }).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn counts_attempts_by_result() {
        let metrics = GenerationMetrics::default();
        metrics.record::<()>(&Ok(()));
        metrics.record::<()>(&Err(Error::GenerationTimeout(Duration::from_secs(90))));
        metrics.record::<()>(&Err(Error::GenerationTimeout(Duration::from_secs(90))));
        assert_eq!(metrics.count("ok"), 1);
        assert_eq!(metrics.count("generation_timeout"), 2);
    }

    #[test]
    fn encodes_pass_counters() {
        let mut reg = Registry::default();
        let metrics = ReconcileMetrics::register(reg.sub_registry_with_prefix("reconcile"));
        metrics.record("intent", &Outcome::Requeue(Error::Fetch(
            crate::cluster::ClusterError::Other("unavailable".to_string()),
        )), time::Instant::now());

        let mut text = String::new();
        prometheus_client::encoding::text::encode(&mut text, &reg).unwrap();
        assert!(
            text.contains(r#"reconcile_passes_total{trigger="intent",outcome="requeue"} 1"#),
            "{text}"
        );
    }
}
