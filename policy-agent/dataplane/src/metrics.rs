use crate::plan::Op;
use policy_agent_core::ResourceClass;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct ReconcilerMetrics {
    batches: Counter,
    failed_batches: Counter,
    ops: Family<OpLabels, Counter>,
    apply_duration: Histogram,
    resyncs: Counter,
    drift: Family<ClassLabels, Counter>,
    ignored_updates: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OpLabels {
    op: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ClassLabels {
    class: String,
}

// === impl ReconcilerMetrics ===

impl ReconcilerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let batches = Counter::default();
        prom.register(
            "apply_batches",
            "Count of batches applied to the dataplane",
            batches.clone(),
        );

        let failed_batches = Counter::default();
        prom.register(
            "failed_batches",
            "Count of batches that failed to apply",
            failed_batches.clone(),
        );

        let ops = Family::default();
        prom.register(
            "apply_ops",
            "Count of operations applied to the dataplane",
            ops.clone(),
        );

        let apply_duration = Histogram::new(
            [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0].into_iter(),
        );
        prom.register(
            "apply_duration_seconds",
            "Time taken to apply a batch",
            apply_duration.clone(),
        );

        let resyncs = Counter::default();
        prom.register(
            "resyncs",
            "Count of full reads of the dataplane",
            resyncs.clone(),
        );

        let drift = Family::default();
        prom.register(
            "drift",
            "Count of resources found to differ from what was last applied",
            drift.clone(),
        );

        let ignored_updates = Counter::default();
        prom.register(
            "ignored_intent_updates",
            "Count of intent updates ignored because they were out of sequence",
            ignored_updates.clone(),
        );

        Self {
            batches,
            failed_batches,
            ops,
            apply_duration,
            resyncs,
            drift,
            ignored_updates,
        }
    }

    pub(crate) fn applied(&self, ops: &[Op], elapsed: std::time::Duration) {
        self.batches.inc();
        self.apply_duration.observe(elapsed.as_secs_f64());
        for op in ops {
            self.ops
                .get_or_create(&OpLabels {
                    op: op.as_str().to_string(),
                })
                .inc();
        }
    }

    pub(crate) fn failed(&self) {
        self.failed_batches.inc();
    }

    pub(crate) fn resync(&self) {
        self.resyncs.inc();
    }

    pub(crate) fn drift(&self, class: ResourceClass) {
        self.drift
            .get_or_create(&ClassLabels {
                class: class.to_string(),
            })
            .inc();
    }

    pub(crate) fn ignored(&self) {
        self.ignored_updates.inc();
    }
}
