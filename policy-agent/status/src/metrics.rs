use policy_agent_core::{ClassHealth, ResourceClass};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

const STATES: [&str; 4] = ["unknown", "in_sync", "dirty", "degraded"];

#[derive(Clone, Debug)]
pub struct StatusMetrics {
    state: Family<StateLabels, Gauge>,
    transitions: Family<StateLabels, Counter>,
    applied_version: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct StateLabels {
    class: String,
    state: String,
}

// === impl StatusMetrics ===

impl StatusMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let state = Family::default();
        prom.register(
            "class_state",
            "Whether a resource class is in the given state",
            state.clone(),
        );

        let transitions = Family::default();
        prom.register(
            "class_transitions",
            "Count of resource class state changes",
            transitions.clone(),
        );

        let applied_version = Gauge::default();
        prom.register(
            "applied_intent_version",
            "The last intent version fully applied to the dataplane",
            applied_version.clone(),
        );

        Self {
            state,
            transitions,
            applied_version,
        }
    }

    /// Sets the state gauges of `class` so that exactly one state is set.
    pub(crate) fn set(&self, class: ResourceClass, health: &ClassHealth) {
        for state in STATES {
            let value = i64::from(state == health.as_str());
            self.state.get_or_create(&labels(class, state)).set(value);
        }
    }

    pub(crate) fn transition(&self, class: ResourceClass, health: &ClassHealth) {
        self.set(class, health);
        self.transitions
            .get_or_create(&labels(class, health.as_str()))
            .inc();
    }

    pub(crate) fn applied(&self, version: u64) {
        self.applied_version
            .set(i64::try_from(version).unwrap_or(i64::MAX));
    }

    #[cfg(test)]
    pub(crate) fn state_of(&self, class: ResourceClass, state: &str) -> i64 {
        self.state.get_or_create(&labels(class, state)).get()
    }

    #[cfg(test)]
    pub(crate) fn transitions_to(&self, class: ResourceClass, state: &str) -> u64 {
        self.transitions.get_or_create(&labels(class, state)).get()
    }

    #[cfg(test)]
    pub(crate) fn applied_version(&self) -> i64 {
        self.applied_version.get()
    }
}

fn labels(class: ResourceClass, state: &str) -> StateLabels {
    StateLabels {
        class: class.to_string(),
        state: state.to_string(),
    }
}
