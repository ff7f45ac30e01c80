use crate::graph::GraphStats;
use policy_agent_k8s_api::{FeedEvent, Kind};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct CalcMetrics {
    feed_events: Family<FeedLabels, Counter>,
    feed_resets: Family<KindLabels, Counter>,
    malformed: Family<KindLabels, Counter>,
    deltas: Counter,
    snapshots: Counter,

    endpoints: Gauge,
    local_endpoints: Gauge,
    selectors: Gauge,
    ip_sets: Gauge,
    active_policies: Gauge,
    active_profiles: Gauge,
    parked_policies: Gauge,
    selector_evaluations: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FeedLabels {
    kind: String,
    event: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

// === impl CalcMetrics ===

impl CalcMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let feed_events = Family::default();
        prom.register(
            "feed_events",
            "Count of datastore events processed",
            feed_events.clone(),
        );

        let feed_resets = Family::default();
        prom.register(
            "feed_resets",
            "Count of datastore watch restarts",
            feed_resets.clone(),
        );

        let malformed = Family::default();
        prom.register(
            "malformed_updates",
            "Count of datastore updates rejected as invalid",
            malformed.clone(),
        );

        let deltas = Counter::default();
        prom.register(
            "intent_deltas",
            "Count of incremental intent updates emitted",
            deltas.clone(),
        );

        let snapshots = Counter::default();
        prom.register(
            "intent_snapshots",
            "Count of full intent updates emitted",
            snapshots.clone(),
        );

        let endpoints = Gauge::default();
        prom.register(
            "endpoints",
            "Gauge of the number of indexed endpoints",
            endpoints.clone(),
        );

        let local_endpoints = Gauge::default();
        prom.register(
            "local_endpoints",
            "Gauge of the number of endpoints enforced on this node",
            local_endpoints.clone(),
        );

        let selectors = Gauge::default();
        prom.register(
            "selectors",
            "Gauge of the number of indexed selectors",
            selectors.clone(),
        );

        let ip_sets = Gauge::default();
        prom.register(
            "ip_sets",
            "Gauge of the number of active address sets",
            ip_sets.clone(),
        );

        let active_policies = Gauge::default();
        prom.register(
            "active_policies",
            "Gauge of the number of policies applied to local endpoints",
            active_policies.clone(),
        );

        let active_profiles = Gauge::default();
        prom.register(
            "active_profiles",
            "Gauge of the number of profiles applied to local endpoints",
            active_profiles.clone(),
        );

        let parked_policies = Gauge::default();
        prom.register(
            "parked_policies",
            "Gauge of the number of policies that reference a missing tier",
            parked_policies.clone(),
        );

        let selector_evaluations = Counter::default();
        prom.register(
            "selector_evaluations",
            "Count of selector evaluations performed by the label index",
            selector_evaluations.clone(),
        );

        Self {
            feed_events,
            feed_resets,
            malformed,
            deltas,
            snapshots,
            endpoints,
            local_endpoints,
            selectors,
            ip_sets,
            active_policies,
            active_profiles,
            parked_policies,
            selector_evaluations,
        }
    }

    pub(crate) fn feed_event(&self, event: &FeedEvent) {
        match event {
            FeedEvent::Restarted(kind) => {
                self.feed_resets
                    .get_or_create(&KindLabels {
                        kind: kind.to_string(),
                    })
                    .inc();
            }
            FeedEvent::Resource(ev) => {
                self.feed_events
                    .get_or_create(&FeedLabels {
                        kind: ev.kind.to_string(),
                        event: ev.event_type.as_str().to_string(),
                    })
                    .inc();
            }
            FeedEvent::Synced(_) => {}
        }
    }

    pub(crate) fn malformed(&self, kind: Kind) {
        self.malformed
            .get_or_create(&KindLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    pub(crate) fn delta(&self) {
        self.deltas.inc();
    }

    pub(crate) fn snapshot(&self) {
        self.snapshots.inc();
    }

    pub(crate) fn observe(&self, stats: &GraphStats) {
        self.endpoints.set(stats.endpoints as i64);
        self.local_endpoints.set(stats.local_endpoints as i64);
        self.selectors.set(stats.selectors as i64);
        self.ip_sets.set(stats.ip_sets as i64);
        self.active_policies.set(stats.active_policies as i64);
        self.active_profiles.set(stats.active_profiles as i64);
        self.parked_policies.set(stats.parked_policies as i64);

        // The index counts evaluations cumulatively.
        let seen = self.selector_evaluations.get();
        if stats.selector_evaluations > seen {
            self.selector_evaluations
                .inc_by(stats.selector_evaluations - seen);
        }
    }
}
