//! The calculation graph: fans feed events through the label index, the resolver and the address
//! set calculator, and accumulates the resulting intent changes until they are flushed.
//!
//! Every event is fully propagated before `apply` returns, so the graph is consistent between
//! events. Changes to derived state are only reported on `flush`, which folds them into a single
//! versioned delta.

use crate::{
    endpoints::Endpoint,
    ip_sets::IpSetCalculator,
    label_index::{LabelIndex, MatchDelta},
    resolver::{PolicyMeta, Resolver, TierInfo},
    rules::{self, ParsedPolicy, SetSource},
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::{anyhow, Context, Result};
use ipnet::IpNet;
use policy_agent_core::{
    policy::DEFAULT_TIER, EndpointId, EndpointIntent, Intent, IntentDelta, PolicyId, PolicyRules,
    Route, SetId, TierAction,
};
use policy_agent_k8s_api::{
    labels::Map,
    policy::{self as api, PolicyBody, PolicyType, ProfileSpec},
    EventType, FeedEvent, Kind, Payload, ResourceEvent, ResourceName,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Identifies a selector in the label index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SelectorKey {
    Policy(PolicyId),
    IpSet(SetId),
}

#[derive(Debug)]
pub struct CalcGraph {
    node: String,

    index: LabelIndex<EndpointId, SelectorKey>,
    endpoints: HashMap<EndpointId, Endpoint>,
    policies: HashMap<PolicyId, ParsedPolicy>,
    profiles: HashMap<String, ProfileState>,

    /// Endpoints by each profile they list, so that changes to a profile's labels can be
    /// propagated to the endpoints that inherit them.
    profile_endpoints: HashMap<String, HashSet<EndpointId>>,

    resolver: Resolver,
    ip_sets: IpSetCalculator,

    /// Policies and profiles referenced by at least one emitted endpoint chain.
    active: HashMap<RuleOwner, Activation>,

    /// The owner of each route, and every local endpoint that claims its destination.
    routes: HashMap<IpNet, (EndpointId, Route)>,
    route_claims: HashMap<IpNet, BTreeSet<EndpointId>>,
    endpoint_routes: HashMap<EndpointId, (String, Vec<IpNet>)>,

    feed: FeedState,

    /// The intent as of the last flush.
    intent: Intent,
    pending: IntentDelta,
}

/// Counts describing the size of the graph.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GraphStats {
    pub endpoints: usize,
    pub local_endpoints: usize,
    pub selectors: usize,
    pub ip_sets: usize,
    pub active_policies: usize,
    pub active_profiles: usize,
    pub parked_policies: usize,
    pub selector_evaluations: u64,
}

#[derive(Debug)]
struct ProfileState {
    labels: Option<Map>,
    parsed: ParsedPolicy,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum RuleOwner {
    Policy(PolicyId),
    Profile(String),
}

#[derive(Debug)]
struct Activation {
    /// The number of emitted endpoint chains that reference the owner.
    refs: usize,

    /// The rules as last published, along with the sets they hold references on.
    parsed: ParsedPolicy,
}

#[derive(Debug, Default)]
struct FeedState {
    known: HashMap<Kind, HashSet<ResourceName>>,

    /// Kinds being re-listed after a restart, with the names listed so far.
    relisting: HashMap<Kind, HashSet<ResourceName>>,

    synced: HashSet<Kind>,
    snapshot_due: bool,
}

// === impl CalcGraph ===

impl CalcGraph {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            index: LabelIndex::default(),
            endpoints: HashMap::default(),
            policies: HashMap::default(),
            profiles: HashMap::default(),
            profile_endpoints: HashMap::default(),
            resolver: Resolver::default(),
            ip_sets: IpSetCalculator::default(),
            active: HashMap::default(),
            routes: HashMap::default(),
            route_claims: HashMap::default(),
            endpoint_routes: HashMap::default(),
            feed: FeedState::default(),
            intent: Intent::default(),
            pending: IntentDelta::default(),
        }
    }

    /// Propagates a single feed event through the graph.
    ///
    /// An update that can't be converted is rejected without modifying the graph, so the last
    /// valid version of the resource (if any) stays in effect.
    pub fn apply(&mut self, event: FeedEvent) -> Result<()> {
        match event {
            FeedEvent::Restarted(kind) => {
                debug!(%kind, "Relisting");
                self.feed.relisting.insert(kind, HashSet::default());
                Ok(())
            }
            FeedEvent::Synced(kind) => {
                self.synced(kind);
                Ok(())
            }
            FeedEvent::Resource(event) => self.apply_resource(event),
        }
    }

    /// Indicates whether every kind has been listed at least once.
    pub fn is_synced(&self) -> bool {
        Kind::ALL.iter().all(|k| self.feed.synced.contains(k))
    }

    /// Returns true (once) if a listing completed since the last call, so that the full intent
    /// should be re-emitted.
    pub fn take_snapshot_due(&mut self) -> bool {
        std::mem::take(&mut self.feed.snapshot_due)
    }

    /// Computes the intent changes accumulated since the last flush.
    ///
    /// Returns `None` if the intent is unchanged. Otherwise the delta carries a new version and has
    /// already been applied to the graph's intent.
    pub fn flush(&mut self) -> Option<IntentDelta> {
        let changes = self.resolver.flush();

        let mut gained = Vec::new();
        let mut lost = Vec::new();
        for (id, chain) in &changes {
            let new = chain.as_ref().map(references).unwrap_or_default();
            let old = self
                .intent
                .endpoints
                .get(id)
                .map(references)
                .unwrap_or_default();
            gained.extend(new.difference(&old).cloned());
            lost.extend(old.difference(&new).cloned());
        }
        // Activations go first so that sets shared between outgoing and incoming rules are never
        // torn down in between.
        for owner in gained {
            self.activate(owner);
        }
        for owner in &lost {
            self.deactivate(owner);
        }

        self.pending.endpoints.extend(changes);
        self.pending.ip_sets = self.ip_sets.take_updates();

        let mut delta = std::mem::take(&mut self.pending);
        if delta.is_empty() {
            return None;
        }
        self.intent.version += 1;
        delta.version = self.intent.version;
        self.intent.apply(&delta);
        Some(delta)
    }

    /// Flushes pending changes and returns the complete intent.
    pub fn snapshot(&mut self) -> Intent {
        self.flush();
        self.intent.clone()
    }

    /// The intent as of the last flush.
    pub fn intent(&self) -> &Intent {
        &self.intent
    }

    pub fn stats(&self) -> GraphStats {
        let (active_policies, active_profiles) =
            self.active
                .keys()
                .fold((0, 0), |(policies, profiles), owner| match owner {
                    RuleOwner::Policy(_) => (policies + 1, profiles),
                    RuleOwner::Profile(_) => (policies, profiles + 1),
                });
        GraphStats {
            endpoints: self.index.endpoints_len(),
            local_endpoints: self.intent.endpoints.len(),
            selectors: self.index.selectors_len(),
            ip_sets: self.ip_sets.len(),
            active_policies,
            active_profiles,
            parked_policies: self.resolver.parked_policies(),
            selector_evaluations: self.index.evaluations(),
        }
    }

    fn synced(&mut self, kind: Kind) {
        if let Some(listed) = self.feed.relisting.remove(&kind) {
            let known = self.feed.known.remove(&kind).unwrap_or_default();
            let stale = known
                .difference(&listed)
                .cloned()
                .collect::<BTreeSet<_>>();
            for name in &stale {
                info!(%kind, %name, "Removing resource that was not relisted");
                self.delete(kind, name);
            }
            self.feed.known.insert(kind, listed);
        }

        let first = self.feed.synced.insert(kind);
        if first {
            debug!(%kind, "Synced");
        }
        if self.is_synced() {
            self.feed.snapshot_due = true;
        }
    }

    fn apply_resource(&mut self, event: ResourceEvent) -> Result<()> {
        let ResourceEvent {
            kind,
            name,
            resource_version,
            event_type,
            payload,
        } = event;
        debug!(%kind, %name, ?resource_version, event = event_type.as_str());

        if event_type == EventType::Deleted {
            if let Some(listed) = self.feed.relisting.get_mut(&kind) {
                listed.remove(&name);
            }
            if let Some(known) = self.feed.known.get_mut(&kind) {
                known.remove(&name);
            }
            self.delete(kind, &name);
            return Ok(());
        }

        // The name is recorded even if the update is rejected, so that a relist does not delete
        // the last valid version of the resource.
        if let Some(listed) = self.feed.relisting.get_mut(&kind) {
            listed.insert(name.clone());
        }
        self.feed
            .known
            .entry(kind)
            .or_default()
            .insert(name.clone());

        let payload = payload.ok_or_else(|| anyhow!("{kind} {name} has no payload"))?;
        self.upsert(&name, payload)
            .with_context(|| format!("invalid {kind} {name}"))
    }

    fn upsert(&mut self, name: &ResourceName, payload: Payload) -> Result<()> {
        match payload {
            Payload::Tier(spec) => {
                let tier = TierInfo {
                    order: spec.order,
                    default_action: match spec.default_action {
                        Some(api::TierAction::Pass) => TierAction::Pass,
                        Some(api::TierAction::Deny) | None => TierAction::Deny,
                    },
                };
                let parked = self.resolver.parked_policies();
                self.resolver.update_tier(&name.name, Some(tier));
                let admitted = parked.saturating_sub(self.resolver.parked_policies());
                if admitted > 0 {
                    info!(tier = %name.name, policies = admitted, "Admitting parked policies");
                }
                Ok(())
            }
            Payload::NetworkPolicy(spec) => {
                let ns = name
                    .namespace
                    .as_deref()
                    .ok_or_else(|| anyhow!("network policies must be namespaced"))?;
                let id = PolicyId::namespaced(ns, &name.name);
                self.update_policy(id, Some(ns), &spec.policy)
            }
            Payload::GlobalNetworkPolicy(spec) => {
                self.update_policy(PolicyId::global(&name.name), None, &spec.policy)
            }
            Payload::Profile(spec) => self.update_profile(&name.name, &spec),
            Payload::WorkloadEndpoint { labels, spec } => {
                let ns = name
                    .namespace
                    .as_deref()
                    .ok_or_else(|| anyhow!("workload endpoints must be namespaced"))?;
                let ep = Endpoint::workload(ns, labels, &spec)?;
                self.update_endpoint(EndpointId::workload(ns, &name.name), Some(ep));
                Ok(())
            }
            Payload::HostEndpoint { labels, spec } => {
                let ep = Endpoint::host(labels, &spec)?;
                self.update_endpoint(EndpointId::host(&name.name), Some(ep));
                Ok(())
            }
        }
    }

    fn delete(&mut self, kind: Kind, name: &ResourceName) {
        match kind {
            Kind::Tier => {
                if name.name == DEFAULT_TIER {
                    info!("Default tier deleted; restoring its defaults");
                }
                let parked = self.resolver.parked_policies();
                self.resolver.update_tier(&name.name, None);
                let newly_parked = self.resolver.parked_policies().saturating_sub(parked);
                if newly_parked > 0 {
                    info!(tier = %name.name, policies = newly_parked, "Parking policies of deleted tier");
                }
            }
            Kind::NetworkPolicy => {
                if let Some(ns) = name.namespace.as_deref() {
                    self.remove_policy(&PolicyId::namespaced(ns, &name.name));
                }
            }
            Kind::GlobalNetworkPolicy => self.remove_policy(&PolicyId::global(&name.name)),
            Kind::Profile => self.remove_profile(&name.name),
            Kind::WorkloadEndpoint => {
                if let Some(ns) = name.namespace.as_deref() {
                    self.update_endpoint(EndpointId::workload(ns, &name.name), None);
                }
            }
            Kind::HostEndpoint => self.update_endpoint(EndpointId::host(&name.name), None),
        }
    }

    // === Policies and profiles ===

    fn update_policy(&mut self, id: PolicyId, ns: Option<&str>, body: &PolicyBody) -> Result<()> {
        let selector =
            rules::parse_selector(body.selector.as_deref(), ns).context("invalid selector")?;
        let parsed = rules::convert(ns, body.ingress.as_deref(), body.egress.as_deref())?;
        let (ingress, egress) = match &body.types {
            Some(types) => (
                types.contains(&PolicyType::Ingress),
                types.contains(&PolicyType::Egress),
            ),
            None => (
                true,
                body.egress.as_ref().is_some_and(|rules| !rules.is_empty()),
            ),
        };
        let meta = PolicyMeta {
            tier: body.tier.clone().unwrap_or_else(|| DEFAULT_TIER.to_string()),
            order: body.order,
            ingress,
            egress,
        };
        if !self.resolver.has_tier(&meta.tier) {
            info!(policy = %id, tier = %meta.tier, "Parking policy until its tier exists");
        }

        let deltas = self
            .index
            .update_selector(SelectorKey::Policy(id.clone()), selector);
        self.apply_deltas(deltas);
        self.resolver.update_policy(&id, Some(meta));

        self.refresh(RuleOwner::Policy(id.clone()), &parsed);
        self.policies.insert(id, parsed);
        Ok(())
    }

    fn remove_policy(&mut self, id: &PolicyId) {
        if self.policies.remove(id).is_none() {
            return;
        }
        let deltas = self.index.remove_selector(&SelectorKey::Policy(id.clone()));
        self.apply_deltas(deltas);
        self.resolver.update_policy(id, None);
    }

    fn update_profile(&mut self, name: &str, spec: &ProfileSpec) -> Result<()> {
        let parsed = rules::convert(None, spec.ingress.as_deref(), spec.egress.as_deref())?;
        let labels = spec.labels_to_apply.clone().filter(|l| !l.is_empty());

        let prior = self.profiles.insert(
            name.to_string(),
            ProfileState {
                labels: labels.clone(),
                parsed: parsed.clone(),
            },
        );
        if prior.is_none() {
            self.resolver.update_profile(name, true);
        }
        if prior.map(|p| p.labels) != Some(labels) {
            self.relabel_profile_endpoints(name);
        }
        self.refresh(RuleOwner::Profile(name.to_string()), &parsed);
        Ok(())
    }

    fn remove_profile(&mut self, name: &str) {
        if self.profiles.remove(name).is_none() {
            return;
        }
        self.resolver.update_profile(name, false);
        self.relabel_profile_endpoints(name);
    }

    /// Publishes new rules for an active policy or profile, moving its set references over to the
    /// new rules.
    fn refresh(&mut self, owner: RuleOwner, parsed: &ParsedPolicy) {
        let Some(mut activation) = self.active.remove(&owner) else {
            return;
        };
        if activation.parsed != *parsed {
            self.register_sets(&parsed.sets);
            self.unregister_sets(&activation.parsed.sets);
            self.publish(&owner, Some(parsed.rules.clone()));
            activation.parsed = parsed.clone();
        }
        self.active.insert(owner, activation);
    }

    fn activate(&mut self, owner: RuleOwner) {
        if let Some(activation) = self.active.get_mut(&owner) {
            activation.refs += 1;
            return;
        }
        let parsed = match &owner {
            RuleOwner::Policy(id) => self.policies.get(id).cloned(),
            RuleOwner::Profile(name) => self.profiles.get(name).map(|p| p.parsed.clone()),
        };
        let Some(parsed) = parsed else {
            return;
        };
        debug!(?owner, "Activating");
        self.register_sets(&parsed.sets);
        self.publish(&owner, Some(parsed.rules.clone()));
        self.active.insert(owner, Activation { refs: 1, parsed });
    }

    fn deactivate(&mut self, owner: &RuleOwner) {
        let Some(activation) = self.active.get_mut(owner) else {
            return;
        };
        activation.refs -= 1;
        if activation.refs > 0 {
            return;
        }
        if let Some(activation) = self.active.remove(owner) {
            debug!(?owner, "Deactivating");
            self.unregister_sets(&activation.parsed.sets);
            self.publish(owner, None);
        }
    }

    fn publish(&mut self, owner: &RuleOwner, rules: Option<PolicyRules>) {
        match owner {
            RuleOwner::Policy(id) => {
                self.pending.policies.insert(id.clone(), rules);
            }
            RuleOwner::Profile(name) => {
                self.pending.profiles.insert(name.clone(), rules);
            }
        }
    }

    // === Address sets ===

    fn register_sets(&mut self, sets: &BTreeMap<SetId, SetSource>) {
        for (id, source) in sets {
            if !self.ip_sets.register(id, source) {
                continue;
            }
            if let Some(selector) = &source.selector {
                let deltas = self
                    .index
                    .update_selector(SelectorKey::IpSet(id.clone()), selector.clone());
                self.apply_deltas(deltas);
            }
        }
    }

    fn unregister_sets(&mut self, sets: &BTreeMap<SetId, SetSource>) {
        for id in sets.keys() {
            if self.ip_sets.unregister(id) {
                // The set is gone, so its lost matches need no processing.
                self.index.remove_selector(&SelectorKey::IpSet(id.clone()));
            }
        }
    }

    fn apply_deltas(&mut self, deltas: Vec<MatchDelta<EndpointId, SelectorKey>>) {
        for MatchDelta {
            selector,
            endpoint,
            matched,
        } in deltas
        {
            match selector {
                SelectorKey::Policy(policy) => {
                    self.resolver.update_match(&policy, &endpoint, matched)
                }
                SelectorKey::IpSet(set) => {
                    if !matched {
                        self.ip_sets.clear_contribution(&set, &endpoint);
                    } else if let Some(ep) = self.endpoints.get(&endpoint) {
                        self.ip_sets.set_contribution(&set, &endpoint, &ep.members);
                    }
                }
            }
        }
    }

    // === Endpoints ===

    fn update_endpoint(&mut self, id: EndpointId, endpoint: Option<Endpoint>) {
        let Some(endpoint) = endpoint else {
            let Some(prior) = self.endpoints.remove(&id) else {
                return;
            };
            self.unlink_profiles(&id, &prior.profiles);
            let deltas = self.index.remove_endpoint(&id);
            self.apply_deltas(deltas);
            self.resolver.update_endpoint(&id, None);
            self.update_routes(&id, None);
            return;
        };

        let prior = self.endpoints.insert(id.clone(), endpoint.clone());
        if prior.as_ref() == Some(&endpoint) {
            return;
        }
        if let Some(prior) = &prior {
            self.unlink_profiles(&id, &prior.profiles);
        }
        for profile in &endpoint.profiles {
            self.profile_endpoints
                .entry(profile.clone())
                .or_default()
                .insert(id.clone());
        }

        self.reindex_endpoint(&id);

        // Sets the endpoint still matches must see its new addresses and ports.
        if prior.map(|p| p.members).as_ref() != Some(&endpoint.members) {
            let sets = self
                .index
                .selectors_for(&id)
                .filter_map(|key| match key {
                    SelectorKey::IpSet(set) => Some(set.clone()),
                    SelectorKey::Policy(_) => None,
                })
                .collect::<Vec<_>>();
            for set in &sets {
                self.ip_sets.set_contribution(set, &id, &endpoint.members);
            }
        }

        let local = endpoint.local(&self.node);
        let route = match &local {
            Some(local) if endpoint.routed => Some((local.interface.clone(), endpoint.members.nets)),
            _ => None,
        };
        self.resolver.update_endpoint(&id, local);
        self.update_routes(&id, route);
    }

    fn unlink_profiles(&mut self, id: &EndpointId, profiles: &[String]) {
        for profile in profiles {
            if let Some(eps) = self.profile_endpoints.get_mut(profile) {
                eps.remove(id);
                if eps.is_empty() {
                    self.profile_endpoints.remove(profile);
                }
            }
        }
    }

    fn relabel_profile_endpoints(&mut self, profile: &str) {
        let Some(eps) = self.profile_endpoints.get(profile) else {
            return;
        };
        let mut eps = eps.iter().cloned().collect::<Vec<_>>();
        eps.sort();
        for id in &eps {
            self.reindex_endpoint(id);
        }
    }

    /// Recomputes the effective labels of an endpoint and updates the index.
    fn reindex_endpoint(&mut self, id: &EndpointId) {
        let Some(endpoint) = self.endpoints.get(id) else {
            return;
        };
        let profiles = &self.profiles;
        let labels = endpoint.effective_labels(|name| profiles.get(name)?.labels.as_ref());
        let deltas = self.index.update_endpoint_labels(id.clone(), labels);
        self.apply_deltas(deltas);
    }

    // === Routes ===

    fn update_routes(&mut self, id: &EndpointId, route: Option<(String, Vec<IpNet>)>) {
        let (interface, dsts) = route.unwrap_or_default();

        let mut released = Vec::new();
        if let Some((_, prior)) = self.endpoint_routes.remove(id) {
            for dst in prior {
                if dsts.contains(&dst) {
                    continue;
                }
                if let Some(claims) = self.route_claims.get_mut(&dst) {
                    claims.remove(id);
                    if claims.is_empty() {
                        self.route_claims.remove(&dst);
                    }
                }
                released.push(dst);
            }
        }

        for dst in &dsts {
            let claims = self.route_claims.entry(*dst).or_default();
            let claimed = claims.insert(id.clone());
            if claimed && claims.len() > 1 {
                warn!(%dst, endpoint = %id, "Address claimed by multiple endpoints");
            }
            // The most recent claimant owns the route; other updates leave ownership alone.
            let owned = match self.routes.get(dst) {
                Some((owner, _)) => owner == id,
                None => true,
            };
            if !(claimed || owned) {
                continue;
            }
            let route = Route {
                dst: *dst,
                interface: interface.clone(),
            };
            if matches!(self.routes.get(dst), Some((owner, existing)) if owner == id && *existing == route)
            {
                continue;
            }
            self.routes.insert(*dst, (id.clone(), route.clone()));
            self.pending.routes.insert(*dst, Some(route));
        }

        if !dsts.is_empty() {
            self.endpoint_routes.insert(id.clone(), (interface, dsts));
        }

        for dst in released {
            self.release_route(dst, id);
        }
    }

    /// Hands a route the endpoint no longer claims to a remaining claimant, or removes it.
    fn release_route(&mut self, dst: IpNet, id: &EndpointId) {
        if !matches!(self.routes.get(&dst), Some((owner, _)) if owner == id) {
            return;
        }
        let next = self
            .route_claims
            .get(&dst)
            .and_then(|claims| claims.iter().next())
            .and_then(|owner| {
                let (interface, _) = self.endpoint_routes.get(owner)?;
                let route = Route {
                    dst,
                    interface: interface.clone(),
                };
                Some((owner.clone(), route))
            });
        match next {
            Some((owner, route)) => {
                debug!(%dst, endpoint = %owner, "Route handed over");
                self.routes.insert(dst, (owner, route.clone()));
                self.pending.routes.insert(dst, Some(route));
            }
            None => {
                self.routes.remove(&dst);
                self.pending.routes.insert(dst, None);
            }
        }
    }
}

/// The policies and profiles an endpoint chain refers to.
fn references(ep: &EndpointIntent) -> BTreeSet<RuleOwner> {
    let mut owners = BTreeSet::new();
    for chain in [&ep.ingress, &ep.egress] {
        for tier in &chain.tiers {
            owners.extend(tier.policies.iter().cloned().map(RuleOwner::Policy));
        }
        owners.extend(chain.profiles.iter().cloned().map(RuleOwner::Profile));
    }
    owners
}
