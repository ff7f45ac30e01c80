//! Orders the policies and profiles that apply to each local endpoint.
//!
//! Tiers are evaluated in ascending order (unordered tiers last, ties broken by name), policies
//! within a tier likewise, and profiles after every tier in the order the endpoint lists them.
//! Policies whose tier does not exist are parked: they are excluded from every chain until the tier
//! is created.
//!
//! Updates only mark the affected endpoints dirty; chains are recomputed when the graph flushes and
//! only chains that actually changed are reported.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use policy_agent_core::{
    policy::{DEFAULT_TIER, DEFAULT_TIER_ORDER},
    Direction, DirectionChain, EndpointId, EndpointIntent, PolicyId, TierAction, TierChain,
};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
};

#[derive(Debug)]
pub(crate) struct Resolver {
    tiers: HashMap<String, TierInfo>,
    policies: HashMap<PolicyId, PolicyMeta>,
    profiles: HashSet<String>,

    policy_endpoints: HashMap<PolicyId, HashSet<EndpointId>>,
    endpoint_policies: HashMap<EndpointId, HashSet<PolicyId>>,

    local: HashMap<EndpointId, LocalEndpoint>,
    emitted: HashMap<EndpointId, EndpointIntent>,
    dirty: BTreeSet<EndpointId>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct TierInfo {
    pub order: Option<f64>,
    pub default_action: TierAction,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PolicyMeta {
    pub tier: String,
    pub order: Option<f64>,
    pub ingress: bool,
    pub egress: bool,
}

/// An endpoint on this node that can be enforced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LocalEndpoint {
    pub interface: String,
    pub profiles: Vec<String>,
}

// === impl Resolver ===

impl Default for Resolver {
    fn default() -> Self {
        let mut tiers = HashMap::default();
        tiers.insert(DEFAULT_TIER.to_string(), TierInfo::default_tier());
        Self {
            tiers,
            policies: HashMap::default(),
            profiles: HashSet::default(),
            policy_endpoints: HashMap::default(),
            endpoint_policies: HashMap::default(),
            local: HashMap::default(),
            emitted: HashMap::default(),
            dirty: BTreeSet::new(),
        }
    }
}

impl Resolver {
    pub(crate) fn has_tier(&self, name: &str) -> bool {
        self.tiers.contains_key(name)
    }

    /// Creates, updates or (with `None`) deletes a tier.
    ///
    /// The default tier can't be deleted: deleting it restores its default settings.
    pub(crate) fn update_tier(&mut self, name: &str, tier: Option<TierInfo>) {
        let tier = match tier {
            Some(tier) => Some(tier),
            None if name == DEFAULT_TIER => Some(TierInfo::default_tier()),
            None => None,
        };
        let prior = match &tier {
            Some(tier) => self.tiers.insert(name.to_string(), tier.clone()),
            None => self.tiers.remove(name),
        };
        if prior == tier {
            return;
        }

        let policies = self
            .policies
            .iter()
            .filter(|(_, meta)| meta.tier == name)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        for id in &policies {
            self.dirty_policy(id);
        }
    }

    /// The number of policies that reference a tier that does not exist.
    pub(crate) fn parked_policies(&self) -> usize {
        self.policies
            .values()
            .filter(|meta| !self.tiers.contains_key(&meta.tier))
            .count()
    }

    pub(crate) fn update_policy(&mut self, id: &PolicyId, meta: Option<PolicyMeta>) {
        let changed = match meta {
            Some(meta) => self.policies.insert(id.clone(), meta.clone()) != Some(meta),
            None => self.policies.remove(id).is_some(),
        };
        if changed {
            self.dirty_policy(id);
        }
    }

    pub(crate) fn update_profile(&mut self, name: &str, exists: bool) {
        let changed = if exists {
            self.profiles.insert(name.to_string())
        } else {
            self.profiles.remove(name)
        };
        if changed {
            let endpoints = self
                .local
                .iter()
                .filter(|(_, ep)| ep.profiles.iter().any(|p| p == name))
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>();
            self.dirty.extend(endpoints);
        }
    }

    /// Records a change in whether a policy's selector matches an endpoint.
    pub(crate) fn update_match(&mut self, policy: &PolicyId, endpoint: &EndpointId, matched: bool) {
        if matched {
            self.policy_endpoints
                .entry(policy.clone())
                .or_default()
                .insert(endpoint.clone());
            self.endpoint_policies
                .entry(endpoint.clone())
                .or_default()
                .insert(policy.clone());
        } else {
            if let Some(eps) = self.policy_endpoints.get_mut(policy) {
                eps.remove(endpoint);
                if eps.is_empty() {
                    self.policy_endpoints.remove(policy);
                }
            }
            if let Some(policies) = self.endpoint_policies.get_mut(endpoint) {
                policies.remove(policy);
                if policies.is_empty() {
                    self.endpoint_policies.remove(endpoint);
                }
            }
        }
        if self.local.contains_key(endpoint) {
            self.dirty.insert(endpoint.clone());
        }
    }

    /// Sets (or, with `None`, clears) the local enforcement state of an endpoint.
    pub(crate) fn update_endpoint(&mut self, id: &EndpointId, local: Option<LocalEndpoint>) {
        let changed = match local {
            Some(local) => self.local.insert(id.clone(), local.clone()) != Some(local),
            None => self.local.remove(id).is_some(),
        };
        if changed {
            self.dirty.insert(id.clone());
        }
    }

    fn dirty_policy(&mut self, id: &PolicyId) {
        if let Some(eps) = self.policy_endpoints.get(id) {
            self.dirty.extend(
                eps.iter()
                    .filter(|ep| self.local.contains_key(*ep))
                    .cloned(),
            );
        }
    }

    /// Recomputes the chains of every dirty endpoint, returning those that changed. Endpoints that
    /// are no longer enforced locally are reported as `None`.
    pub(crate) fn flush(&mut self) -> BTreeMap<EndpointId, Option<EndpointIntent>> {
        let mut changes = BTreeMap::new();
        for id in std::mem::take(&mut self.dirty) {
            let chain = self.compute(&id);
            let prior = match &chain {
                Some(chain) => self.emitted.insert(id.clone(), chain.clone()),
                None => self.emitted.remove(&id),
            };
            if prior != chain {
                changes.insert(id, chain);
            }
        }
        changes
    }

    fn compute(&self, id: &EndpointId) -> Option<EndpointIntent> {
        let local = self.local.get(id)?;

        let mut profiles = Vec::with_capacity(local.profiles.len());
        for name in &local.profiles {
            if self.profiles.contains(name) && !profiles.contains(name) {
                profiles.push(name.clone());
            }
        }

        let policies = self
            .endpoint_policies
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|pid| {
                let meta = self.policies.get(pid)?;
                let tier = self.tiers.get(&meta.tier)?;
                Some((pid, meta, tier))
            })
            .collect::<Vec<_>>();

        let chain = |direction: Direction| {
            let mut applicable = policies
                .iter()
                .filter(|(_, meta, _)| meta.applies_to(direction))
                .collect::<Vec<_>>();
            applicable.sort_by(|(a_id, a, a_tier), (b_id, b, b_tier)| {
                cmp_order(a_tier.order, b_tier.order)
                    .then_with(|| a.tier.cmp(&b.tier))
                    .then_with(|| cmp_order(a.order, b.order))
                    .then_with(|| a_id.name.cmp(&b_id.name))
                    .then_with(|| a_id.namespace.cmp(&b_id.namespace))
            });

            let mut tiers: Vec<TierChain> = Vec::new();
            for (pid, meta, tier) in applicable {
                match tiers.last_mut() {
                    Some(last) if last.name == meta.tier => last.policies.push((*pid).clone()),
                    _ => tiers.push(TierChain {
                        name: meta.tier.clone(),
                        default_action: tier.default_action,
                        policies: vec![(*pid).clone()],
                    }),
                }
            }
            DirectionChain {
                tiers,
                profiles: profiles.clone(),
            }
        };

        Some(EndpointIntent {
            interface: local.interface.clone(),
            ingress: chain(Direction::Ingress),
            egress: chain(Direction::Egress),
        })
    }
}

/// Orders optional orders ascending, with unset orders last.
fn cmp_order(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

// === impl TierInfo ===

impl TierInfo {
    fn default_tier() -> Self {
        Self {
            order: Some(DEFAULT_TIER_ORDER),
            default_action: TierAction::Deny,
        }
    }
}

// === impl PolicyMeta ===

impl PolicyMeta {
    fn applies_to(&self, direction: Direction) -> bool {
        match direction {
            Direction::Ingress => self.ingress,
            Direction::Egress => self.egress,
        }
    }
}
