//! The reconciler's model of the live system, and the operations that bring it to the desired
//! state.

use crate::{
    model::{Chain, ChainKind, Observed, ResourceKey},
    render::Desired,
};
use ipnet::IpNet;
use policy_agent_core::{ClassHealth, IpSet, Member, ResourceClass, Route, SetId};
use std::collections::{BTreeMap, BTreeSet};

/// A change to one live resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    /// Creates the set or atomically replaces its contents.
    ReplaceSet {
        id: SetId,
        set: IpSet,
    },
    UpdateSet {
        id: SetId,
        added: BTreeSet<Member>,
        removed: BTreeSet<Member>,
    },
    DeleteSet {
        id: SetId,
    },

    /// Creates the chain or atomically replaces its rules.
    ReplaceChain {
        name: String,
        chain: Chain,
    },
    DeleteChain {
        name: String,
    },

    ReplaceRoute(Route),
    DeleteRoute(IpNet),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceState {
    InSync,
    Dirty,
    Applying,
}

/// What the reconciler believes the live system holds.
///
/// A resource without a state is unknown: it has never been observed or applied.
#[derive(Debug, Default)]
pub struct Model {
    ip_sets: BTreeMap<SetId, IpSet>,
    chains: BTreeMap<String, String>,
    routes: BTreeMap<IpNet, Route>,
    states: BTreeMap<ResourceKey, ResourceState>,
}

// === impl Op ===

impl Op {
    pub fn key(&self) -> ResourceKey {
        match self {
            Self::ReplaceSet { id, .. } | Self::UpdateSet { id, .. } | Self::DeleteSet { id } => {
                ResourceKey::IpSet(id.clone())
            }
            Self::ReplaceChain { name, .. } | Self::DeleteChain { name } => {
                ResourceKey::Chain(name.clone())
            }
            Self::ReplaceRoute(route) => ResourceKey::Route(route.dst),
            Self::DeleteRoute(dst) => ResourceKey::Route(*dst),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReplaceSet { .. } => "replace_set",
            Self::UpdateSet { .. } => "update_set",
            Self::DeleteSet { .. } => "delete_set",
            Self::ReplaceChain { .. } => "replace_chain",
            Self::DeleteChain { .. } => "delete_chain",
            Self::ReplaceRoute(_) => "replace_route",
            Self::DeleteRoute(_) => "delete_route",
        }
    }

    /// Orders a batch: sets, then chains from the most referenced to the least, then routes.
    /// Teardown runs in the reverse order.
    fn phase(&self) -> u8 {
        let chain = |name: &str| match ChainKind::of(name) {
            ChainKind::Policy => 0,
            ChainKind::Endpoint => 1,
            ChainKind::Dispatch => 2,
            ChainKind::Root => 3,
        };
        match self {
            Self::ReplaceSet { .. } | Self::UpdateSet { .. } => 0,
            Self::ReplaceChain { name, .. } => 1 + chain(name),
            Self::ReplaceRoute(_) => 5,
            Self::DeleteRoute(_) => 6,
            Self::DeleteChain { name } => 10 - chain(name),
            Self::DeleteSet { .. } => 11,
        }
    }
}

/// Sorts operations into the order in which they may be applied.
pub fn order(ops: &mut [Op]) {
    ops.sort_by(|a, b| (a.phase(), a.key()).cmp(&(b.phase(), b.key())));
}

// === impl Model ===

impl Model {
    pub fn mark_dirty(&mut self, keys: impl IntoIterator<Item = ResourceKey>) {
        for key in keys {
            self.states.insert(key, ResourceState::Dirty);
        }
    }

    /// Marks every resource dirty, so that the next plan compares all of them.
    pub fn mark_all_dirty(&mut self, desired: &Desired) {
        let known = self.keys().collect::<Vec<_>>();
        self.mark_dirty(known);
        self.mark_dirty(desired.keys());
    }

    /// Computes the operations that bring every dirty resource to its desired state, in
    /// application order. Resources that already match become in sync; the others are marked as
    /// being applied.
    pub fn plan(&mut self, desired: &Desired) -> Vec<Op> {
        let dirty = self
            .states
            .iter()
            .filter(|(_, s)| **s != ResourceState::InSync)
            .map(|(k, _)| k.clone())
            .collect::<Vec<_>>();

        let mut ops = Vec::new();
        for key in dirty {
            let op = match &key {
                ResourceKey::IpSet(id) => self.plan_set(id, desired.ip_sets.get(id)),
                ResourceKey::Chain(name) => self.plan_chain(name, desired.chains.get(name)),
                ResourceKey::Route(dst) => self.plan_route(dst, desired.routes.get(dst)),
            };
            match op {
                Some(op) => {
                    self.states.insert(key, ResourceState::Applying);
                    ops.push(op);
                }
                None if self.exists(&key) => {
                    self.states.insert(key, ResourceState::InSync);
                }
                None => {
                    self.states.remove(&key);
                }
            }
        }
        order(&mut ops);
        ops
    }

    fn plan_set(&self, id: &SetId, desired: Option<&IpSet>) -> Option<Op> {
        match (self.ip_sets.get(id), desired) {
            (None, None) => None,
            (Some(_), None) => Some(Op::DeleteSet { id: id.clone() }),
            (Some(live), Some(set)) if live.kind == set.kind => {
                let added = set
                    .members
                    .difference(&live.members)
                    .cloned()
                    .collect::<BTreeSet<_>>();
                let removed = live
                    .members
                    .difference(&set.members)
                    .cloned()
                    .collect::<BTreeSet<_>>();
                if added.is_empty() && removed.is_empty() {
                    return None;
                }
                Some(Op::UpdateSet {
                    id: id.clone(),
                    added,
                    removed,
                })
            }
            (_, Some(set)) => Some(Op::ReplaceSet {
                id: id.clone(),
                set: set.clone(),
            }),
        }
    }

    fn plan_chain(&self, name: &str, desired: Option<&Chain>) -> Option<Op> {
        match (self.chains.get(name), desired) {
            (None, None) => None,
            (Some(_), None) => Some(Op::DeleteChain {
                name: name.to_string(),
            }),
            (Some(fp), Some(chain)) if *fp == chain.fingerprint() => None,
            (_, Some(chain)) => Some(Op::ReplaceChain {
                name: name.to_string(),
                chain: chain.clone(),
            }),
        }
    }

    fn plan_route(&self, dst: &IpNet, desired: Option<&Route>) -> Option<Op> {
        match (self.routes.get(dst), desired) {
            (None, None) => None,
            (Some(_), None) => Some(Op::DeleteRoute(*dst)),
            (Some(live), Some(route)) if live == route => None,
            (_, Some(route)) => Some(Op::ReplaceRoute(route.clone())),
        }
    }

    /// Records that an operation was applied.
    pub fn committed(&mut self, op: &Op) {
        match op {
            Op::ReplaceSet { id, set } => {
                self.ip_sets.insert(id.clone(), set.clone());
            }
            Op::UpdateSet { id, added, removed } => {
                if let Some(set) = self.ip_sets.get_mut(id) {
                    for m in removed {
                        set.members.remove(m);
                    }
                    set.members.extend(added.iter().cloned());
                }
            }
            Op::DeleteSet { id } => {
                self.ip_sets.remove(id);
            }
            Op::ReplaceChain { name, chain } => {
                self.chains.insert(name.clone(), chain.fingerprint());
            }
            Op::DeleteChain { name } => {
                self.chains.remove(name);
            }
            Op::ReplaceRoute(route) => {
                self.routes.insert(route.dst, route.clone());
            }
            Op::DeleteRoute(dst) => {
                self.routes.remove(dst);
            }
        }
        let key = op.key();
        if self.exists(&key) {
            self.states.insert(key, ResourceState::InSync);
        } else {
            self.states.remove(&key);
        }
    }

    /// Records that an operation was not applied, so the resource is retried.
    pub fn failed(&mut self, op: &Op) {
        self.states.insert(op.key(), ResourceState::Dirty);
    }

    /// Replaces the model with the observed state of the live system, returning the resources
    /// whose observed state differs from what the model held.
    pub fn observe(&mut self, observed: Observed) -> Vec<ResourceKey> {
        let mut drifted = Vec::new();
        let mut diff = |key: ResourceKey, same: bool| {
            if !same {
                drifted.push(key);
            }
        };
        for id in union(self.ip_sets.keys(), observed.ip_sets.keys()) {
            diff(
                ResourceKey::IpSet(id.clone()),
                self.ip_sets.get(id) == observed.ip_sets.get(id),
            );
        }
        for name in union(self.chains.keys(), observed.chains.keys()) {
            diff(
                ResourceKey::Chain(name.clone()),
                self.chains.get(name) == observed.chains.get(name),
            );
        }
        for dst in union(self.routes.keys(), observed.routes.keys()) {
            diff(
                ResourceKey::Route(*dst),
                self.routes.get(dst) == observed.routes.get(dst),
            );
        }

        self.ip_sets = observed.ip_sets;
        self.chains = observed.chains;
        self.routes = observed.routes;
        drifted
    }

    /// Whether no resource is waiting to be applied.
    pub fn is_clean(&self) -> bool {
        self.states.values().all(|s| *s == ResourceState::InSync)
    }

    pub fn state(&self, key: &ResourceKey) -> Option<ResourceState> {
        self.states.get(key).copied()
    }

    /// The aggregate state of a resource class. Degradation is tracked by the reconciler.
    pub fn class_health(&self, class: ResourceClass) -> ClassHealth {
        let dirty = self
            .states
            .iter()
            .any(|(key, state)| key.class() == class && *state != ResourceState::InSync);
        if dirty {
            ClassHealth::Dirty
        } else {
            ClassHealth::InSync
        }
    }

    fn exists(&self, key: &ResourceKey) -> bool {
        match key {
            ResourceKey::IpSet(id) => self.ip_sets.contains_key(id),
            ResourceKey::Chain(name) => self.chains.contains_key(name),
            ResourceKey::Route(dst) => self.routes.contains_key(dst),
        }
    }

    fn keys(&self) -> impl Iterator<Item = ResourceKey> + '_ {
        let sets = self.ip_sets.keys().cloned().map(ResourceKey::IpSet);
        let chains = self.chains.keys().cloned().map(ResourceKey::Chain);
        let routes = self.routes.keys().copied().map(ResourceKey::Route);
        sets.chain(chains).chain(routes)
    }
}

fn union<'a, K: Ord + 'a>(
    a: impl Iterator<Item = &'a K>,
    b: impl Iterator<Item = &'a K>,
) -> BTreeSet<&'a K> {
    a.chain(b).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChainAction, ChainRule};
    use maplit::{btreemap, btreeset};
    use policy_agent_core::SetKind;

    fn net(s: &str) -> Member {
        Member::Net(s.parse().unwrap())
    }

    fn drop_chain() -> Chain {
        Chain::new(vec![ChainRule::always(ChainAction::Drop)])
    }

    #[test]
    fn ops_are_ordered_by_reference() {
        let id = SetId::from("s:a");
        let route = Route {
            dst: "10.0.0.1/32".parse().unwrap(),
            interface: "cali-a".to_string(),
        };
        let mut ops = vec![
            Op::DeleteSet { id: id.clone() },
            Op::DeleteChain {
                name: "pa-pi-0".to_string(),
            },
            Op::DeleteChain {
                name: "pa-tw-a".to_string(),
            },
            Op::ReplaceRoute(route.clone()),
            Op::ReplaceChain {
                name: "pa-to-wl-dispatch".to_string(),
                chain: drop_chain(),
            },
            Op::ReplaceChain {
                name: "pa-fw-b".to_string(),
                chain: drop_chain(),
            },
            Op::ReplaceChain {
                name: "pa-po-1".to_string(),
                chain: drop_chain(),
            },
            Op::UpdateSet {
                id: SetId::from("s:b"),
                added: btreeset![net("10.0.0.1/32")],
                removed: btreeset![],
            },
            Op::DeleteRoute("10.0.0.2/32".parse().unwrap()),
        ];
        order(&mut ops);
        assert_eq!(
            ops.iter().map(Op::as_str).collect::<Vec<_>>(),
            vec![
                "update_set",
                "replace_chain",
                "replace_chain",
                "replace_chain",
                "replace_route",
                "delete_route",
                "delete_chain",
                "delete_chain",
                "delete_set",
            ]
        );
        assert_eq!(ops[1].key(), ResourceKey::Chain("pa-po-1".to_string()));
        assert_eq!(ops[3].key(), ResourceKey::Chain("pa-to-wl-dispatch".to_string()));
        assert_eq!(ops[6].key(), ResourceKey::Chain("pa-tw-a".to_string()));
        assert_eq!(ops[7].key(), ResourceKey::Chain("pa-pi-0".to_string()));
    }

    #[test]
    fn sets_are_updated_incrementally() {
        let id = SetId::from("s:a");
        let mut desired = Desired {
            ip_sets: btreemap! {
                id.clone() => IpSet {
                    kind: SetKind::Net,
                    members: btreeset![net("10.0.0.1/32"), net("10.0.0.2/32")],
                },
            },
            ..Default::default()
        };
        let mut model = Model::default();
        model.mark_all_dirty(&desired);
        let ops = model.plan(&desired);
        assert!(matches!(&ops[..], [Op::ReplaceSet { .. }]));
        assert_eq!(
            model.state(&ResourceKey::IpSet(id.clone())),
            Some(ResourceState::Applying)
        );
        model.committed(&ops[0]);
        assert!(model.is_clean());

        desired.ip_sets.get_mut(&id).unwrap().members = btreeset![net("10.0.0.2/32"), net("10.0.0.3/32")];
        model.mark_dirty([ResourceKey::IpSet(id.clone())]);
        assert_eq!(
            model.plan(&desired),
            vec![Op::UpdateSet {
                id,
                added: btreeset![net("10.0.0.3/32")],
                removed: btreeset![net("10.0.0.1/32")],
            }]
        );
    }

    #[test]
    fn unchanged_resources_need_no_ops() {
        let desired = Desired {
            chains: btreemap! { "pa-tw-a".to_string() => drop_chain() },
            ..Default::default()
        };
        let mut model = Model::default();
        model.mark_all_dirty(&desired);
        for op in model.plan(&desired) {
            model.committed(&op);
        }
        model.mark_all_dirty(&desired);
        assert!(model.plan(&desired).is_empty());
        assert!(model.is_clean());
        assert_eq!(model.class_health(ResourceClass::Chains), ClassHealth::InSync);
        assert_eq!(model.class_health(ResourceClass::Routes), ClassHealth::InSync);
    }

    #[test]
    fn observation_replaces_beliefs() {
        let desired = Desired {
            chains: btreemap! { "pa-tw-a".to_string() => drop_chain() },
            ..Default::default()
        };
        let mut model = Model::default();
        model.mark_all_dirty(&desired);
        for op in model.plan(&desired) {
            model.committed(&op);
        }

        // The chain was deleted and an unknown chain appeared.
        let drifted = model.observe(Observed {
            chains: btreemap! { "pa-pi-stale".to_string() => "0000".to_string() },
            ..Default::default()
        });
        assert_eq!(drifted.len(), 2);
        model.mark_all_dirty(&desired);
        let ops = model.plan(&desired);
        assert_eq!(
            ops,
            vec![
                Op::ReplaceChain {
                    name: "pa-tw-a".to_string(),
                    chain: drop_chain(),
                },
                Op::DeleteChain {
                    name: "pa-pi-stale".to_string(),
                },
            ]
        );
        model.failed(&ops[1]);
        assert_eq!(model.class_health(ResourceClass::Chains), ClassHealth::Dirty);
    }
}
