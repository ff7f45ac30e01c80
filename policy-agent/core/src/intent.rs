//! The dataplane intent: everything the local node must enforce.

use crate::{
    endpoint::EndpointId,
    ip_set::{Member, SetId, SetKind},
    policy::{PolicyId, PolicyRules, TierAction},
};
use ipnet::IpNet;
use std::collections::{BTreeMap, BTreeSet};

/// The complete desired state of the local dataplane.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Intent {
    /// Incremented for every update emitted by the calculation graph.
    pub version: u64,

    pub ip_sets: BTreeMap<SetId, IpSet>,

    /// Rules of every active policy, i.e. every policy that applies to at least one local
    /// endpoint.
    pub policies: BTreeMap<PolicyId, PolicyRules>,

    /// Rules of every profile referenced by at least one local endpoint.
    pub profiles: BTreeMap<String, PolicyRules>,

    /// The ordered chain of every local endpoint.
    pub endpoints: BTreeMap<EndpointId, EndpointIntent>,

    /// Routes to local workloads.
    pub routes: BTreeMap<IpNet, Route>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpSet {
    pub kind: SetKind,
    pub members: BTreeSet<Member>,
}

/// The policies and profiles an endpoint's traffic traverses, in evaluation order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointIntent {
    pub interface: String,
    pub ingress: DirectionChain,
    pub egress: DirectionChain,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectionChain {
    pub tiers: Vec<TierChain>,
    pub profiles: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TierChain {
    pub name: String,
    pub default_action: TierAction,
    pub policies: Vec<PolicyId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub dst: IpNet,
    pub interface: String,
}

/// A change to an address set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetUpdate {
    /// The set was created (or its contents must be replaced wholesale).
    Replace(IpSet),

    Members {
        added: BTreeSet<Member>,
        removed: BTreeSet<Member>,
    },

    Removed,
}

/// An incremental update to the intent.
///
/// Map entries set to `None` are removed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IntentDelta {
    pub version: u64,
    pub ip_sets: BTreeMap<SetId, SetUpdate>,
    pub policies: BTreeMap<PolicyId, Option<PolicyRules>>,
    pub profiles: BTreeMap<String, Option<PolicyRules>>,
    pub endpoints: BTreeMap<EndpointId, Option<EndpointIntent>>,
    pub routes: BTreeMap<IpNet, Option<Route>>,
}

/// Sent from the calculation graph to the reconciler.
#[derive(Clone, Debug, PartialEq)]
pub enum IntentUpdate {
    Delta(IntentDelta),

    /// A full re-emission of the intent, replacing any previous state.
    Snapshot(Intent),
}

// === impl Intent ===

impl Intent {
    /// Applies a delta in place.
    pub fn apply(&mut self, delta: &IntentDelta) {
        for (id, update) in &delta.ip_sets {
            match update {
                SetUpdate::Replace(set) => {
                    self.ip_sets.insert(id.clone(), set.clone());
                }
                SetUpdate::Members { added, removed } => {
                    if let Some(set) = self.ip_sets.get_mut(id) {
                        for m in removed {
                            set.members.remove(m);
                        }
                        set.members.extend(added.iter().cloned());
                    }
                }
                SetUpdate::Removed => {
                    self.ip_sets.remove(id);
                }
            }
        }
        apply_map(&mut self.policies, &delta.policies);
        apply_map(&mut self.profiles, &delta.profiles);
        apply_map(&mut self.endpoints, &delta.endpoints);
        apply_map(&mut self.routes, &delta.routes);
        self.version = delta.version;
    }
}

fn apply_map<K: Ord + Clone, V: Clone>(map: &mut BTreeMap<K, V>, updates: &BTreeMap<K, Option<V>>) {
    for (k, v) in updates {
        match v {
            Some(v) => {
                map.insert(k.clone(), v.clone());
            }
            None => {
                map.remove(k);
            }
        }
    }
}

// === impl IntentDelta ===

impl IntentDelta {
    pub fn is_empty(&self) -> bool {
        self.ip_sets.is_empty()
            && self.policies.is_empty()
            && self.profiles.is_empty()
            && self.endpoints.is_empty()
            && self.routes.is_empty()
    }
}

// === impl IntentUpdate ===

impl IntentUpdate {
    pub fn version(&self) -> u64 {
        match self {
            Self::Delta(d) => d.version,
            Self::Snapshot(i) => i.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ip_set::SetDefinition, policy::Protocol};
    use maplit::{btreemap, btreeset};

    fn net(s: &str) -> Member {
        Member::Net(s.parse().unwrap())
    }

    #[test]
    fn apply_delta() {
        let id = SetDefinition::Selector("all()".to_string()).id();
        let ep = EndpointId::workload("ns", "a");
        let mut intent = Intent {
            ip_sets: btreemap! {
                id.clone() => IpSet {
                    kind: SetKind::Net,
                    members: btreeset![net("10.0.0.1/32"), net("10.0.0.2/32")],
                },
            },
            ..Default::default()
        };

        intent.apply(&IntentDelta {
            version: 2,
            ip_sets: btreemap! {
                id.clone() => SetUpdate::Members {
                    added: btreeset![net("10.0.0.3/32")],
                    removed: btreeset![net("10.0.0.1/32")],
                },
            },
            endpoints: btreemap! {
                ep.clone() => Some(EndpointIntent {
                    interface: "veth0".to_string(),
                    ingress: DirectionChain::default(),
                    egress: DirectionChain::default(),
                }),
            },
            ..Default::default()
        });
        assert_eq!(intent.version, 2);
        assert_eq!(
            intent.ip_sets[&id].members,
            btreeset![net("10.0.0.2/32"), net("10.0.0.3/32")]
        );
        assert!(intent.endpoints.contains_key(&ep));

        intent.apply(&IntentDelta {
            version: 3,
            ip_sets: btreemap! { id.clone() => SetUpdate::Removed },
            endpoints: btreemap! { ep.clone() => None },
            ..Default::default()
        });
        assert!(intent.ip_sets.is_empty());
        assert!(intent.endpoints.is_empty());
    }

    #[test]
    fn replace_set() {
        let id = SetDefinition::NamedPort {
            protocol: Protocol::Tcp,
            name: "http".to_string(),
            selector: "all()".to_string(),
        }
        .id();
        let member = Member::NamedPort {
            addr: "10.0.0.1".parse().unwrap(),
            protocol: Protocol::Tcp,
            port: 80,
        };
        let mut intent = Intent::default();
        intent.apply(&IntentDelta {
            version: 1,
            ip_sets: btreemap! {
                id.clone() => SetUpdate::Replace(IpSet {
                    kind: SetKind::NamedPort,
                    members: btreeset![member.clone()],
                }),
            },
            ..Default::default()
        });
        assert_eq!(intent.ip_sets[&id].members, btreeset![member]);
        assert!(IntentDelta::default().is_empty());
    }
}
