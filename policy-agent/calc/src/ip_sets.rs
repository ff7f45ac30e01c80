//! Address-set membership.
//!
//! Sets are reference counted: each active policy or profile holds one reference per set its rules
//! refer to. A set is created on its first reference and torn down on its last.
//!
//! Selector-based sets are populated from selector matches: each matching endpoint contributes its
//! addresses (or its addresses paired with the matching named port). A member may be contributed by
//! several endpoints and is only removed once the last of them stops contributing it.
//!
//! Changes are accumulated until the graph takes them, so that a member added and removed between
//! two batches is never reported.

use crate::rules::SetSource;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use ipnet::IpNet;
use policy_agent_core::{EndpointId, IpSet, Member, NamedPort, SetDefinition, SetId, SetUpdate};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub(crate) struct IpSetCalculator {
    sets: HashMap<SetId, SetState>,

    /// Sets that have been reported downstream and not yet reported as removed.
    emitted: HashSet<SetId>,

    pending: HashMap<SetId, Pending>,
}

/// The parts of an endpoint that contribute to set membership.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct EndpointMembers {
    pub nets: Vec<IpNet>,
    pub ports: Vec<NamedPort>,
}

#[derive(Debug)]
struct SetState {
    def: SetDefinition,
    refs: usize,
    contributions: HashMap<EndpointId, BTreeSet<Member>>,
    members: HashMap<Member, usize>,
}

#[derive(Debug, Default)]
struct Pending {
    /// The set must be reported in full.
    replace: bool,
    added: BTreeSet<Member>,
    removed: BTreeSet<Member>,
}

// === impl IpSetCalculator ===

impl IpSetCalculator {
    /// Adds a reference to a set, creating it if necessary.
    ///
    /// Returns true if the set was created, in which case the caller must index the set's selector
    /// (if any) and report the endpoints it matches.
    pub(crate) fn register(&mut self, id: &SetId, source: &SetSource) -> bool {
        if let Some(set) = self.sets.get_mut(id) {
            set.refs += 1;
            return false;
        }

        let mut set = SetState {
            def: source.def.clone(),
            refs: 1,
            contributions: HashMap::default(),
            members: HashMap::default(),
        };
        if let SetDefinition::Cidrs(nets) = &source.def {
            set.members = nets.iter().map(|n| (Member::Net(*n), 1)).collect();
        }
        self.sets.insert(id.clone(), set);
        self.pending.entry(id.clone()).or_default().replace = true;
        true
    }

    /// Drops a reference to a set.
    ///
    /// Returns true if this was the last reference, in which case the set is torn down and the
    /// caller must remove its selector from the index.
    pub(crate) fn unregister(&mut self, id: &SetId) -> bool {
        let Some(set) = self.sets.get_mut(id) else {
            return false;
        };
        set.refs -= 1;
        if set.refs > 0 {
            return false;
        }
        self.sets.remove(id);
        let pending = self.pending.entry(id.clone()).or_default();
        pending.added.clear();
        pending.removed.clear();
        true
    }

    /// Sets the members an endpoint contributes to a set. The endpoint must currently match the
    /// set's selector.
    pub(crate) fn set_contribution(
        &mut self,
        id: &SetId,
        endpoint: &EndpointId,
        members: &EndpointMembers,
    ) {
        let Some(set) = self.sets.get_mut(id) else {
            return;
        };
        let new = contribution(&set.def, members);
        let old = set.contributions.remove(endpoint).unwrap_or_default();
        if old == new {
            if !new.is_empty() {
                set.contributions.insert(endpoint.clone(), new);
            }
            return;
        }

        let pending = self.pending.entry(id.clone()).or_default();
        for m in old.difference(&new) {
            release(set, pending, m);
        }
        for m in new.difference(&old) {
            acquire(set, pending, m);
        }
        if !new.is_empty() {
            set.contributions.insert(endpoint.clone(), new);
        }
    }

    /// Removes everything an endpoint contributes to a set.
    pub(crate) fn clear_contribution(&mut self, id: &SetId, endpoint: &EndpointId) {
        let Some(set) = self.sets.get_mut(id) else {
            return;
        };
        let Some(old) = set.contributions.remove(endpoint) else {
            return;
        };
        let pending = self.pending.entry(id.clone()).or_default();
        for m in &old {
            release(set, pending, m);
        }
    }

    /// Takes the set changes accumulated since the last call.
    pub(crate) fn take_updates(&mut self) -> BTreeMap<SetId, SetUpdate> {
        let mut updates = BTreeMap::new();
        for (id, pending) in self.pending.drain() {
            match self.sets.get(&id) {
                Some(set) if pending.replace || !self.emitted.contains(&id) => {
                    self.emitted.insert(id.clone());
                    updates.insert(id, SetUpdate::Replace(ip_set(set)));
                }
                Some(_) => {
                    if !pending.added.is_empty() || !pending.removed.is_empty() {
                        updates.insert(
                            id,
                            SetUpdate::Members {
                                added: pending.added,
                                removed: pending.removed,
                            },
                        );
                    }
                }
                None => {
                    if self.emitted.remove(&id) {
                        updates.insert(id, SetUpdate::Removed);
                    }
                }
            }
        }
        updates
    }

    pub(crate) fn len(&self) -> usize {
        self.sets.len()
    }

    #[cfg(test)]
    pub(crate) fn members(&self, id: &SetId) -> Option<BTreeSet<Member>> {
        self.sets.get(id).map(|s| s.members.keys().cloned().collect())
    }
}

fn ip_set(set: &SetState) -> IpSet {
    IpSet {
        kind: set.def.kind(),
        members: set.members.keys().cloned().collect(),
    }
}

fn acquire(set: &mut SetState, pending: &mut Pending, m: &Member) {
    let count = set.members.entry(m.clone()).or_default();
    *count += 1;
    if *count == 1 && !pending.replace && !pending.removed.remove(m) {
        pending.added.insert(m.clone());
    }
}

fn release(set: &mut SetState, pending: &mut Pending, m: &Member) {
    let Some(count) = set.members.get_mut(m) else {
        return;
    };
    *count -= 1;
    if *count == 0 {
        set.members.remove(m);
        if !pending.replace && !pending.added.remove(m) {
            pending.removed.insert(m.clone());
        }
    }
}

/// The members an endpoint contributes to a set with the given definition.
fn contribution(def: &SetDefinition, ep: &EndpointMembers) -> BTreeSet<Member> {
    match def {
        SetDefinition::Selector(_) => ep.nets.iter().map(|n| Member::Net(*n)).collect(),
        SetDefinition::NamedPort { protocol, name, .. } => ep
            .ports
            .iter()
            .filter(|p| p.name == *name && p.protocol == *protocol)
            .flat_map(|p| {
                ep.nets.iter().map(move |n| Member::NamedPort {
                    addr: n.addr(),
                    protocol: p.protocol,
                    port: p.port,
                })
            })
            .collect(),
        SetDefinition::Cidrs(_) => BTreeSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreeset;
    use policy_agent_core::{Protocol, SetKind};
    use policy_agent_k8s_api::Selector;

    fn selector_set(s: &str) -> (SetId, SetSource) {
        let sel = Selector::parse(s).unwrap();
        let def = SetDefinition::Selector(sel.canonical().to_string());
        (
            def.id(),
            SetSource {
                def,
                selector: Some(sel),
            },
        )
    }

    fn members(nets: &[&str]) -> EndpointMembers {
        EndpointMembers {
            nets: nets.iter().map(|n| n.parse().unwrap()).collect(),
            ports: vec![],
        }
    }

    fn net(s: &str) -> Member {
        Member::Net(s.parse().unwrap())
    }

    #[test]
    fn new_sets_are_reported_in_full() {
        let mut calc = IpSetCalculator::default();
        let (id, source) = selector_set("role == 'web'");
        assert!(calc.register(&id, &source));
        assert!(!calc.register(&id, &source));

        let a = EndpointId::workload("ns", "a");
        calc.set_contribution(&id, &a, &members(&["10.0.0.1/32"]));
        assert_eq!(
            calc.take_updates(),
            btreemap_of(
                &id,
                SetUpdate::Replace(IpSet {
                    kind: SetKind::Net,
                    members: btreeset![net("10.0.0.1/32")],
                })
            )
        );
        assert!(calc.take_updates().is_empty());
    }

    #[test]
    fn shared_members_are_removed_with_last_contributor() {
        let mut calc = IpSetCalculator::default();
        let (id, source) = selector_set("all()");
        calc.register(&id, &source);
        calc.take_updates();

        let a = EndpointId::workload("ns", "a");
        let b = EndpointId::workload("ns", "b");
        calc.set_contribution(&id, &a, &members(&["10.0.0.1/32"]));
        calc.set_contribution(&id, &b, &members(&["10.0.0.1/32", "10.0.0.2/32"]));
        calc.take_updates();

        calc.clear_contribution(&id, &a);
        assert!(calc.take_updates().is_empty(), "b still contributes 10.0.0.1");

        calc.clear_contribution(&id, &b);
        assert_eq!(
            calc.take_updates(),
            btreemap_of(
                &id,
                SetUpdate::Members {
                    added: btreeset![],
                    removed: btreeset![net("10.0.0.1/32"), net("10.0.0.2/32")],
                }
            )
        );
    }

    #[test]
    fn add_then_remove_is_coalesced() {
        let mut calc = IpSetCalculator::default();
        let (id, source) = selector_set("all()");
        calc.register(&id, &source);
        calc.take_updates();

        let a = EndpointId::workload("ns", "a");
        calc.set_contribution(&id, &a, &members(&["10.0.0.1/32"]));
        calc.clear_contribution(&id, &a);
        assert!(calc.take_updates().is_empty());

        // A set created and torn down within a batch is never reported.
        let (other, source) = selector_set("role == 'db'");
        calc.register(&other, &source);
        assert!(calc.unregister(&other));
        assert!(calc.take_updates().is_empty());
    }

    #[test]
    fn teardown() {
        let mut calc = IpSetCalculator::default();
        let (id, source) = selector_set("all()");
        calc.register(&id, &source);
        calc.register(&id, &source);
        calc.take_updates();

        assert!(!calc.unregister(&id));
        assert!(calc.unregister(&id));
        assert_eq!(calc.take_updates(), btreemap_of(&id, SetUpdate::Removed));
        assert_eq!(calc.len(), 0);
    }

    #[test]
    fn cidr_and_named_port_sets() {
        let mut calc = IpSetCalculator::default();
        let def = SetDefinition::Cidrs(["10.0.0.0/8".parse().unwrap()].into_iter().collect());
        let cidrs = def.id();
        calc.register(
            &cidrs,
            &SetSource {
                def,
                selector: None,
            },
        );
        assert_eq!(calc.members(&cidrs), Some(btreeset![net("10.0.0.0/8")]));

        let def = SetDefinition::NamedPort {
            protocol: Protocol::Tcp,
            name: "http".to_string(),
            selector: "all()".to_string(),
        };
        let ports = def.id();
        calc.register(
            &ports,
            &SetSource {
                def,
                selector: Some(Selector::all()),
            },
        );
        let a = EndpointId::workload("ns", "a");
        calc.set_contribution(
            &ports,
            &a,
            &EndpointMembers {
                nets: vec!["10.0.0.1/32".parse().unwrap()],
                ports: vec![
                    NamedPort {
                        name: "http".to_string(),
                        protocol: Protocol::Tcp,
                        port: 8080,
                    },
                    NamedPort {
                        name: "http".to_string(),
                        protocol: Protocol::Udp,
                        port: 8081,
                    },
                ],
            },
        );
        assert_eq!(
            calc.members(&ports),
            Some(btreeset![Member::NamedPort {
                addr: "10.0.0.1".parse().unwrap(),
                protocol: Protocol::Tcp,
                port: 8080,
            }])
        );
    }

    fn btreemap_of(id: &SetId, update: SetUpdate) -> BTreeMap<SetId, SetUpdate> {
        Some((id.clone(), update)).into_iter().collect()
    }
}
