//! Renders an [`Intent`] into the live resources that enforce it.

use crate::model::{
    Chain, ChainAction, ChainRule, Match, ResourceKey, Side, ACCEPT_MARK, CHAIN_PREFIX, PASS_MARK,
};
use ipnet::IpNet;
use policy_agent_core::{
    Direction, DirectionChain, EndpointId, EndpointIntent, EndpointKind, EntityMatch, Intent,
    IntentDelta, IpSet, ParsedRule, PolicyId, PolicyRules, PortRange, Protocol, Route, RuleAction,
    SetId, SetKind, TierAction,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

pub const FORWARD_CHAIN: &str = "pa-FORWARD";
pub const INPUT_CHAIN: &str = "pa-INPUT";
pub const OUTPUT_CHAIN: &str = "pa-OUTPUT";

const FROM_WORKLOAD_DISPATCH: &str = "pa-from-wl-dispatch";
const TO_WORKLOAD_DISPATCH: &str = "pa-to-wl-dispatch";
const FROM_HOST_DISPATCH: &str = "pa-from-host-dispatch";
const TO_HOST_DISPATCH: &str = "pa-to-host-dispatch";

/// The most ports a single match may list; a range counts as two.
const MAX_PORTS_PER_MATCH: usize = 15;

#[derive(Clone, Debug)]
pub struct RenderConfig {
    /// The interface name prefix shared by every workload interface.
    pub interface_prefix: String,
}

/// The live resources the current intent calls for.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Desired {
    pub ip_sets: BTreeMap<SetId, IpSet>,
    pub chains: BTreeMap<String, Chain>,
    pub routes: BTreeMap<IpNet, Route>,

    /// The interface of each rendered endpoint.
    pub(crate) interfaces: BTreeMap<EndpointId, (EndpointKind, String)>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            interface_prefix: "cali".to_string(),
        }
    }
}

// === impl Desired ===

impl Desired {
    pub fn render(intent: &Intent, config: &RenderConfig) -> Self {
        let mut desired = Self {
            ip_sets: intent.ip_sets.clone(),
            routes: intent.routes.clone(),
            ..Default::default()
        };
        for (id, rules) in &intent.policies {
            desired.insert_rule_chains(&policy_chains(id), rules);
        }
        for (name, rules) in &intent.profiles {
            desired.insert_rule_chains(&profile_chains(name), rules);
        }
        for (id, ep) in &intent.endpoints {
            desired.insert_endpoint(id, ep);
        }
        desired.render_dispatch();
        for (name, chain) in root_chains(config) {
            desired.chains.insert(name, chain);
        }
        desired
    }

    /// Updates the desired resources after `delta` has been applied to `intent`, returning the key
    /// of every resource that may have changed.
    pub fn update(&mut self, intent: &Intent, delta: &IntentDelta) -> BTreeSet<ResourceKey> {
        let mut touched = BTreeSet::new();

        for id in delta.ip_sets.keys() {
            match intent.ip_sets.get(id) {
                Some(set) => self.ip_sets.insert(id.clone(), set.clone()),
                None => self.ip_sets.remove(id),
            };
            touched.insert(ResourceKey::IpSet(id.clone()));
        }

        for id in delta.policies.keys() {
            let names = policy_chains(id);
            self.update_rule_chains(&names, intent.policies.get(id), &mut touched);
        }
        for name in delta.profiles.keys() {
            let names = profile_chains(name);
            self.update_rule_chains(&names, intent.profiles.get(name), &mut touched);
        }

        if !delta.endpoints.is_empty() {
            for id in delta.endpoints.keys() {
                if let Some((kind, iface)) = self.interfaces.remove(id) {
                    // Another endpoint may claim the same interface.
                    let shared = self
                        .interfaces
                        .values()
                        .any(|(k, i)| *k == kind && *i == iface);
                    for name in endpoint_chains(kind, &iface) {
                        if !shared {
                            self.chains.remove(&name);
                        }
                        touched.insert(ResourceKey::Chain(name));
                    }
                }
                if let Some(ep) = intent.endpoints.get(id) {
                    for name in self.insert_endpoint(id, ep) {
                        touched.insert(ResourceKey::Chain(name));
                    }
                }
            }
            self.render_dispatch();
            for name in [
                FROM_WORKLOAD_DISPATCH,
                TO_WORKLOAD_DISPATCH,
                FROM_HOST_DISPATCH,
                TO_HOST_DISPATCH,
            ] {
                touched.insert(ResourceKey::Chain(name.to_string()));
            }
        }

        for dst in delta.routes.keys() {
            match intent.routes.get(dst) {
                Some(route) => self.routes.insert(*dst, route.clone()),
                None => self.routes.remove(dst),
            };
            touched.insert(ResourceKey::Route(*dst));
        }

        touched
    }

    /// Every resource key the intent calls for.
    pub fn keys(&self) -> impl Iterator<Item = ResourceKey> + '_ {
        let sets = self.ip_sets.keys().cloned().map(ResourceKey::IpSet);
        let chains = self.chains.keys().cloned().map(ResourceKey::Chain);
        let routes = self.routes.keys().copied().map(ResourceKey::Route);
        sets.chain(chains).chain(routes)
    }

    fn insert_rule_chains(&mut self, names: &[String; 2], rules: &PolicyRules) {
        for (name, direction) in names.iter().zip(Direction::ALL) {
            let chain = rule_chain(name, rules.rules(direction));
            self.chains.insert(name.clone(), chain);
        }
    }

    fn update_rule_chains(
        &mut self,
        names: &[String; 2],
        rules: Option<&PolicyRules>,
        touched: &mut BTreeSet<ResourceKey>,
    ) {
        match rules {
            Some(rules) => self.insert_rule_chains(names, rules),
            None => {
                for name in names {
                    self.chains.remove(name);
                }
            }
        }
        touched.extend(names.iter().cloned().map(ResourceKey::Chain));
    }

    fn insert_endpoint(&mut self, id: &EndpointId, ep: &EndpointIntent) -> [String; 2] {
        let names = endpoint_chains(id.kind, &ep.interface);
        let [ingress, egress] = &names;
        self.chains
            .insert(ingress.clone(), endpoint_chain(Direction::Ingress, &ep.ingress));
        self.chains
            .insert(egress.clone(), endpoint_chain(Direction::Egress, &ep.egress));
        self.interfaces
            .insert(id.clone(), (id.kind, ep.interface.clone()));
        names
    }

    fn render_dispatch(&mut self) {
        let mut from_wl = Vec::new();
        let mut to_wl = Vec::new();
        let mut from_host = Vec::new();
        let mut to_host = Vec::new();

        let interfaces = self
            .interfaces
            .values()
            .cloned()
            .collect::<BTreeSet<_>>();
        for (kind, iface) in interfaces {
            let [ingress, egress] = endpoint_chains(kind, &iface);
            match kind {
                EndpointKind::Workload => {
                    from_wl.push(ChainRule::new(
                        vec![Match::InInterface(iface.clone())],
                        ChainAction::Goto(egress),
                    ));
                    to_wl.push(ChainRule::new(
                        vec![Match::OutInterface(iface)],
                        ChainAction::Goto(ingress),
                    ));
                }
                EndpointKind::Host => {
                    to_host.push(ChainRule::new(
                        vec![Match::InInterface(iface.clone())],
                        ChainAction::Goto(ingress),
                    ));
                    from_host.push(ChainRule::new(
                        vec![Match::OutInterface(iface)],
                        ChainAction::Goto(egress),
                    ));
                }
            }
        }

        // Traffic on a workload interface without an endpoint is dropped. Traffic on other host
        // interfaces is not subject to policy.
        from_wl.push(ChainRule::always(ChainAction::Drop));
        to_wl.push(ChainRule::always(ChainAction::Drop));
        from_host.push(ChainRule::always(ChainAction::Return));
        to_host.push(ChainRule::always(ChainAction::Return));

        for (name, rules) in [
            (FROM_WORKLOAD_DISPATCH, from_wl),
            (TO_WORKLOAD_DISPATCH, to_wl),
            (FROM_HOST_DISPATCH, from_host),
            (TO_HOST_DISPATCH, to_host),
        ] {
            self.chains.insert(name.to_string(), Chain::new(rules));
        }
    }
}

/// The ingress and egress chains of a policy.
pub fn policy_chains(id: &PolicyId) -> [String; 2] {
    let hash = short_hash(&id.to_string());
    [
        format!("{CHAIN_PREFIX}pi-{hash}"),
        format!("{CHAIN_PREFIX}po-{hash}"),
    ]
}

/// The ingress and egress chains of a profile.
pub fn profile_chains(name: &str) -> [String; 2] {
    let hash = short_hash(name);
    [
        format!("{CHAIN_PREFIX}pri-{hash}"),
        format!("{CHAIN_PREFIX}pro-{hash}"),
    ]
}

/// The ingress and egress chains of the endpoint on an interface.
///
/// A workload's ingress is traffic sent to it; a host's ingress is traffic arriving on its
/// interface.
pub fn endpoint_chains(kind: EndpointKind, iface: &str) -> [String; 2] {
    match kind {
        EndpointKind::Workload => [
            format!("{CHAIN_PREFIX}tw-{iface}"),
            format!("{CHAIN_PREFIX}fw-{iface}"),
        ],
        EndpointKind::Host => [
            format!("{CHAIN_PREFIX}th-{iface}"),
            format!("{CHAIN_PREFIX}fh-{iface}"),
        ],
    }
}

fn short_hash(s: &str) -> String {
    Sha256::digest(s.as_bytes())[..8]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// The chains hooked into the kernel's filter table.
fn root_chains(config: &RenderConfig) -> Vec<(String, Chain)> {
    let workloads = format!("{}+", config.interface_prefix);
    let clear = ChainRule::always(ChainAction::ClearMark(ACCEPT_MARK | PASS_MARK));
    let accept = ChainRule::new(vec![Match::MarkAll(ACCEPT_MARK)], ChainAction::Accept);
    let jump = |m: Option<Match>, target: &str| {
        ChainRule::new(m.into_iter().collect(), ChainAction::Jump(target.to_string()))
    };

    vec![
        (
            FORWARD_CHAIN.to_string(),
            Chain::new(vec![
                clear.clone(),
                jump(
                    Some(Match::InInterface(workloads.clone())),
                    FROM_WORKLOAD_DISPATCH,
                ),
                jump(
                    Some(Match::OutInterface(workloads.clone())),
                    TO_WORKLOAD_DISPATCH,
                ),
                accept.clone(),
            ]),
        ),
        (
            INPUT_CHAIN.to_string(),
            Chain::new(vec![
                clear.clone(),
                jump(
                    Some(Match::InInterface(workloads.clone())),
                    FROM_WORKLOAD_DISPATCH,
                ),
                accept.clone(),
                jump(None, TO_HOST_DISPATCH),
                accept.clone(),
            ]),
        ),
        (
            OUTPUT_CHAIN.to_string(),
            Chain::new(vec![
                clear,
                jump(Some(Match::OutInterface(workloads)), TO_WORKLOAD_DISPATCH),
                accept.clone(),
                jump(None, FROM_HOST_DISPATCH),
                accept,
            ]),
        ),
    ]
}

/// Renders an endpoint's chain for one direction.
///
/// Each tier's policies are evaluated in order until one allows the packet (the chain returns
/// with the accept mark set), denies it, or passes it to the next tier. A packet that no policy
/// in a tier matches is dropped, unless the tier's default action is pass. Profiles apply to
/// packets that every tier passed, and the chain drops whatever is left.
fn endpoint_chain(direction: Direction, chain: &DirectionChain) -> Chain {
    let mut rules = vec![ChainRule::always(ChainAction::ClearMark(
        ACCEPT_MARK | PASS_MARK,
    ))];

    for tier in &chain.tiers {
        rules.push(ChainRule::always(ChainAction::ClearMark(PASS_MARK)));
        for policy in &tier.policies {
            let [ingress, egress] = policy_chains(policy);
            let target = match direction {
                Direction::Ingress => ingress,
                Direction::Egress => egress,
            };
            rules.push(ChainRule::new(
                vec![Match::MarkClear(PASS_MARK)],
                ChainAction::Jump(target),
            ));
            rules.push(ChainRule::new(
                vec![Match::MarkAll(ACCEPT_MARK)],
                ChainAction::Return,
            ));
        }
        if tier.default_action == TierAction::Deny {
            rules.push(ChainRule::new(
                vec![Match::MarkClear(PASS_MARK)],
                ChainAction::Drop,
            ));
        }
    }

    for profile in &chain.profiles {
        let [ingress, egress] = profile_chains(profile);
        let target = match direction {
            Direction::Ingress => ingress,
            Direction::Egress => egress,
        };
        rules.push(ChainRule::always(ChainAction::Jump(target)));
        rules.push(ChainRule::new(
            vec![Match::MarkAll(ACCEPT_MARK)],
            ChainAction::Return,
        ));
    }

    rules.push(ChainRule::always(ChainAction::Drop));
    Chain::new(rules)
}

/// Renders the chain of a policy or profile for one direction.
fn rule_chain(name: &str, rules: &[ParsedRule]) -> Chain {
    let mut out = Vec::new();
    for rule in rules {
        let (action, then) = match rule.action {
            RuleAction::Allow => (
                ChainAction::SetMark(ACCEPT_MARK),
                Some(ChainRule::new(
                    vec![Match::MarkAll(ACCEPT_MARK)],
                    ChainAction::Return,
                )),
            ),
            RuleAction::Pass => (
                ChainAction::SetMark(PASS_MARK),
                Some(ChainRule::new(
                    vec![Match::MarkAll(PASS_MARK)],
                    ChainAction::Return,
                )),
            ),
            RuleAction::Deny => (ChainAction::Drop, None),
            RuleAction::Log => (ChainAction::Log(format!("{name} ")), None),
        };
        for matches in rule_matches(rule) {
            out.push(ChainRule::new(matches, action.clone()));
        }
        out.extend(then);
    }
    Chain::new(out)
}

/// Expands a rule into the match lists of the chain rules that implement it.
///
/// Port alternatives cannot be expressed in a single rule, so a rule that lists both numeric
/// ports and named ports yields one chain rule per alternative.
fn rule_matches(rule: &ParsedRule) -> Vec<Vec<Match>> {
    let mut base = Vec::new();
    if let Some(protocol) = rule.protocol {
        base.push(Match::Protocol(protocol));
    }
    base.extend(entity_matches(Side::Src, &rule.src));
    base.extend(entity_matches(Side::Dst, &rule.dst));

    let src = port_alternatives(Side::Src, &rule.src);
    let dst = port_alternatives(Side::Dst, &rule.dst);
    let mut out = Vec::with_capacity(src.len() * dst.len());
    for s in &src {
        for d in &dst {
            let mut matches = base.clone();
            matches.extend(s.iter().cloned());
            matches.extend(d.iter().cloned());
            out.push(matches);
        }
    }
    out
}

/// The matches every packet must satisfy on one side.
fn entity_matches(side: Side, entity: &EntityMatch) -> Vec<Match> {
    let set = |kind, negated| {
        move |id: &SetId| Match::Set {
            id: id.clone(),
            kind,
            side,
            negated,
        }
    };
    let mut matches = Vec::new();
    matches.extend(entity.sets.iter().map(set(SetKind::Net, false)));
    matches.extend(entity.not_sets.iter().map(set(SetKind::Net, true)));
    matches.extend(port_chunks(&entity.not_ports).map(|ports| Match::Ports {
        side,
        ports,
        negated: true,
    }));
    matches.extend(
        entity
            .not_named_port_sets
            .iter()
            .map(set(SetKind::NamedPort, true)),
    );
    matches
}

/// The alternative port matches on one side, of which a packet must satisfy one.
fn port_alternatives(side: Side, entity: &EntityMatch) -> Vec<Vec<Match>> {
    if entity.ports.is_empty() && entity.named_port_sets.is_empty() {
        return vec![vec![]];
    }
    let ports = port_chunks(&entity.ports).map(|ports| {
        vec![Match::Ports {
            side,
            ports,
            negated: false,
        }]
    });
    let named = entity.named_port_sets.iter().map(|id| {
        vec![Match::Set {
            id: id.clone(),
            kind: SetKind::NamedPort,
            side,
            negated: false,
        }]
    });
    ports.chain(named).collect()
}

fn port_chunks(ports: &[PortRange]) -> impl Iterator<Item = Vec<PortRange>> {
    let mut chunks = Vec::new();
    let mut chunk = Vec::new();
    let mut weight = 0;
    for port in ports {
        let w = if port.first == port.last { 1 } else { 2 };
        if weight + w > MAX_PORTS_PER_MATCH {
            chunks.push(std::mem::take(&mut chunk));
            weight = 0;
        }
        chunk.push(*port);
        weight += w;
    }
    if !chunk.is_empty() {
        chunks.push(chunk);
    }
    chunks.into_iter()
}

/// Whether a rule with this protocol applies to traffic of the given IP family.
pub fn protocol_in_family(protocol: Protocol, ipv4: bool) -> bool {
    match protocol {
        Protocol::Icmp => ipv4,
        Protocol::Icmpv6 => !ipv4,
        _ => true,
    }
}
