use crate::{rules, CalcGraph};
use policy_agent_core::{SetDefinition, SetId};
use policy_agent_k8s_api::{
    endpoint::WorkloadEndpointSpec,
    labels::Map,
    policy::{
        GlobalNetworkPolicySpec, NetworkPolicySpec, PolicyBody, ProfileSpec, Rule, TierSpec,
    },
    EventType, FeedEvent, Kind, Payload, ResourceEvent, ResourceName, Selector,
};

mod coordinator;

pub const NODE: &str = "node-a";

pub fn labels(pairs: &[(&str, &str)]) -> Map {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn added(kind: Kind, name: ResourceName, payload: Payload) -> FeedEvent {
    FeedEvent::Resource(ResourceEvent::applied(
        kind,
        name,
        EventType::Added,
        payload,
    ))
}

pub fn deleted(kind: Kind, name: ResourceName) -> FeedEvent {
    FeedEvent::Resource(ResourceEvent::deleted(kind, name))
}

/// A workload on the local node with a single address.
pub fn workload(ns: &str, name: &str, pairs: &[(&str, &str)], addr: &str) -> FeedEvent {
    workload_on(NODE, ns, name, pairs, addr)
}

pub fn workload_on(
    node: &str,
    ns: &str,
    name: &str,
    pairs: &[(&str, &str)],
    addr: &str,
) -> FeedEvent {
    added(
        Kind::WorkloadEndpoint,
        ResourceName::namespaced(ns, name),
        Payload::WorkloadEndpoint {
            labels: labels(pairs),
            spec: WorkloadEndpointSpec {
                node: node.to_string(),
                interface_name: Some(format!("veth-{name}")),
                ip_networks: vec![addr.to_string()],
                ..Default::default()
            },
        },
    )
}

pub fn policy(ns: &str, name: &str, policy: PolicyBody) -> FeedEvent {
    added(
        Kind::NetworkPolicy,
        ResourceName::namespaced(ns, name),
        Payload::NetworkPolicy(NetworkPolicySpec { policy }),
    )
}

pub fn global_policy(name: &str, policy: PolicyBody) -> FeedEvent {
    added(
        Kind::GlobalNetworkPolicy,
        ResourceName::cluster(name),
        Payload::GlobalNetworkPolicy(GlobalNetworkPolicySpec { policy }),
    )
}

pub fn tier(name: &str, order: f64) -> FeedEvent {
    added(
        Kind::Tier,
        ResourceName::cluster(name),
        Payload::Tier(TierSpec {
            order: Some(order),
            default_action: None,
        }),
    )
}

pub fn profile(name: &str, spec: ProfileSpec) -> FeedEvent {
    added(
        Kind::Profile,
        ResourceName::cluster(name),
        Payload::Profile(spec),
    )
}

/// A policy body in the default tier with the given selector and ingress rules.
pub fn ingress(selector: &str, order: f64, rules: Vec<Rule>) -> PolicyBody {
    PolicyBody {
        order: Some(order),
        selector: Some(selector.to_string()),
        ingress: Some(rules),
        ..Default::default()
    }
}

/// The id of the set of endpoints matching a rule selector in a policy in `ns`.
pub fn selector_set(ns: Option<&str>, selector: &str) -> SetId {
    let sel = rules::scope_selector(Selector::parse(selector).unwrap(), ns);
    SetDefinition::Selector(sel.canonical().to_string()).id()
}

/// A graph for which every kind has been listed.
pub fn synced_graph() -> CalcGraph {
    let mut graph = CalcGraph::new(NODE);
    for kind in Kind::ALL {
        graph.apply(FeedEvent::Synced(kind)).unwrap();
    }
    assert!(graph.is_synced());
    assert!(graph.take_snapshot_due());
    graph
}
