use crate::{
    model::{ChainAction, ChainKind},
    render, Backoff, Config, MemoryDataplane, Reconciler, ReconcilerMetrics,
};
use maplit::{btreemap, btreeset};
use policy_agent_core::{
    DirectionChain, EndpointId, EndpointIntent, EntityMatch, HealthReport, Intent, IntentDelta,
    IntentUpdate, IpSet, Member, ParsedRule, PolicyId, PolicyRules, Route, RuleAction,
    SetDefinition, SetId, SetKind, SetUpdate, TierAction, TierChain,
};
use tokio::{
    sync::{mpsc, watch},
    time::Duration,
};


pub fn trusted() -> SetId {
    SetDefinition::Selector("role == 'trusted'".to_string()).id()
}

pub fn net(s: &str) -> Member {
    Member::Net(s.parse().unwrap())
}

/// A policy that allows ingress from the trusted set.
pub fn allow_trusted() -> PolicyRules {
    PolicyRules {
        ingress: vec![ParsedRule {
            action: RuleAction::Allow,
            protocol: None,
            src: EntityMatch {
                sets: vec![trusted()],
                ..Default::default()
            },
            dst: EntityMatch::default(),
        }],
        egress: vec![],
    }
}

pub fn endpoint(iface: &str, policies: &[&str]) -> EndpointIntent {
    let tiers = if policies.is_empty() {
        vec![]
    } else {
        vec![TierChain {
            name: "default".to_string(),
            default_action: TierAction::Deny,
            policies: policies.iter().map(|p| PolicyId::global(*p)).collect(),
        }]
    };
    EndpointIntent {
        interface: iface.to_string(),
        ingress: DirectionChain {
            tiers,
            profiles: vec![],
        },
        egress: DirectionChain::default(),
    }
}

pub fn route(dst: &str, iface: &str) -> Route {
    Route {
        dst: dst.parse().unwrap(),
        interface: iface.to_string(),
    }
}

/// One workload protected by one policy.
pub fn initial_intent() -> Intent {
    Intent {
        version: 1,
        ip_sets: btreemap! {
            trusted() => IpSet {
                kind: SetKind::Net,
                members: btreeset![net("10.0.0.9/32")],
            },
        },
        policies: btreemap! { PolicyId::global("x") => allow_trusted() },
        profiles: btreemap! {},
        endpoints: btreemap! {
            EndpointId::workload("ns", "a") => endpoint("cali-a", &["x"]),
        },
        routes: btreemap! {
            "10.0.0.1/32".parse().unwrap() => route("10.0.0.1/32", "cali-a"),
        },
    }
}

/// Adds a second workload, protected by a new policy that refers to a new set.
pub fn add_workload_b(version: u64) -> IntentDelta {
    let web = SetDefinition::Selector("role == 'web'".to_string()).id();
    IntentDelta {
        version,
        ip_sets: btreemap! {
            web.clone() => SetUpdate::Replace(IpSet {
                kind: SetKind::Net,
                members: btreeset![net("10.0.0.2/32")],
            }),
        },
        policies: btreemap! {
            PolicyId::global("y") => Some(PolicyRules {
                ingress: vec![ParsedRule {
                    action: RuleAction::Deny,
                    protocol: None,
                    src: EntityMatch {
                        not_sets: vec![web],
                        ..Default::default()
                    },
                    dst: EntityMatch::default(),
                }],
                egress: vec![],
            }),
        },
        endpoints: btreemap! {
            EndpointId::workload("ns", "b") => Some(endpoint("cali-b", &["y", "x"])),
        },
        routes: btreemap! {
            "10.0.0.2/32".parse().unwrap() => Some(route("10.0.0.2/32", "cali-b")),
        },
        ..Default::default()
    }
}

pub struct Harness {
    pub dataplane: MemoryDataplane,
    pub updates: mpsc::Sender<IntentUpdate>,
    pub resyncs: mpsc::Receiver<()>,
    pub health: watch::Receiver<HealthReport>,
    pub task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

pub fn config() -> Config {
    Config {
        backoff: Backoff {
            jitter: 0.0,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn spawn(config: Config) -> Harness {
    let dataplane = MemoryDataplane::default();
    let (updates_tx, updates_rx) = mpsc::channel(16);
    let (resyncs_tx, resyncs_rx) = mpsc::channel(1);
    let (health_tx, health_rx) = watch::channel(HealthReport::default());
    let reconciler = Reconciler::new(
        dataplane.clone(),
        config,
        ReconcilerMetrics::register(&mut Default::default()),
        health_tx,
    );
    let task = tokio::spawn(reconciler.run(updates_rx, resyncs_tx));
    Harness {
        dataplane,
        updates: updates_tx,
        resyncs: resyncs_rx,
        health: health_rx,
        task,
    }
}

impl Harness {
    pub async fn send(&self, update: IntentUpdate) {
        self.updates
            .send(update)
            .await
            .expect("reconciler must be running");
    }

    /// Waits until the given version is fully applied.
    pub async fn applied(&mut self, version: u64) -> HealthReport {
        tokio::time::timeout(
            Duration::from_secs(600),
            self.health
                .wait_for(|h| h.applied_version == Some(version) && h.is_in_sync()),
        )
        .await
        .expect("version must be applied")
        .expect("reconciler must be running")
        .clone()
    }

    pub async fn wait_for(&mut self, f: impl FnMut(&HealthReport) -> bool) -> HealthReport {
        tokio::time::timeout(Duration::from_secs(600), self.health.wait_for(f))
            .await
            .expect("health must change")
            .expect("reconciler must be running")
            .clone()
    }

    /// Asserts that every workload reachable from the dispatch chains is enforced by a chain that
    /// ends in a drop.
    pub fn assert_fail_closed(&self) {
        for name in self.dataplane.chain_names() {
            let chain = self.dataplane.chain(&name).unwrap();
            if ChainKind::of(&name) == ChainKind::Endpoint {
                assert_eq!(
                    chain.rules.last().map(|r| &r.action),
                    Some(&ChainAction::Drop),
                    "{name} must end with a drop"
                );
            }
            for target in chain.targets() {
                assert!(
                    self.dataplane.chain(target).is_some(),
                    "{name} refers to missing chain {target}"
                );
            }
        }
        for dispatch in ["pa-from-wl-dispatch", "pa-to-wl-dispatch"] {
            if let Some(chain) = self.dataplane.chain(dispatch) {
                assert_eq!(
                    chain.rules.last().map(|r| &r.action),
                    Some(&ChainAction::Drop)
                );
            }
        }
    }
}

/// The ingress chain name of a workload.
pub fn to_workload(iface: &str) -> String {
    let [ingress, _] = render::endpoint_chains(policy_agent_core::EndpointKind::Workload, iface);
    ingress
}
