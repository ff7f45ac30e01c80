//! Mechanism-neutral descriptions of the resources the agent owns in the live system.
//!
//! Chains are ordered lists of rules, in the style of a packet-filter table. Policy verdicts are
//! communicated between chains through two packet-mark bits: [`ACCEPT_MARK`] is set by a policy
//! that allows the packet and [`PASS_MARK`] by a policy that passes it to the next tier.

use ipnet::IpNet;
use policy_agent_core::{IpSet, PortRange, Protocol, ResourceClass, Route, SetId, SetKind};
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, fmt};

pub const ACCEPT_MARK: u32 = 0x1_0000;
pub const PASS_MARK: u32 = 0x2_0000;

/// Every chain the agent owns starts with this prefix.
pub const CHAIN_PREFIX: &str = "pa-";

/// Identifies a resource owned by the agent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKey {
    IpSet(SetId),
    Chain(String),
    Route(IpNet),
}

/// Chains are created in this order (and deleted in the reverse order), so that a chain is
/// always created before any chain that jumps to it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChainKind {
    Policy,
    Endpoint,
    Dispatch,
    Root,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chain {
    pub rules: Vec<ChainRule>,
}

/// A rule applies its action to packets that satisfy every match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainRule {
    pub matches: Vec<Match>,
    pub action: ChainAction,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    Src,
    Dst,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Match {
    /// A trailing `+` matches every interface with the given prefix.
    InInterface(String),
    OutInterface(String),

    /// Every bit of the mask is set in the packet mark.
    MarkAll(u32),
    /// No bit of the mask is set in the packet mark.
    MarkClear(u32),

    Protocol(Protocol),

    /// The packet's address (or, for named-port sets, its address and port) is in the set.
    Set {
        id: SetId,
        kind: SetKind,
        side: Side,
        negated: bool,
    },

    Ports {
        side: Side,
        ports: Vec<PortRange>,
        negated: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainAction {
    Accept,
    Drop,
    Return,
    Jump(String),
    /// Continues in the target chain; a return from it returns from this chain.
    Goto(String),
    SetMark(u32),
    ClearMark(u32),
    Log(String),
}

/// The agent-owned resources read back from the live system.
///
/// Chains are known only by their fingerprint, which changes with any change to their rules.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Observed {
    pub ip_sets: BTreeMap<SetId, IpSet>,
    pub chains: BTreeMap<String, String>,
    pub routes: BTreeMap<IpNet, Route>,
}

// === impl ResourceKey ===

impl ResourceKey {
    pub fn class(&self) -> ResourceClass {
        match self {
            Self::IpSet(_) => ResourceClass::IpSets,
            Self::Chain(_) => ResourceClass::Chains,
            Self::Route(_) => ResourceClass::Routes,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IpSet(id) => write!(f, "ip-set {id}"),
            Self::Chain(name) => write!(f, "chain {name}"),
            Self::Route(dst) => write!(f, "route {dst}"),
        }
    }
}

// === impl ChainKind ===

impl ChainKind {
    /// Classifies an agent-owned chain by its name.
    pub fn of(name: &str) -> Self {
        let suffix = name.strip_prefix(CHAIN_PREFIX).unwrap_or(name);
        if suffix.ends_with("-dispatch") {
            Self::Dispatch
        } else if suffix.starts_with('p') {
            Self::Policy
        } else if suffix.chars().all(|c| c.is_ascii_uppercase()) {
            Self::Root
        } else {
            Self::Endpoint
        }
    }
}

// === impl Chain ===

impl Chain {
    pub fn new(rules: Vec<ChainRule>) -> Self {
        Self { rules }
    }

    /// A short hash of the chain's rules.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for rule in &self.rules {
            hasher.update(rule.to_string().as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize()[..8]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// The chains this chain jumps to.
    pub fn targets(&self) -> impl Iterator<Item = &str> + '_ {
        self.rules.iter().filter_map(|r| match &r.action {
            ChainAction::Jump(t) | ChainAction::Goto(t) => Some(t.as_str()),
            _ => None,
        })
    }

    pub fn set_ids(&self) -> impl Iterator<Item = &SetId> + '_ {
        self.rules.iter().flat_map(|r| {
            r.matches.iter().filter_map(|m| match m {
                Match::Set { id, .. } => Some(id),
                _ => None,
            })
        })
    }
}

// === impl ChainRule ===

impl ChainRule {
    pub fn new(matches: Vec<Match>, action: ChainAction) -> Self {
        Self { matches, action }
    }

    pub fn always(action: ChainAction) -> Self {
        Self::new(vec![], action)
    }
}

impl fmt::Display for ChainRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in &self.matches {
            write!(f, "{m} ")?;
        }
        write!(f, "=> {}", self.action)
    }
}

// === impl Side ===

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Src => "src",
            Self::Dst => "dst",
        }
    }
}

// === impl Match ===

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let not = |negated: &bool| if *negated { "!" } else { "" };
        match self {
            Self::InInterface(i) => write!(f, "in={i}"),
            Self::OutInterface(i) => write!(f, "out={i}"),
            Self::MarkAll(m) => write!(f, "mark&{m:#x}=={m:#x}"),
            Self::MarkClear(m) => write!(f, "mark&{m:#x}==0"),
            Self::Protocol(p) => write!(f, "proto={p}"),
            Self::Set {
                id,
                kind,
                side,
                negated,
            } => {
                let kind = match kind {
                    SetKind::Net => "net",
                    SetKind::NamedPort => "port",
                };
                write!(f, "{}{}-{kind}-set={id}", not(negated), side.as_str())
            }
            Self::Ports {
                side,
                ports,
                negated,
            } => {
                let ports = ports.iter().map(|p| p.to_string()).collect::<Vec<_>>();
                write!(
                    f,
                    "{}{}-ports={}",
                    not(negated),
                    side.as_str(),
                    ports.join(",")
                )
            }
        }
    }
}

// === impl ChainAction ===

impl fmt::Display for ChainAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => f.write_str("accept"),
            Self::Drop => f.write_str("drop"),
            Self::Return => f.write_str("return"),
            Self::Jump(t) => write!(f, "jump {t}"),
            Self::Goto(t) => write!(f, "goto {t}"),
            Self::SetMark(m) => write!(f, "set-mark {m:#x}"),
            Self::ClearMark(m) => write!(f, "clear-mark {m:#x}"),
            Self::Log(prefix) => write!(f, "log {prefix:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_kinds() {
        assert_eq!(ChainKind::of("pa-pi-0123456789abcdef"), ChainKind::Policy);
        assert_eq!(ChainKind::of("pa-pro-0123456789abcdef"), ChainKind::Policy);
        assert_eq!(ChainKind::of("pa-tw-veth-a"), ChainKind::Endpoint);
        assert_eq!(ChainKind::of("pa-fh-eth0"), ChainKind::Endpoint);
        assert_eq!(ChainKind::of("pa-from-wl-dispatch"), ChainKind::Dispatch);
        assert_eq!(ChainKind::of("pa-FORWARD"), ChainKind::Root);
        assert!(ChainKind::Policy < ChainKind::Endpoint);
        assert!(ChainKind::Dispatch < ChainKind::Root);
    }

    #[test]
    fn fingerprints_track_rules() {
        let drop = Chain::new(vec![ChainRule::always(ChainAction::Drop)]);
        let accept = Chain::new(vec![ChainRule::always(ChainAction::Accept)]);
        assert_eq!(drop.fingerprint(), drop.clone().fingerprint());
        assert_ne!(drop.fingerprint(), accept.fingerprint());
        assert_ne!(drop.fingerprint(), Chain::default().fingerprint());
        assert_eq!(drop.fingerprint().len(), 16);
    }

    #[test]
    fn rule_display() {
        let rule = ChainRule::new(
            vec![
                Match::Protocol(Protocol::Tcp),
                Match::Ports {
                    side: Side::Dst,
                    ports: vec![PortRange::single(80), PortRange { first: 8000, last: 8080 }],
                    negated: true,
                },
                Match::MarkClear(PASS_MARK),
            ],
            ChainAction::SetMark(ACCEPT_MARK),
        );
        assert_eq!(
            rule.to_string(),
            "proto=tcp !dst-ports=80,8000:8080 mark&0x20000==0 => set-mark 0x10000"
        );
    }
}
