use crate::ip_set::SetId;
use std::{collections::BTreeSet, fmt};

/// The tier that policies without an explicit tier belong to. It always exists.
pub const DEFAULT_TIER: &str = "default";

/// The order of the default tier when it is not configured explicitly.
pub const DEFAULT_TIER_ORDER: f64 = 1_000_000.0;

/// Identifies a policy. Namespaced policies carry their namespace; global policies do not.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyId {
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Ingress,
    Egress,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RuleAction {
    Allow,
    Deny,
    Log,
    /// Skips the remaining policies of the current tier.
    Pass,
}

/// The verdict for traffic that reaches the end of a tier.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum TierAction {
    #[default]
    Deny,
    Pass,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
    Icmp,
    Icmpv6,
}

/// An inclusive port range. A single port has `first == last`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

/// A validated rule, with every address reference resolved to an address set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParsedRule {
    pub action: RuleAction,
    pub protocol: Option<Protocol>,
    pub src: EntityMatch,
    pub dst: EntityMatch,
}

/// Criteria on one side (source or destination) of a packet.
///
/// The packet's address must be in every set of `sets` and in none of `not_sets`. When either
/// `ports` or `named_port_sets` is non-empty, the packet must match at least one of them; it must
/// match none of `not_ports` and `not_named_port_sets`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct EntityMatch {
    pub sets: Vec<SetId>,
    pub not_sets: Vec<SetId>,
    pub ports: Vec<PortRange>,
    pub named_port_sets: Vec<SetId>,
    pub not_ports: Vec<PortRange>,
    pub not_named_port_sets: Vec<SetId>,
}

/// The rules of a policy or profile, per direction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PolicyRules {
    pub ingress: Vec<ParsedRule>,
    pub egress: Vec<ParsedRule>,
}

// === impl PolicyId ===

impl PolicyId {
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace.as_deref() {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

// === impl Direction ===

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Ingress, Direction::Egress];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingress => "ingress",
            Self::Egress => "egress",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Protocol ===

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
            Self::Icmp => "icmp",
            Self::Icmpv6 => "icmpv6",
        }
    }

    /// Whether the protocol has ports that rules can match on.
    pub fn has_ports(&self) -> bool {
        matches!(self, Self::Tcp | Self::Udp | Self::Sctp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "sctp" => Ok(Self::Sctp),
            "icmp" => Ok(Self::Icmp),
            "icmpv6" | "ipv6-icmp" => Ok(Self::Icmpv6),
            _ => Err(format!("unknown protocol: {s}")),
        }
    }
}

// === impl PortRange ===

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            first: port,
            last: port,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}:{}", self.first, self.last)
        }
    }
}

// === impl ParsedRule ===

impl ParsedRule {
    /// Every address set the rule refers to.
    pub fn set_ids(&self) -> impl Iterator<Item = &SetId> + '_ {
        [&self.src, &self.dst].into_iter().flat_map(|m| {
            m.sets
                .iter()
                .chain(&m.not_sets)
                .chain(&m.named_port_sets)
                .chain(&m.not_named_port_sets)
        })
    }
}

// === impl PolicyRules ===

impl PolicyRules {
    pub fn rules(&self, direction: Direction) -> &[ParsedRule] {
        match direction {
            Direction::Ingress => &self.ingress,
            Direction::Egress => &self.egress,
        }
    }

    pub fn set_ids(&self) -> BTreeSet<SetId> {
        self.ingress
            .iter()
            .chain(&self.egress)
            .flat_map(ParsedRule::set_ids)
            .cloned()
            .collect()
    }
}
