//! Address sets referenced by rules.
//!
//! A set is identified by a hash of its canonical definition, so that every rule that refers to
//! the same addresses shares one set, and so that the set's name is stable across restarts.

use crate::policy::Protocol;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ipnet::IpNet;
use sha2::{Digest, Sha256};
use std::{collections::BTreeSet, fmt, net::IpAddr, sync::Arc};

/// The length of the hash portion of a set id.
const ID_HASH_LEN: usize = 22;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetId(Arc<str>);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SetKind {
    /// Addresses and networks.
    Net,
    /// (address, protocol, port) triples.
    NamedPort,
}

/// Describes how a set's members are derived.
///
/// Selectors are carried in their canonical text form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SetDefinition {
    /// The addresses of every endpoint matching the selector.
    Selector(String),

    /// A static list of networks.
    Cidrs(BTreeSet<IpNet>),

    /// The (address, protocol, port) of every endpoint matching the selector that exposes a port
    /// with the given name and protocol.
    NamedPort {
        protocol: Protocol,
        name: String,
        selector: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Member {
    Net(IpNet),
    NamedPort {
        addr: IpAddr,
        protocol: Protocol,
        port: u16,
    },
}

// === impl SetId ===

impl SetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'_ str> for SetId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl fmt::Debug for SetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for SetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// === impl SetDefinition ===

impl SetDefinition {
    pub fn kind(&self) -> SetKind {
        match self {
            Self::Selector(_) | Self::Cidrs(_) => SetKind::Net,
            Self::NamedPort { .. } => SetKind::NamedPort,
        }
    }

    /// The selector whose matches determine the set's members, if any.
    pub fn selector(&self) -> Option<&str> {
        match self {
            Self::Selector(s) | Self::NamedPort { selector: s, .. } => Some(s),
            Self::Cidrs(_) => None,
        }
    }

    /// A text form that uniquely identifies the definition.
    pub fn canonical(&self) -> String {
        match self {
            Self::Selector(sel) => format!("selector:{sel}"),
            Self::Cidrs(nets) => {
                let nets = nets.iter().map(|n| n.to_string()).collect::<Vec<_>>();
                format!("cidrs:{}", nets.join(","))
            }
            Self::NamedPort {
                protocol,
                name,
                selector,
            } => format!("named-port:{protocol}:{name}:{selector}"),
        }
    }

    /// The set's stable id: `s:` followed by a url-safe hash of the canonical definition.
    pub fn id(&self) -> SetId {
        let digest = Sha256::digest(self.canonical().as_bytes());
        let mut hash = URL_SAFE_NO_PAD.encode(digest);
        hash.truncate(ID_HASH_LEN);
        SetId(format!("s:{hash}").into())
    }
}

// === impl Member ===

impl Member {
    pub fn is_ipv4(&self) -> bool {
        match self {
            Self::Net(net) => matches!(net, IpNet::V4(_)),
            Self::NamedPort { addr, .. } => addr.is_ipv4(),
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Net(net) => fmt::Display::fmt(net, f),
            Self::NamedPort {
                addr,
                protocol,
                port,
            } => write!(f, "{addr},{protocol}:{port}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_and_short() {
        let def = SetDefinition::Selector("role == \"web\"".to_string());
        let id = def.id();
        assert_eq!(id, def.clone().id());
        assert!(id.as_str().starts_with("s:"));
        assert_eq!(id.as_str().len(), 2 + ID_HASH_LEN);
        // Set names in the kernel are limited to 31 bytes, and the dataplane adds a short prefix.
        assert!(id.as_str().len() <= 26);
    }

    #[test]
    fn ids_distinguish_definitions() {
        let sel = "role == \"web\"".to_string();
        let defs = [
            SetDefinition::Selector(sel.clone()),
            SetDefinition::NamedPort {
                protocol: Protocol::Tcp,
                name: "http".to_string(),
                selector: sel.clone(),
            },
            SetDefinition::NamedPort {
                protocol: Protocol::Udp,
                name: "http".to_string(),
                selector: sel,
            },
            SetDefinition::Cidrs(["10.0.0.0/8".parse().unwrap()].into_iter().collect()),
        ];
        let ids = defs.iter().map(SetDefinition::id).collect::<BTreeSet<_>>();
        assert_eq!(ids.len(), defs.len());
    }

    #[test]
    fn cidr_order_does_not_matter() {
        let a: IpNet = "10.0.0.0/8".parse().unwrap();
        let b: IpNet = "192.168.0.0/16".parse().unwrap();
        let one = SetDefinition::Cidrs([a, b].into_iter().collect());
        let two = SetDefinition::Cidrs([b, a].into_iter().collect());
        assert_eq!(one.id(), two.id());
    }

    #[test]
    fn member_display() {
        let net = Member::Net("10.1.2.3/32".parse().unwrap());
        assert_eq!(net.to_string(), "10.1.2.3/32");
        let port = Member::NamedPort {
            addr: "10.1.2.3".parse().unwrap(),
            protocol: Protocol::Tcp,
            port: 8080,
        };
        assert_eq!(port.to_string(), "10.1.2.3,tcp:8080");
        assert!(port.is_ipv4());
        assert!(!Member::Net("fd00::1/128".parse().unwrap()).is_ipv4());
    }
}
