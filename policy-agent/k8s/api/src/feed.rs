//! The datastore event feed consumed by the calculation graph.
//!
//! Events are ordered per resource but not globally. A watch may restart from scratch at any time:
//! the feed then emits `Restarted(kind)`, re-lists every resource of that kind as `Added` events,
//! and finishes with `Synced(kind)`.

use crate::{
    endpoint::{HostEndpointSpec, WorkloadEndpointSpec},
    labels::Map,
    policy::{GlobalNetworkPolicySpec, NetworkPolicySpec, ProfileSpec, TierSpec},
};
use std::fmt;

#[derive(Clone, Debug, PartialEq)]
pub enum FeedEvent {
    /// The watch for `Kind` restarted; a full listing follows.
    Restarted(Kind),

    Resource(ResourceEvent),

    /// The listing that followed a restart of `Kind` is complete.
    Synced(Kind),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResourceEvent {
    pub kind: Kind,
    pub name: ResourceName,
    pub resource_version: Option<String>,
    pub event_type: EventType,

    /// Unset for `Deleted` events.
    pub payload: Option<Payload>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Tier,
    NetworkPolicy,
    GlobalNetworkPolicy,
    Profile,
    WorkloadEndpoint,
    HostEndpoint,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// Identifies a resource within its kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName {
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Tier(TierSpec),
    NetworkPolicy(NetworkPolicySpec),
    GlobalNetworkPolicy(GlobalNetworkPolicySpec),
    Profile(ProfileSpec),
    WorkloadEndpoint {
        labels: Map,
        spec: WorkloadEndpointSpec,
    },
    HostEndpoint {
        labels: Map,
        spec: HostEndpointSpec,
    },
}

// === impl Kind ===

impl Kind {
    pub const ALL: [Kind; 6] = [
        Kind::Tier,
        Kind::NetworkPolicy,
        Kind::GlobalNetworkPolicy,
        Kind::Profile,
        Kind::WorkloadEndpoint,
        Kind::HostEndpoint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tier => "Tier",
            Self::NetworkPolicy => "NetworkPolicy",
            Self::GlobalNetworkPolicy => "GlobalNetworkPolicy",
            Self::Profile => "Profile",
            Self::WorkloadEndpoint => "WorkloadEndpoint",
            Self::HostEndpoint => "HostEndpoint",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl EventType ===

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }
}

// === impl ResourceName ===

impl ResourceName {
    pub fn cluster(name: impl Into<String>) -> Self {
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

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace.as_deref() {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

// === impl ResourceEvent ===

impl ResourceEvent {
    pub fn applied(
        kind: Kind,
        name: ResourceName,
        event_type: EventType,
        payload: Payload,
    ) -> Self {
        Self {
            kind,
            name,
            resource_version: None,
            event_type,
            payload: Some(payload),
        }
    }

    pub fn deleted(kind: Kind, name: ResourceName) -> Self {
        Self {
            kind,
            name,
            resource_version: None,
            event_type: EventType::Deleted,
            payload: None,
        }
    }
}
