//! Core types shared by the stages of the policy agent.
//!
//! The calculation graph produces an [`Intent`]: the complete description of what the local
//! dataplane must enforce. The reconciler consumes it as a stream of [`IntentUpdate`]s and reports
//! its progress as a [`HealthReport`].

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod endpoint;
pub mod intent;
pub mod ip_set;
pub mod policy;
pub mod status;

pub use self::{
    endpoint::{EndpointId, EndpointKind, NamedPort},
    intent::{
        DirectionChain, EndpointIntent, Intent, IntentDelta, IntentUpdate, IpSet, Route,
        SetUpdate, TierChain,
    },
    ip_set::{Member, SetDefinition, SetId, SetKind},
    policy::{
        Direction, EntityMatch, ParsedRule, PolicyId, PolicyRules, PortRange, Protocol,
        RuleAction, TierAction,
    },
    status::{ClassHealth, HealthReport, ResourceClass},
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};
