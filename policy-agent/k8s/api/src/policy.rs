pub mod network_policy;
pub mod profile;
pub mod rule;
pub mod tier;

pub use self::{
    network_policy::{
        GlobalNetworkPolicy, GlobalNetworkPolicySpec, NetworkPolicy, NetworkPolicySpec,
        PolicyBody, PolicyType,
    },
    profile::{Profile, ProfileSpec},
    rule::{Action, EntityRule, Port, Protocol, Rule},
    tier::{Tier, TierAction, TierSpec},
};
