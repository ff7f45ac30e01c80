use super::rule::Rule;
use crate::labels::Map;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Rules and labels shared by every endpoint that lists the profile.
///
/// Profile rules are evaluated after all tiers, in the order the endpoint lists its profiles.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "crd.netpol.io", version = "v1", kind = "Profile")]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    /// Labels inherited by every endpoint that lists this profile.
    pub labels_to_apply: Option<Map>,
    pub ingress: Option<Vec<Rule>>,
    pub egress: Option<Vec<Rule>>,
}
