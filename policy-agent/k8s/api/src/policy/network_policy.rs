use super::rule::Rule;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A policy that only selects endpoints in its own namespace.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "crd.netpol.io",
    version = "v1",
    kind = "NetworkPolicy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicySpec {
    #[serde(flatten)]
    pub policy: PolicyBody,
}

/// A policy that may select endpoints in any namespace as well as host endpoints.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "crd.netpol.io", version = "v1", kind = "GlobalNetworkPolicy")]
#[serde(rename_all = "camelCase")]
pub struct GlobalNetworkPolicySpec {
    #[serde(flatten)]
    pub policy: PolicyBody,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyBody {
    /// The tier this policy belongs to. Unset means the `default` tier.
    pub tier: Option<String>,

    /// Lower orders are evaluated first. Unordered policies are evaluated last.
    pub order: Option<f64>,

    /// Selects the endpoints this policy applies to. Unset selects all endpoints.
    pub selector: Option<String>,

    pub types: Option<Vec<PolicyType>>,
    pub ingress: Option<Vec<Rule>>,
    pub egress: Option<Vec<Rule>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum PolicyType {
    Ingress,
    Egress,
}
