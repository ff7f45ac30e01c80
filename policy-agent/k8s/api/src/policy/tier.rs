use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Groups policies that are evaluated together.
///
/// Tiers are evaluated in ascending `order`; a tier without an order sorts after every ordered
/// tier, and ties are broken by name.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "crd.netpol.io", version = "v1", kind = "Tier")]
#[serde(rename_all = "camelCase")]
pub struct TierSpec {
    pub order: Option<f64>,

    /// What happens to traffic that reaches the end of the tier without a verdict from any of
    /// the tier's policies. Defaults to `Deny`.
    pub default_action: Option<TierAction>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum TierAction {
    Deny,
    Pass,
}
