use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A workload (e.g. a pod) attached to a node through a virtual interface.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "crd.netpol.io",
    version = "v1",
    kind = "WorkloadEndpoint",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadEndpointSpec {
    pub node: String,

    /// The host-side interface of the workload. Local workloads without an interface can't be
    /// enforced and are not programmed.
    pub interface_name: Option<String>,

    pub ip_networks: Vec<String>,
    pub profiles: Option<Vec<String>>,
    pub ports: Option<Vec<EndpointPort>>,
}

/// A host interface subject to policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "crd.netpol.io", version = "v1", kind = "HostEndpoint")]
#[serde(rename_all = "camelCase")]
pub struct HostEndpointSpec {
    pub node: String,
    pub interface_name: Option<String>,
    pub expected_ips: Vec<String>,
    pub profiles: Option<Vec<String>>,
    pub ports: Option<Vec<EndpointPort>>,
}

/// A named port exposed by an endpoint, referenced by rules' named ports.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndpointPort {
    pub name: String,
    pub protocol: crate::policy::Protocol,
    pub port: u16,
}
