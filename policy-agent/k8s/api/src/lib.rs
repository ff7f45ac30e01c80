#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod endpoint;
pub mod feed;
pub mod labels;
pub mod policy;
pub mod selector;
mod watch;

pub use self::{
    feed::{EventType, FeedEvent, Kind, Payload, ResourceEvent, ResourceName},
    labels::Labels,
    selector::Selector,
    watch::{FeedResource, Watch},
};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
pub use kube::{
    api::{Api, ResourceExt},
    Client, CustomResourceExt, Resource,
};

/// The API group of all resources consumed by the agent.
pub const API_GROUP: &str = "crd.netpol.io";

/// The label implicitly applied to namespaced endpoints, naming their namespace.
pub const NAMESPACE_LABEL: &str = "netpol.io/namespace";
