use crate::{ip_sets::EndpointMembers, resolver::LocalEndpoint, rules::parse_net};
use anyhow::{Context, Result};
use ipnet::IpNet;
use policy_agent_core::{NamedPort, Protocol};
use policy_agent_k8s_api::{
    endpoint::{EndpointPort, HostEndpointSpec, WorkloadEndpointSpec},
    labels::Map,
    policy, Labels, NAMESPACE_LABEL,
};

/// An endpoint as the graph tracks it.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Endpoint {
    pub node: String,
    pub interface: Option<String>,

    /// The endpoint's own labels, including the implicit namespace label.
    pub labels: Labels,

    pub profiles: Vec<String>,
    pub members: EndpointMembers,

    /// Whether the endpoint is a workload, which gets a route on its node.
    pub routed: bool,
}

// === impl Endpoint ===

impl Endpoint {
    pub(crate) fn workload(namespace: &str, labels: Map, spec: &WorkloadEndpointSpec) -> Result<Self> {
        let nets = spec
            .ip_networks
            .iter()
            .map(|n| parse_addr(n))
            .collect::<Result<Vec<_>>>()?;
        let labels = Labels::from(labels).overlay([(NAMESPACE_LABEL, namespace)]);
        Ok(Self {
            node: spec.node.clone(),
            interface: spec.interface_name.clone(),
            labels,
            profiles: spec.profiles.clone().unwrap_or_default(),
            members: EndpointMembers {
                nets,
                ports: convert_ports(spec.ports.as_deref()),
            },
            routed: true,
        })
    }

    pub(crate) fn host(labels: Map, spec: &HostEndpointSpec) -> Result<Self> {
        let nets = spec
            .expected_ips
            .iter()
            .map(|n| parse_addr(n))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            node: spec.node.clone(),
            interface: spec.interface_name.clone(),
            labels: labels.into(),
            profiles: spec.profiles.clone().unwrap_or_default(),
            members: EndpointMembers {
                nets,
                ports: convert_ports(spec.ports.as_deref()),
            },
            routed: false,
        })
    }

    /// The endpoint's enforcement state, if it is enforced on `node`.
    pub(crate) fn local(&self, node: &str) -> Option<LocalEndpoint> {
        if self.node != node {
            return None;
        }
        Some(LocalEndpoint {
            interface: self.interface.clone()?,
            profiles: self.profiles.clone(),
        })
    }

    /// Computes the labels selectors see: the labels applied by the endpoint's profiles (earlier
    /// profiles win), overridden by the endpoint's own labels.
    pub(crate) fn effective_labels<'p>(
        &self,
        profile_labels: impl Fn(&str) -> Option<&'p Map>,
    ) -> Labels {
        let mut inherited = Map::new();
        for profile in &self.profiles {
            if let Some(labels) = profile_labels(profile) {
                for (k, v) in labels {
                    inherited.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }
        if inherited.is_empty() {
            return self.labels.clone();
        }
        Labels::from(inherited).overlay(self.labels.iter())
    }
}

/// Parses an endpoint address, with or without a prefix length.
fn parse_addr(s: &str) -> Result<IpNet> {
    match s.parse::<IpNet>() {
        Ok(net) => Ok(net),
        Err(_) => parse_net(s).with_context(|| format!("invalid endpoint address: {s:?}")),
    }
}

fn convert_ports(ports: Option<&[EndpointPort]>) -> Vec<NamedPort> {
    ports
        .unwrap_or_default()
        .iter()
        .map(|p| NamedPort {
            name: p.name.clone(),
            protocol: match p.protocol {
                policy::Protocol::Tcp => Protocol::Tcp,
                policy::Protocol::Udp => Protocol::Udp,
                policy::Protocol::Sctp => Protocol::Sctp,
                policy::Protocol::Icmp => Protocol::Icmp,
                policy::Protocol::Icmpv6 => Protocol::Icmpv6,
            },
            port: p.port,
        })
        .collect()
}
