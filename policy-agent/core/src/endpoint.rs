use crate::policy::Protocol;
use std::fmt;

/// Identifies a workload or host endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId {
    pub kind: EndpointKind,
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndpointKind {
    Workload,
    Host,
}

/// A port an endpoint exposes under a name, so that rules may refer to it by name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamedPort {
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
}

// === impl EndpointId ===

impl EndpointId {
    pub fn workload(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: EndpointKind::Workload,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn host(name: impl Into<String>) -> Self {
        Self {
            kind: EndpointKind::Host,
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            EndpointKind::Workload => "workload",
            EndpointKind::Host => "host",
        };
        match self.namespace.as_deref() {
            Some(ns) => write!(f, "{kind}:{ns}/{}", self.name),
            None => write!(f, "{kind}:{}", self.name),
        }
    }
}
