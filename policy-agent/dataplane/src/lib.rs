//! Enforces the intent of the local node in the live system.
//!
//! The intent is rendered into mechanism-neutral resources (address sets, chains of rules, and
//! routes), which a [`Dataplane`] implementation installs. The [`Reconciler`] owns the only
//! handle to the dataplane and keeps it converged, correcting drift found by periodic resyncs.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod backend;
mod backoff;
mod metrics;
pub mod model;
mod plan;
mod reconciler;
pub mod render;

#[cfg(test)]
mod tests;

pub use self::{
    backend::{
        iptables::{IptablesConfig, IptablesDataplane, Mode as IptablesMode},
        memory::MemoryDataplane,
        ApplyError, BackendError, Dataplane,
    },
    backoff::Backoff,
    metrics::ReconcilerMetrics,
    plan::{Model, Op, ResourceState},
    reconciler::{Config, Reconciler},
    render::{Desired, RenderConfig},
};
