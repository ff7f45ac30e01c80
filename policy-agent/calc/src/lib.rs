//! Computes the dataplane intent of the local node from the datastore feed.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod coordinator;
mod endpoints;
mod graph;
mod ip_sets;
pub mod label_index;
mod metrics;
mod resolver;
mod rules;

#[cfg(test)]
mod tests;

pub use self::{
    coordinator::{Config, Coordinator},
    graph::{CalcGraph, GraphStats, SelectorKey},
    label_index::{LabelIndex, MatchDelta},
    metrics::CalcMetrics,
};
