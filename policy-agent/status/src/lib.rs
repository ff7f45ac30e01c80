//! Reports the health of the dataplane reconciler through logs and metrics.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod metrics;
mod reporter;

pub use self::{metrics::StatusMetrics, reporter::Reporter};
