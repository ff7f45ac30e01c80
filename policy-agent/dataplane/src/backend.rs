use crate::{model::Observed, plan::Op};
use std::time::Duration;

pub mod iptables;
pub mod memory;

/// A mechanism that enforces the rendered resources in the live system.
#[async_trait::async_trait]
pub trait Dataplane: Send + Sync + 'static {
    /// Applies operations in order.
    ///
    /// On failure, every operation before [`ApplyError::failed`] has been applied and no later
    /// operation has been attempted.
    async fn apply_batch(&self, ops: &[Op]) -> Result<(), ApplyError>;

    /// Reads back every resource the agent owns.
    async fn read_state(&self) -> Result<Observed, BackendError>;
}

#[derive(Debug, thiserror::Error)]
#[error("operation {failed} of the batch failed: {source}")]
pub struct ApplyError {
    /// The index of the first operation that was not applied.
    pub failed: usize,
    #[source]
    pub source: BackendError,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The live system cannot be managed at all.
    #[error("dataplane unavailable: {0}")]
    Unavailable(String),

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("unexpected output from {command}: {message}")]
    Parse { command: String, message: String },

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

// === impl BackendError ===

impl BackendError {
    /// Whether retrying cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
