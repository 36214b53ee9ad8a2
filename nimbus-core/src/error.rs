//! Engine error types.
//!
//! The core distinguishes recoverable failures from fatal ones. Recoverable
//! kinds never abort the controller: an invalid spawn drops the one
//! offending task, a conflict leaves state unchanged, allocation pressure is
//! retried on the next scheduling round, a lost worker triggers rewind, and
//! backpressure is retried by the sender. Only [`NimbusError::Fatal`] (an
//! invariant violation such as a non-monotonic version) short-circuits the
//! scheduler loop and initiates graceful termination with nonzero status.

use thiserror::Error;

use crate::ids::WorkerId;

#[derive(Debug, Error)]
pub enum NimbusError {
    /// A spawn command carried malformed or unresolved references. The task
    /// is dropped; the submitting worker is informed; other tasks proceed.
    #[error("invalid spawn: {0}")]
    InvalidSpawn(String),

    /// Duplicate definition or double finalize. State is unchanged.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No instance and no eviction victim on the chosen worker. The task
    /// stays ready and is retried on the next scheduling round.
    #[error("allocation pressure on worker {worker}")]
    AllocationPressure { worker: WorkerId },

    /// Handshake timeout or transport failure. Triggers rewind to the
    /// latest complete checkpoint.
    #[error("worker {worker} lost: {detail}")]
    WorkerLost { worker: WorkerId, detail: String },

    /// A non-blocking send could not be completed. Surfaced upward for the
    /// caller's retry policy.
    #[error("backpressure while sending to worker {worker}")]
    Backpressure { worker: WorkerId },

    /// Invariant violation. Logged by the scheduler, which then terminates
    /// gracefully with a nonzero status.
    #[error("fatal: {0}")]
    Fatal(anyhow::Error),
}

impl From<anyhow::Error> for NimbusError {
    fn from(err: anyhow::Error) -> Self {
        Self::Fatal(err)
    }
}

impl NimbusError {
    pub fn fatal(detail: impl Into<String>) -> Self {
        Self::Fatal(anyhow::Error::msg(detail.into()))
    }

    /// Whether the scheduler loop must stop on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

pub type Result<T> = std::result::Result<T, NimbusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_fatal_short_circuits() {
        assert!(NimbusError::fatal("bad version").is_fatal());
        assert!(!NimbusError::InvalidSpawn("x".into()).is_fatal());
        assert!(!NimbusError::AllocationPressure { worker: 1 }.is_fatal());
        assert!(!NimbusError::Backpressure { worker: 1 }.is_fatal());
    }
}
