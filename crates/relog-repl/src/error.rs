//! Error types for the replication subsystem.

use relog_transport::{ErrorKind, TransportError};
use thiserror::Error;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Unexpected header from a peer (wrong kind or sequence).
    #[error("protocol error: {msg}")]
    Protocol {
        /// Error message describing the mismatch.
        msg: String,
    },

    /// A request that can never be accepted.
    #[error("validation error: {msg}")]
    Validation {
        /// Error message describing the rejected value.
        msg: String,
    },

    /// Connect/send/receive failure.
    #[error("connection error: {msg}")]
    Connection {
        /// Error message describing the network issue.
        msg: String,
    },

    /// Quorum was not reached before the deadline.
    #[error("timed out after {waited_ms}ms")]
    Timeout {
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// Write concern outside `1..=followers + 1`.
    #[error("configuration error: {msg}")]
    Configuration {
        /// Error message describing the bad setting.
        msg: String,
    },

    /// Fewer healthy nodes than the write concern requires.
    #[error("quorum unavailable: {healthy} healthy nodes, write concern {required}")]
    QuorumUnavailable {
        /// Healthy nodes including the master.
        healthy: usize,
        /// Requested write concern.
        required: usize,
    },

    /// A follower answered with an error payload.
    #[error("follower {follower} rejected the request: {reason}")]
    Rejected {
        /// Follower address.
        follower: String,
        /// Error text sent by the follower.
        reason: String,
    },

    /// Replication finished without the required acknowledgements.
    #[error("replication of sequence {sequence} failed")]
    ReplicationFailed {
        /// Sequence number of the failed write.
        sequence: u32,
    },

    /// The 31-bit sequence space is used up.
    #[error("write sequence space exhausted")]
    SequenceExhausted,

    /// Component was shut down.
    #[error("replication shut down")]
    Shutdown,

    /// Transport-level error.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ReplError {
    /// Whether a replication worker should try again after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplError::Protocol { .. }
            | ReplError::Connection { .. }
            | ReplError::Timeout { .. } => true,
            ReplError::Transport(e) => matches!(
                e.kind(),
                ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::Protocol
            ),
            ReplError::Validation { .. }
            | ReplError::Configuration { .. }
            | ReplError::QuorumUnavailable { .. }
            | ReplError::Rejected { .. }
            | ReplError::ReplicationFailed { .. }
            | ReplError::SequenceExhausted
            | ReplError::Shutdown => false,
        }
    }
}

/// Result alias for the replication subsystem.
pub type Result<T> = std::result::Result<T, ReplError>;
