//! # Design
//!
//! - A timed-out command returns an error to its caller and is not retried;
//!   the operator retries explicitly.

use thiserror::Error;
use uuid::Uuid;

/// Result alias for control-plane operations.
pub type ControlResult<T> = Result<T, ControlError>;

/// Control-plane error type.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The target node has no live control connection.
    #[error("node is not connected")]
    NotConnected {
        /// The target node.
        node_id: Uuid,
    },
    /// No response arrived within the wait window.
    #[error("command timed out")]
    Timeout {
        /// The command's message id.
        message_id: Uuid,
    },
    /// The connection's bounded send buffer overflowed.
    #[error("send buffer full")]
    BufferFull {
        /// The target node.
        node_id: Uuid,
    },
    /// A frame failed to serialize or deserialize.
    #[error("frame serialization failed")]
    Frame {
        /// Operation identifier.
        operation: &'static str,
        /// Source JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// The transport failed.
    #[error("control transport failed")]
    Transport {
        /// Operation identifier.
        operation: &'static str,
        /// Human-readable detail.
        detail: String,
    },
    /// The remote sent a frame that violates the protocol.
    #[error("control protocol violation")]
    Protocol {
        /// Description of the violation.
        detail: String,
    },
}

impl ControlError {
    /// Stable kind label for the error taxonomy.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected { .. } => "not_found",
            Self::Timeout { .. } | Self::Transport { .. } => "transient",
            Self::BufferFull { .. } => "capacity",
            Self::Frame { .. } | Self::Protocol { .. } => "protocol",
        }
    }
}
