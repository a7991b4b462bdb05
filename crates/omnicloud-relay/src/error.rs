//! # Design
//!
//! - Protocol violations close the connection with an `ERROR <reason>` line.
//! - Capacity exhaustion is a distinct, fast-failing variant.

use thiserror::Error;

/// Result alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Relay error type.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Socket I/O failed.
    #[error("relay io failure")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Source IO error.
        #[source]
        source: std::io::Error,
    },
    /// A line did not parse as a relay command.
    #[error("malformed relay command")]
    Protocol {
        /// The offending line, truncated for logging.
        line: String,
    },
    /// The remote replied with an `ERROR` line.
    #[error("relay rejected the request")]
    Rejected {
        /// Reason carried on the `ERROR` line.
        reason: String,
    },
    /// The relay is at its session limit.
    #[error("relay at capacity")]
    AtCapacity,
    /// The requested peer has no registration and direct dial failed.
    #[error("peer not registered")]
    PeerNotRegistered {
        /// The advertised address that was requested.
        target: String,
    },
    /// A pending session never received its data connection.
    #[error("session timed out waiting for the seeder")]
    SessionTimeout {
        /// Session identifier.
        session_id: String,
    },
}

impl RelayError {
    pub(crate) fn io(operation: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Io { operation, source }
    }

    /// Stable kind label for the error taxonomy.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Io { .. } | Self::SessionTimeout { .. } => "transient",
            Self::Protocol { .. } => "protocol",
            Self::Rejected { .. } | Self::PeerNotRegistered { .. } => "not_found",
            Self::AtCapacity => "capacity",
        }
    }
}
