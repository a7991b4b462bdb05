//! # Design
//!
//! - One engine-level error enum with operation context.
//! - Integrity failures carry the piece or file that failed so operators can
//!   investigate without re-running verification.

use std::path::PathBuf;

use omnicloud_metainfo::InfoHash;
use thiserror::Error;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The torrent is not registered with the engine.
    #[error("torrent not registered")]
    NotRegistered {
        /// Info-hash that was requested.
        info_hash: InfoHash,
    },
    /// The torrent is already registered.
    #[error("torrent already registered")]
    AlreadyRegistered {
        /// Info-hash that was re-registered.
        info_hash: InfoHash,
    },
    /// The metainfo bytes could not be parsed.
    #[error("invalid metainfo")]
    Metainfo {
        /// Source metainfo error.
        #[source]
        source: omnicloud_metainfo::MetainfoError,
    },
    /// Disk I/O failed.
    #[error("engine io failure")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Path involved in the failure.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: std::io::Error,
    },
    /// A piece failed hash verification.
    #[error("piece verification failed")]
    PieceVerification {
        /// Torrent the piece belongs to.
        info_hash: InfoHash,
        /// Index of the failing piece.
        piece_index: u32,
    },
    /// A payload file is missing or smaller than the metainfo requires.
    #[error("payload file missing or truncated")]
    FileIntegrity {
        /// Torrent the file belongs to.
        info_hash: InfoHash,
        /// The offending path.
        path: PathBuf,
        /// Expected minimum size in bytes.
        expected: u64,
        /// Observed size in bytes, when the file exists.
        actual: Option<u64>,
    },
    /// The tracker rejected or failed an announce.
    #[error("announce failed")]
    Announce {
        /// Human-readable failure detail.
        detail: String,
    },
    /// A peer violated the wire protocol.
    #[error("peer protocol violation")]
    PeerProtocol {
        /// Description of the violation.
        detail: String,
    },
    /// An engine command channel closed unexpectedly.
    #[error("engine channel closed")]
    ChannelClosed {
        /// Operation identifier.
        operation: &'static str,
    },
    /// A storage binding rejected the torrent's file table.
    #[error("storage binding rejected file table")]
    Storage {
        /// Description of the mismatch.
        detail: String,
    },
}

impl EngineError {
    /// Stable kind label for the error taxonomy.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotRegistered { .. } => "not_found",
            Self::AlreadyRegistered { .. } | Self::Storage { .. } => "validation",
            Self::Metainfo { .. } | Self::PeerProtocol { .. } => "protocol",
            Self::Io { .. } | Self::Announce { .. } | Self::ChannelClosed { .. } => "transient",
            Self::PieceVerification { .. } | Self::FileIntegrity { .. } => "integrity",
        }
    }
}
