//! # Design
//!
//! - One error enum for metainfo parsing and torrent generation.
//! - IO failures keep the path and the piece index reached so a resumed run
//!   can report where the previous one stopped.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias for metainfo operations.
pub type MetainfoResult<T> = Result<T, MetainfoError>;

/// Metainfo and generation error type.
#[derive(Debug, Error)]
pub enum MetainfoError {
    /// Bencode (de)serialization failed.
    #[error("bencode serialization failed")]
    Bencode {
        /// Operation identifier.
        operation: &'static str,
        /// Source bencode error.
        #[source]
        source: serde_bencode::Error,
    },
    /// An info-hash string or byte slice had the wrong shape.
    #[error("invalid info-hash")]
    InvalidInfoHash {
        /// The rejected value, hex or raw length description.
        value: String,
    },
    /// The package root contained no files.
    #[error("package root contains no files")]
    EmptyPackage {
        /// Root that was scanned.
        root: PathBuf,
    },
    /// A filesystem operation failed during enumeration or hashing.
    #[error("io failure during generation")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Path involved in the failure.
        path: PathBuf,
        /// Index of the piece being produced when the failure occurred.
        piece_index: Option<u32>,
        /// Source IO error.
        #[source]
        source: std::io::Error,
    },
    /// The checkpoint store rejected a read or write.
    #[error("checkpoint store failure")]
    Checkpoint {
        /// Operation identifier.
        operation: &'static str,
        /// Description from the store.
        detail: String,
    },
    /// A path under the package root was not valid UTF-8.
    #[error("package path is not valid utf-8")]
    PathNotUtf8 {
        /// The offending path.
        path: PathBuf,
    },
    /// A piece size of zero was requested.
    #[error("invalid piece size")]
    InvalidPieceSize {
        /// The rejected value.
        value: u32,
    },
    /// Generation was cancelled by the queue manager.
    #[error("generation cancelled")]
    Cancelled {
        /// Index of the next piece that would have been produced.
        piece_index: u32,
    },
}

impl MetainfoError {
    /// Stable kind label for the error taxonomy.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Bencode { .. } => "protocol",
            Self::InvalidInfoHash { .. }
            | Self::InvalidPieceSize { .. }
            | Self::PathNotUtf8 { .. } => "validation",
            Self::EmptyPackage { .. } => "not_found",
            Self::Io { .. } | Self::Checkpoint { .. } => "transient",
            Self::Cancelled { .. } => "validation",
        }
    }
}
