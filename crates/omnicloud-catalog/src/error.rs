//! # Design
//!
//! - Centralize catalog errors with operation context fields.
//! - Preserve source errors without re-logging at call sites.
//! - Writes have no hidden retries; transient failures surface to the caller.

use thiserror::Error;
use uuid::Uuid;

/// Result alias for catalog operations.
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Catalog error type.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A database operation failed.
    #[error("catalog operation failed")]
    Database {
        /// Operation identifier.
        operation: &'static str,
        /// Source sqlx error.
        #[source]
        source: sqlx::Error,
    },
    /// A stored value could not be decoded into its domain type.
    #[error("catalog row decoding failed")]
    Decode {
        /// Operation identifier.
        operation: &'static str,
        /// Column that failed to decode.
        column: &'static str,
        /// The rejected value.
        value: String,
    },
    /// A requested row does not exist.
    #[error("catalog row not found")]
    NotFound {
        /// Entity label.
        entity: &'static str,
        /// Identifier used in the lookup.
        id: String,
    },
    /// A transfer status change violated the transition table.
    #[error("invalid transfer status transition")]
    InvalidTransition {
        /// Transfer identifier.
        transfer_id: Uuid,
        /// Status the transfer currently holds.
        from: &'static str,
        /// Status the caller attempted to set.
        to: &'static str,
    },
    /// Two packages share the same composition fingerprint.
    #[error("duplicate canonical package for composition fingerprint")]
    AmbiguousCanonical {
        /// The composition fingerprint with more than one canonical row.
        inner_fp: String,
    },
}

impl CatalogError {
    pub(crate) fn db(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Database { operation, source }
    }

    /// Stable kind label for the error taxonomy.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Database { .. } => "transient",
            Self::Decode { .. } | Self::AmbiguousCanonical { .. } => "fatal",
            Self::NotFound { .. } => "not_found",
            Self::InvalidTransition { .. } => "validation",
        }
    }
}
