//! # Design
//!
//! - Keep error messages constant while carrying context fields for debugging.
//! - Field-level validation failures name the offending key and value.

use thiserror::Error;

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required key was absent from every source.
    #[error("missing required configuration key")]
    MissingKey {
        /// The absent key, in environment form.
        key: &'static str,
    },
    /// A key was present but failed validation.
    #[error("invalid configuration value")]
    InvalidValue {
        /// The offending key, in environment form.
        key: &'static str,
        /// The rejected value.
        value: String,
        /// Machine-readable reason for the rejection.
        reason: &'static str,
    },
    /// The optional configuration file could not be read.
    #[error("failed to read configuration file")]
    FileRead {
        /// Path of the file that failed to read.
        path: String,
        /// Source IO error.
        #[source]
        source: std::io::Error,
    },
    /// The optional configuration file could not be parsed.
    #[error("failed to parse configuration file")]
    FileParse {
        /// Path of the file that failed to parse.
        path: String,
        /// Source TOML error.
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    /// Stable kind label for the error taxonomy.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MissingKey { .. } | Self::InvalidValue { .. } => "validation",
            Self::FileRead { .. } | Self::FileParse { .. } => "fatal",
        }
    }
}
