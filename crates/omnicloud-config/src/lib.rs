#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Node configuration for OmniCloud.
//!
//! Configuration is read once at startup from the process environment
//! (`OMNICLOUD_*` keys), optionally overlaid on a TOML file, and is immutable
//! afterwards. Components receive only the fields they need. Unknown keys are
//! ignored; missing required keys are fatal.

pub mod defaults;
pub mod error;
pub mod loader;
pub mod model;

pub use error::{ConfigError, ConfigResult};
pub use loader::{FileConfig, load_from_env, load_from_sources};
pub use model::{Config, NodeRole};
