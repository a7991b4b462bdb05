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

//! Binary entrypoint wiring OmniCloud services by role and blocking until
//! shutdown.

pub mod backoff;
pub mod bootstrap;
pub mod hub;
pub mod hub_client;
pub mod reporters;
pub mod site;

use anyhow::Result;

/// Bootstraps the node and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::run_app().await
}
