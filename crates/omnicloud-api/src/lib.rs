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

//! The hub HTTP API under `/api/v1`.
//!
//! Site-to-hub calls authenticate with the `X-Server-ID` and
//! `X-MAC-Address` header pair; operator/UI calls ride session cookies
//! issued by the out-of-scope user service and arrive here unauthenticated.
//! The WebSocket control-plane upgrade authenticates with query parameters
//! before upgrading.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod router;
pub mod state;

pub use error::ApiError;
pub use router::{ApiServer, serve};
pub use state::{ApiState, HubHandlerImpl};
