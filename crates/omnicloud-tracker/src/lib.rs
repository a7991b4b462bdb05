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

//! The private tracker: an HTTP `GET /announce` endpoint maintaining
//! in-memory swarm state with compact peer replies.
//!
//! Policy: no authentication on announce: trust-by-network. The hub never
//! publishes the tracker URL externally; that is the only deterrent against
//! off-network leechers.

pub mod announce;
pub mod swarm;

pub use announce::{AnnounceLog, AnnounceRecord, NullAnnounceLog, router, serve};
pub use swarm::{SwarmSnapshot, Tracker, TrackerConfig};
