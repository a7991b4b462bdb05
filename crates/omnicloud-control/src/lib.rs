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

//! The site/hub control plane.
//!
//! A persistent duplex channel per authorized site carries keepalives,
//! heartbeats, commands with correlated responses, ad-hoc requests, and a
//! live activity stream. Frames are JSON objects tagged by `type`; unknown
//! tags are protocol errors, never silently passed through. Transport
//! framing (WebSocket upgrade and socket glue) lives with the API server;
//! this crate owns the registry, correlation, and the site loop.

pub mod error;
pub mod frames;
pub mod hub;
pub mod nat;
pub mod site;

pub use error::{ControlError, ControlResult};
pub use frames::{
    CommandKind, CommandOutcome, Frame, HeartbeatPayload, RequestAction, SEND_BUFFER_FRAMES,
};
pub use hub::{ControlConnection, ControlHub, HubHandler};
pub use nat::probe_nat;
pub use site::{
    ActivityCollector, ControlClient, ControlClientConfig, HeartbeatSource, SiteCommandHandler,
};
