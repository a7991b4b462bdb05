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

//! The torrent engine: swarm participation, disk I/O, and lifecycle
//! management for every torrent a node seeds or downloads.
//!
//! Each registered torrent runs its own task driving verification, peer
//! sessions, announces, and state transitions; the [`Engine`] owns the set,
//! exposes a non-blocking snapshot API, and runs the integrity watcher and
//! seed-health monitor. Storage may be split across two roots so dedup
//! co-seeders read XML from the hub-canonical shadow directory while media
//! bytes come from the ingest-owned library.

pub mod announce;
pub mod engine;
pub mod error;
pub mod peer;
pub mod storage;
pub mod torrent;
pub mod wire;

pub use announce::{AnnounceClient, AnnounceEvent, AnnounceOutcome, AnnounceRequest};
pub use engine::{
    DirectDialer, Engine, EngineConfig, EngineReporter, MemoryPieceCache, NullReporter,
    PeerDialer, PieceCache, TorrentSnapshot, generate_peer_id,
};
pub use error::{EngineError, EngineResult};
pub use storage::{ShadowRules, StorageBinding};
pub use torrent::TorrentParams;
