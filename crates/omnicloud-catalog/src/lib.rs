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

//! Transactional persistence for every OmniCloud catalog entity.
//!
//! The hub's catalog is the canonical record of packages, torrents, nodes,
//! transfers, claims, and the announce log; sites run the same store against
//! a local file for checkpointed hashing, the piece-completion cache, and
//! ingestion tracking. All in-memory caches elsewhere in the system must be
//! reconstructable from this store plus local disk.

pub mod claims;
pub mod error;
pub mod model;
pub mod nodes;
pub mod packages;
pub mod store;
pub mod swarm;
pub mod transfers;

pub use claims::ClaimDecision;
pub use error::{CatalogError, CatalogResult};
pub use model::{
    AnnounceAttempt, CommandRecord, CommandStatus, IngestionRecord, IngestionStatus,
    InventoryEntry, InventoryStatus, NewTransfer, NodeRecord, NodeSettings, PackageRecord,
    PendingCommand, QueueItem, QueueStatus, SeederRecord, SeederStatus, TorrentRecord,
    TransferPatch, TransferRecord, TransferStatus,
};
pub use store::CatalogStore;
