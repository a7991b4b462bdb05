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

//! Torrent metainfo model and the resumable piece-hashing generator.
//!
//! The wire format is the standard bencoded BitTorrent v1 dictionary with
//! `announce`, `created by`, `creation date`, and `info` keys. The info dict
//! is strictly `{piece length, name, files}` in canonical key order, so the
//! info-hash of a parsed-then-reserialized descriptor is bit-identical to the
//! original. Multi-file layout only; one-file packages still get a `files`
//! list of length one.

pub mod error;
pub mod generator;
pub mod info_hash;
pub mod metainfo;

pub use error::{MetainfoError, MetainfoResult};
pub use generator::{
    CheckpointStore, GenerationOutcome, GenerationProgress, GenerationRequest, NullProgress,
    ProgressUpdate, TorrentGenerator,
};
pub use info_hash::InfoHash;
pub use metainfo::{FileEntry, Info, Metainfo, TorrentDescriptor};
