//! Default values applied when optional keys are absent.

/// Default HTTP API port.
pub const API_PORT: u16 = 8080;

/// Default tracker announce port (hub only).
pub const TRACKER_PORT: u16 = 6969;

/// Default relay bridge port (hub only).
pub const RELAY_PORT: u16 = 7070;

/// Default peer data port; zero asks the engine to bind an ephemeral port.
pub const TORRENT_DATA_PORT: u16 = 0;

/// Default number of concurrent piece-hash workers.
pub const HASH_WORKERS: usize = 4;

/// Default number of concurrent torrent generations.
pub const GENERATION_WORKERS: usize = 2;

/// Default piece size for generated torrents (256 KiB).
pub const PIECE_SIZE: u32 = 256 * 1024;

/// Default catalog file name under the torrent root.
pub const CATALOG_FILE: &str = "catalog.db";
