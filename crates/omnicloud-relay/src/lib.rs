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

//! NAT-traversal relay: a TCP bridge on the hub that lets NATted seeders
//! accept inbound peer sessions.
//!
//! The wire protocol is line-based ASCII, one `<COMMAND> <args>\n` message
//! per line. A seeder keeps one control connection registered under its
//! advertised address; a downloader asks the relay for a session to that
//! address, the relay instructs the seeder to dial in a data connection, and
//! once both halves are present it bridges them until either side closes
//! write.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::{RelayClient, RelayDialer, RelayListener};
pub use error::{RelayError, RelayResult};
pub use protocol::RelayCommand;
pub use server::{RelayServer, RelayServerConfig, RelayStats};
