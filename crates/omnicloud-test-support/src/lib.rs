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
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

//! Shared test helpers used across integration suites.

pub mod fixtures;

/// Networking helpers for tests that need real sockets.
pub mod net {
    use std::net::SocketAddr;

    /// Bind an ephemeral loopback port and return its address; the listener
    /// is dropped, so the port is very likely still free for the caller.
    ///
    /// # Panics
    ///
    /// Panics if no loopback port can be bound.
    #[must_use]
    pub fn free_port() -> SocketAddr {
        let listener =
            std::net::TcpListener::bind("127.0.0.1:0").expect("loopback bind for port probe");
        listener.local_addr().expect("probe address")
    }
}
