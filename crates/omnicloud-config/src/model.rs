//! Configuration model shared by both node roles.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::ConfigError;

/// Role a node assumes within the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Single canonical catalog and orchestrator instance.
    Hub,
    /// One of many storage sites scanning and exchanging content.
    Site,
}

impl NodeRole {
    /// Label used in logs and the nodes table.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hub => "hub",
            Self::Site => "site",
        }
    }
}

impl FromStr for NodeRole {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "hub" => Ok(Self::Hub),
            "site" => Ok(Self::Site),
            other => Err(ConfigError::InvalidValue {
                key: "OMNICLOUD_ROLE",
                value: other.to_string(),
                reason: "expected `hub` or `site`",
            }),
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Role this node runs as.
    pub role: NodeRole,
    /// Human-readable node name registered with the hub.
    pub node_name: String,
    /// Base URL of the hub API (required for sites; the hub uses its own bind).
    pub hub_url: Option<String>,
    /// Port for the HTTP API.
    pub api_port: u16,
    /// Port for the tracker announce endpoint (hub only).
    pub tracker_port: u16,
    /// Port for the relay bridge (hub only).
    pub relay_port: u16,
    /// Whether the relay server/client is enabled.
    pub relay_enabled: bool,
    /// Peer data port; zero binds an ephemeral port.
    pub torrent_data_port: u16,
    /// Shared registration key new sites must present.
    pub registration_key: String,
    /// Number of concurrent piece-hash workers.
    pub hash_workers: usize,
    /// Number of concurrent torrent generations.
    pub generation_workers: usize,
    /// Root directory where the ingest system keeps DCPs.
    pub library_root: PathBuf,
    /// Root directory for downloads, shadow XML, and the local catalog.
    pub torrent_root: PathBuf,
    /// Catalog database path; defaults to `<torrent_root>/catalog.db`.
    pub catalog_path: PathBuf,
    /// Host the tracker substitutes for loopback announcers, when set.
    pub advertise_host: Option<String>,
    /// Log level passed to the tracing subscriber.
    pub log_level: String,
    /// Log format label (`json` or `pretty`).
    pub log_format: String,
}

impl Config {
    /// Tracker announce URL derived from the hub configuration.
    #[must_use]
    pub fn announce_url(&self, tracker_host: &str) -> String {
        format!("http://{tracker_host}:{}/announce", self.tracker_port)
    }

    /// Directory that holds per-package shadow XML for co-seeding.
    #[must_use]
    pub fn shadow_root(&self) -> PathBuf {
        self.torrent_root.join("canonical-xml")
    }

    /// Directory the engine downloads assigned torrents into.
    #[must_use]
    pub fn download_root(&self) -> PathBuf {
        self.torrent_root.join("downloads")
    }
}
