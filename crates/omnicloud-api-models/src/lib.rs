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

//! Request and response models for the hub HTTP API, shared by the axum
//! handlers and the site-side client so both ends agree on the wire shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `GET /health` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall status label.
    pub status: String,
    /// Whether the catalog answered the liveness ping.
    pub catalog_ok: bool,
    /// Software version.
    pub version: String,
}

/// `POST /servers/register` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Machine name.
    pub name: String,
    /// MAC address forming the identity key with the assigned id.
    pub mac: String,
    /// Shared registration key; must match the hub's configured key.
    pub registration_key: String,
    /// Role label (`site` unless the hub registers itself).
    #[serde(default)]
    pub role: Option<String>,
    /// Software version.
    #[serde(default)]
    pub version: Option<String>,
    /// Publicly reachable endpoint, when known.
    #[serde(default)]
    pub public_endpoint: Option<String>,
}

/// A node as exposed over the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    /// Node identifier.
    pub id: Uuid,
    /// Machine name.
    pub name: String,
    /// Operator-facing display name.
    pub display_name: Option<String>,
    /// Role label.
    pub role: String,
    /// Whether an operator has authorized the node.
    pub authorized: bool,
    /// Last time the node was heard from.
    pub last_seen: Option<DateTime<Utc>>,
    /// Software version last reported.
    pub version: Option<String>,
    /// Whether the NAT probe found the node unreachable.
    pub behind_nat: bool,
    /// Whether the node currently holds a relay registration.
    pub relay_registered: bool,
}

/// `POST /servers/register` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// The registered (or refreshed) node.
    pub node: NodeView,
}

/// `POST /servers/{id}/heartbeat` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Software version.
    #[serde(default)]
    pub version: Option<String>,
    /// Publicly reachable endpoint.
    #[serde(default)]
    pub public_endpoint: Option<String>,
}

/// Generic acknowledgement body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    /// Whether the operation succeeded.
    pub ok: bool,
}

/// A torrent row as exposed over the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentView {
    /// Torrent identifier.
    pub id: Uuid,
    /// Package the torrent distributes.
    pub package_id: Uuid,
    /// Hex info-hash.
    pub info_hash: String,
    /// Piece size in bytes.
    pub piece_size: i64,
    /// Number of pieces.
    pub pieces_count: i64,
    /// Number of payload files.
    pub file_count: i64,
    /// Total payload bytes.
    pub total_bytes: i64,
    /// Node that generated the torrent.
    pub created_by_node: Uuid,
    /// Generation time.
    pub created_at: DateTime<Utc>,
}

/// A transfer as exposed over the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferView {
    /// Transfer identifier.
    pub id: Uuid,
    /// Torrent being transferred.
    pub torrent_id: Uuid,
    /// Hex info-hash of the torrent.
    pub info_hash: String,
    /// Destination node.
    pub dest_node: Uuid,
    /// Status label.
    pub status: String,
    /// Priority; lower integer means higher urgency.
    pub priority: i64,
    /// Completion percentage.
    pub progress_pct: f64,
    /// Bytes downloaded.
    pub bytes_done: i64,
    /// Download rate in bytes per second.
    pub dl_bps: i64,
    /// Upload rate in bytes per second.
    pub ul_bps: i64,
    /// Connected peers.
    pub peers: i64,
    /// Estimated seconds remaining.
    pub eta_s: Option<i64>,
    /// Failure reason.
    pub error: Option<String>,
    /// Whether data is deleted on cancel.
    pub delete_data: bool,
    /// Pending operator command label (empty when none).
    pub pending_cmd: String,
    /// Whether the site acknowledged the pending command.
    pub command_ack: bool,
}

/// `POST /transfers` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferCreateRequest {
    /// Torrent to transfer.
    pub torrent_id: Uuid,
    /// Destination node.
    pub dest_node: Uuid,
    /// Preferred source node.
    #[serde(default)]
    pub source_node: Option<Uuid>,
    /// Priority in `[0, 9]`; defaults to 5.
    #[serde(default = "default_priority")]
    pub priority: i64,
    /// Whether data is deleted on cancel.
    #[serde(default)]
    pub delete_data: bool,
}

const fn default_priority() -> i64 {
    5
}

/// `PUT /transfers/{id}` progress report; every field optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferProgressRequest {
    /// New status label.
    #[serde(default)]
    pub status: Option<String>,
    /// Completion percentage.
    #[serde(default)]
    pub progress_pct: Option<f64>,
    /// Bytes downloaded.
    #[serde(default)]
    pub bytes_done: Option<i64>,
    /// Download rate in bytes per second.
    #[serde(default)]
    pub dl_bps: Option<i64>,
    /// Upload rate in bytes per second.
    #[serde(default)]
    pub ul_bps: Option<i64>,
    /// Connected peers.
    #[serde(default)]
    pub peers: Option<i64>,
    /// Estimated seconds remaining.
    #[serde(default)]
    pub eta_s: Option<i64>,
    /// Failure reason.
    #[serde(default)]
    pub error: Option<String>,
    /// Set when the site acknowledges the pending command.
    #[serde(default)]
    pub command_ack: Option<bool>,
    /// Landing path of the payload, carried with the completion report so
    /// the hub can write the destination's inventory row.
    #[serde(default)]
    pub local_path: Option<String>,
}

/// One inventory item in the batched upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryItem {
    /// Per-delivery fingerprint.
    pub outer_fp: String,
    /// Composition fingerprint.
    pub inner_fp: String,
    /// Human-readable title.
    pub title: String,
    /// Content kind label.
    pub kind: String,
    /// Total payload bytes.
    pub size_bytes: i64,
    /// Number of payload files.
    pub file_count: i64,
    /// Absolute path on the reporting node.
    pub local_path: String,
}

/// `POST /servers/{id}/inventory` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryUploadRequest {
    /// Items discovered by the scan.
    pub items: Vec<InventoryItem>,
}

/// Per-item resolution in the inventory upload response. The dedup fields
/// tell the site whether its delivery attached to a canonical package
/// discovered elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryResolution {
    /// The delivery fingerprint this resolution answers.
    pub outer_fp: String,
    /// Package the inventory row now points at.
    pub package_id: Uuid,
    /// True when the item deduplicated onto a canonical package with a
    /// different delivery fingerprint.
    pub duplicate_of_canonical: bool,
    /// The canonical torrent, when one exists.
    pub torrent: Option<TorrentView>,
}

/// `POST /servers/{id}/inventory` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryUploadResponse {
    /// One resolution per uploaded item, in request order.
    pub resolutions: Vec<InventoryResolution>,
}

/// One queue item in the batched status upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItemUpload {
    /// Package being hashed.
    pub package_id: Uuid,
    /// Status label.
    pub status: String,
    /// Completion percentage.
    pub progress_pct: f64,
    /// File currently being read.
    #[serde(default)]
    pub current_file: Option<String>,
    /// Total payload bytes.
    pub total_bytes: i64,
    /// Hashing throughput in bytes per second.
    pub speed_bps: i64,
    /// Failure reason.
    #[serde(default)]
    pub error: Option<String>,
}

/// One engine torrent in the batched status upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineTorrentUpload {
    /// Hex info-hash.
    pub info_hash: String,
    /// Engine state label.
    pub state: String,
    /// Bytes verified or downloaded.
    pub bytes_done: i64,
    /// Total payload bytes.
    pub bytes_total: i64,
    /// Bytes served to peers.
    pub uploaded: i64,
    /// Connected peers.
    pub peers: i64,
    /// Local payload path.
    #[serde(default)]
    pub local_path: Option<String>,
}

/// `POST /servers/{id}/torrent-status` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TorrentStatusUpload {
    /// Queue items with fresh progress.
    #[serde(default)]
    pub queue: Vec<QueueItemUpload>,
    /// Engine torrent snapshots.
    #[serde(default)]
    pub torrents: Vec<EngineTorrentUpload>,
}

/// `POST /torrents` request: a generation winner commits its descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentCommitRequest {
    /// Package the torrent distributes.
    pub package_id: Uuid,
    /// Hex info-hash.
    pub info_hash: String,
    /// Piece size in bytes.
    pub piece_size: i64,
    /// Number of pieces.
    pub pieces_count: i64,
    /// Number of payload files.
    pub file_count: i64,
    /// Total payload bytes.
    pub total_bytes: i64,
    /// Base64-encoded `.torrent` bytes.
    pub meta_b64: String,
    /// Local payload path on the generating node, recorded as its seeder
    /// row.
    pub local_path: String,
}

/// `GET /torrent-queue/check` response: the hash orchestrator's decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueCheckResponse {
    /// The package already has a torrent.
    pub torrent_exists: bool,
    /// The requester holds the claim and should hash.
    pub should_hash: bool,
    /// Node currently holding the claim, when denied.
    #[serde(default)]
    pub holder: Option<Uuid>,
}

/// `POST /torrents/{info_hash}/seeders` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeederRegisterRequest {
    /// Local payload path on the seeding node.
    pub local_path: String,
    /// Status label.
    pub status: String,
    /// Bytes uploaded to peers so far.
    #[serde(default)]
    pub uploaded_bytes: i64,
}

/// One row of the announce attempt log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceAttemptView {
    /// Hex info-hash as received.
    pub info_hash: String,
    /// Peer id, lossily decoded.
    pub peer_id: String,
    /// Resolved client IP.
    pub ip: String,
    /// Announced port.
    pub port: u16,
    /// Event label.
    pub event: String,
    /// `ok` or `error`.
    pub status: String,
    /// Failure reason.
    pub reason: Option<String>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

/// `GET /servers/{id}/pending-action` response (legacy command poll).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingActionResponse {
    /// The oldest pending command, when any.
    pub command: Option<CommandView>,
}

/// A hub-to-site command on the legacy poll path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandView {
    /// Command identifier to acknowledge with.
    pub id: Uuid,
    /// Command kind label.
    pub kind: String,
    /// Command arguments.
    pub payload: serde_json::Value,
}

/// `POST /servers/{id}/action-done` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDoneRequest {
    /// The command being acknowledged.
    pub command_id: Uuid,
    /// Whether execution succeeded.
    pub success: bool,
    /// Result message.
    #[serde(default)]
    pub message: Option<String>,
}

/// `GET /servers/{id}/nat-check` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatCheckResponse {
    /// Whether the dial-back connected.
    pub reachable: bool,
    /// The IP the hub observed the request from.
    pub external_ip: String,
}

/// Node settings shared with the scanner collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsView {
    /// The site's own API URL.
    #[serde(default)]
    pub api_url: Option<String>,
    /// Reported storage capacity in bytes.
    #[serde(default)]
    pub storage_capacity_bytes: Option<i64>,
    /// Library locations the scanner watches.
    #[serde(default)]
    pub library_locations: Vec<LibraryLocation>,
}

/// One watched library location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryLocation {
    /// Location identifier.
    pub id: Uuid,
    /// Absolute path on the node.
    pub path: String,
    /// Whether the filesystem watcher covers it.
    pub watch: bool,
}

/// `POST .../library-locations` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryLocationCreate {
    /// Absolute path on the node.
    pub path: String,
    /// Whether the filesystem watcher covers it.
    #[serde(default)]
    pub watch: bool,
}

/// One canonical XML file in the dedup payload exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalXmlFile {
    /// Path relative to the package directory.
    pub rel_path: String,
    /// Base64-encoded file content.
    pub content_b64: String,
}

/// `POST /packages/{id}/canonical-xml` request and `GET` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalXmlPayload {
    /// The package's XML files.
    pub files: Vec<CanonicalXmlFile>,
}

/// Package detail with holders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageView {
    /// Package identifier.
    pub id: Uuid,
    /// Per-delivery fingerprint.
    pub outer_fp: String,
    /// Composition fingerprint.
    pub inner_fp: String,
    /// Human-readable title.
    pub title: String,
    /// Content kind label.
    pub kind: String,
    /// Total payload bytes.
    pub size_bytes: i64,
    /// Number of payload files.
    pub file_count: i64,
    /// First discovery time.
    pub discovered_at: DateTime<Utc>,
    /// Nodes currently holding the payload.
    #[serde(default)]
    pub holders: Vec<Uuid>,
}

/// RFC9457-style problem body returned on errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    /// Stable error kind label.
    pub kind: String,
    /// Short human-readable title.
    pub title: String,
    /// HTTP status code.
    pub status: u16,
    /// Optional detail line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_create_defaults_apply() {
        let raw = format!(
            r#"{{"torrent_id":"{}","dest_node":"{}"}}"#,
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        let parsed: TransferCreateRequest = serde_json::from_str(&raw).expect("parse");
        assert_eq!(parsed.priority, 5);
        assert!(!parsed.delete_data);
        assert!(parsed.source_node.is_none());
    }

    #[test]
    fn progress_request_accepts_partial_bodies() {
        let parsed: TransferProgressRequest =
            serde_json::from_str(r#"{"progress_pct": 40.0}"#).expect("parse");
        assert!(parsed.status.is_none());
        assert!((parsed.progress_pct.unwrap() - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn queue_check_round_trips() {
        let response = QueueCheckResponse {
            torrent_exists: false,
            should_hash: true,
            holder: None,
        };
        let text = serde_json::to_string(&response).expect("serialize");
        let back: QueueCheckResponse = serde_json::from_str(&text).expect("parse");
        assert!(back.should_hash);
        assert!(!back.torrent_exists);
    }
}
