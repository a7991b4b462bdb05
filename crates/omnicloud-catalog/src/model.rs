//! Domain records and status enums persisted by the catalog.
//!
//! Every status enum round-trips through a snake_case label; unknown labels
//! read back from the store log a warning and map to the terminal/error
//! variant rather than panicking.

use chrono::{DateTime, Utc};
use omnicloud_metainfo::InfoHash;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// A node registered with the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node identifier.
    pub id: Uuid,
    /// Machine name presented at registration.
    pub name: String,
    /// Operator-facing display name.
    pub display_name: Option<String>,
    /// MAC address forming the second half of the identity key.
    pub mac: String,
    /// Publicly reachable endpoint, when known.
    pub public_endpoint: Option<String>,
    /// Last time the node was heard from.
    pub last_seen: Option<DateTime<Utc>>,
    /// Whether an operator has authorized the node.
    pub authorized: bool,
    /// Role label (`hub` or `site`).
    pub role: String,
    /// Software version last reported.
    pub version: Option<String>,
    /// Whether the NAT probe found the node unreachable.
    pub behind_nat: bool,
    /// Whether the node currently has a relay registration.
    pub relay_registered: bool,
}

/// A logical content item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageRecord {
    /// Package identifier.
    pub id: Uuid,
    /// Per-delivery fingerprint (ASSETMAP UUID); unique per row.
    pub outer_fp: String,
    /// Composition fingerprint (CPL UUID); canonical lookup key.
    pub inner_fp: String,
    /// Human-readable title.
    pub title: String,
    /// Content kind label (feature, trailer, ...).
    pub kind: String,
    /// Total payload size in bytes.
    pub size_bytes: i64,
    /// Number of payload files.
    pub file_count: i64,
    /// First discovery time.
    pub discovered_at: DateTime<Utc>,
    /// Last verification time, when any.
    pub last_verified: Option<DateTime<Utc>>,
}

/// Inventory entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryStatus {
    /// Payload present and indexed.
    Present,
    /// Payload being verified against the catalog.
    Verifying,
    /// The scan layer marked the payload gone.
    Gone,
}

impl InventoryStatus {
    /// Stable label stored in the catalog.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Verifying => "verifying",
            Self::Gone => "gone",
        }
    }

    /// Parse a stored label, mapping unknown labels to `Gone`.
    #[must_use]
    pub fn parse(label: &str) -> Self {
        match label {
            "present" => Self::Present,
            "verifying" => Self::Verifying,
            "gone" => Self::Gone,
            other => {
                warn!(status = %other, "unknown inventory status in catalog");
                Self::Gone
            }
        }
    }
}

/// One node's local copy of a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryEntry {
    /// Holding node.
    pub node_id: Uuid,
    /// Package held.
    pub package_id: Uuid,
    /// Absolute path of the payload on the node.
    pub local_path: String,
    /// Entry status.
    pub status: InventoryStatus,
    /// Last verification time, when any.
    pub last_verified: Option<DateTime<Utc>>,
}

/// A generated torrent for a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentRecord {
    /// Torrent identifier.
    pub id: Uuid,
    /// Package the torrent distributes.
    pub package_id: Uuid,
    /// 20-byte content identifier.
    pub info_hash: InfoHash,
    /// Piece size in bytes.
    pub piece_size: i64,
    /// Number of pieces.
    pub pieces_count: i64,
    /// Number of payload files.
    pub file_count: i64,
    /// Total payload bytes.
    pub total_bytes: i64,
    /// Full bencoded `.torrent` bytes.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub meta_bytes: Vec<u8>,
    /// Node that won the hash and generated the torrent.
    pub created_by_node: Uuid,
    /// Generation time.
    pub created_at: DateTime<Utc>,
}

/// Seeder row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeederStatus {
    /// Actively announcing and serving.
    Seeding,
    /// Finished a download and now seeding.
    Completed,
    /// Integrity failure removed the seeder from rotation.
    Error,
}

impl SeederStatus {
    /// Stable label stored in the catalog.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Seeding => "seeding",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Parse a stored label, mapping unknown labels to `Error`.
    #[must_use]
    pub fn parse(label: &str) -> Self {
        match label {
            "seeding" => Self::Seeding,
            "completed" => Self::Completed,
            "error" => Self::Error,
            other => {
                warn!(status = %other, "unknown seeder status in catalog");
                Self::Error
            }
        }
    }
}

/// One node seeding one torrent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeederRecord {
    /// Torrent being seeded.
    pub torrent_id: Uuid,
    /// Seeding node.
    pub node_id: Uuid,
    /// Local payload path on the node.
    pub local_path: String,
    /// Seeder status.
    pub status: SeederStatus,
    /// Bytes uploaded to peers so far.
    pub uploaded_bytes: i64,
    /// Last announce observed from the node.
    pub last_announce: Option<DateTime<Utc>>,
}

/// Hashing queue item status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for a generation worker.
    Queued,
    /// Pieces are being hashed.
    Generating,
    /// Generation finished and the torrent row exists.
    Completed,
    /// Generation failed; `error` holds the reason.
    Failed,
    /// An operator or the orchestrator cancelled the run.
    Cancelled,
}

impl QueueStatus {
    /// Stable label stored in the catalog.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a stored label, mapping unknown labels to `Failed`.
    #[must_use]
    pub fn parse(label: &str) -> Self {
        match label {
            "queued" => Self::Queued,
            "generating" => Self::Generating,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            other => {
                warn!(status = %other, "unknown queue status in catalog");
                Self::Failed
            }
        }
    }
}

/// One node's hashing work for one package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// Package being hashed.
    pub package_id: Uuid,
    /// Node doing the hashing.
    pub node_id: Uuid,
    /// Item status.
    pub status: QueueStatus,
    /// Completion percentage (0-100).
    pub progress_pct: f64,
    /// Relative path of the file currently being read.
    pub current_file: Option<String>,
    /// Total payload bytes.
    pub total_bytes: i64,
    /// Observed hashing throughput in bytes per second.
    pub speed_bps: i64,
    /// Last progress sync time; freshness signal for the claim sweep.
    pub synced_at: Option<DateTime<Utc>>,
    /// Run start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Run completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure reason, when failed.
    pub error: Option<String>,
    /// Who cancelled the run, when cancelled.
    pub cancelled_by: Option<String>,
}

/// Transfer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Created, waiting for the destination to pick it up.
    Queued,
    /// The destination is downloading.
    Downloading,
    /// Terminal: payload arrived and verified.
    Completed,
    /// Failed locally; may be re-queued by an operator.
    Failed,
    /// Terminal: cancelled by an operator.
    Cancelled,
    /// Paused by operator command.
    Paused,
}

impl TransferStatus {
    /// Stable label stored in the catalog.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        }
    }

    /// Parse a stored label, mapping unknown labels to `Failed`.
    #[must_use]
    pub fn parse(label: &str) -> Self {
        match label {
            "queued" => Self::Queued,
            "downloading" => Self::Downloading,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "paused" => Self::Paused,
            other => {
                warn!(status = %other, "unknown transfer status in catalog");
                Self::Failed
            }
        }
    }

    /// Whether a transfer in this status can move to `next`.
    ///
    /// Terminal states (`completed`, `cancelled`) admit no exits; `failed`
    /// may be re-queued for retry.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Downloading | Self::Cancelled)
                | (
                    Self::Downloading,
                    Self::Completed | Self::Failed | Self::Paused | Self::Cancelled
                )
                | (Self::Paused, Self::Downloading | Self::Cancelled)
                | (Self::Failed, Self::Queued)
        )
    }

    /// Whether this status admits no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Operator command pending on a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingCommand {
    /// No command pending.
    None,
    /// Cancel the transfer.
    Cancel,
    /// Pause the download.
    Pause,
    /// Resume a paused download.
    Resume,
}

impl PendingCommand {
    /// Stable label stored in the catalog; `None` stores as the empty string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Cancel => "cancel",
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }

    /// Parse a stored label, mapping unknown labels to `None`.
    #[must_use]
    pub fn parse(label: &str) -> Self {
        match label {
            "" => Self::None,
            "cancel" => Self::Cancel,
            "pause" => Self::Pause,
            "resume" => Self::Resume,
            other => {
                warn!(command = %other, "unknown pending command in catalog");
                Self::None
            }
        }
    }
}

/// A transfer assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Transfer identifier.
    pub id: Uuid,
    /// Torrent being transferred.
    pub torrent_id: Uuid,
    /// Preferred source node, when any.
    pub source_node: Option<Uuid>,
    /// Destination node.
    pub dest_node: Uuid,
    /// Transfer status.
    pub status: TransferStatus,
    /// Priority; lower integer means higher urgency.
    pub priority: i64,
    /// Completion percentage (0-100).
    pub progress_pct: f64,
    /// Bytes downloaded so far.
    pub bytes_done: i64,
    /// Download rate in bytes per second.
    pub dl_bps: i64,
    /// Upload rate in bytes per second.
    pub ul_bps: i64,
    /// Connected peer count.
    pub peers: i64,
    /// Estimated seconds remaining, when computable.
    pub eta_s: Option<i64>,
    /// Failure reason, when failed.
    pub error: Option<String>,
    /// Whether downloaded data should be deleted on cancel.
    pub delete_data: bool,
    /// Operator command awaiting site acknowledgement.
    pub pending_cmd: PendingCommand,
    /// Whether the site acknowledged the pending command.
    pub command_ack: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Download start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition time.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Inputs for creating a transfer row.
#[derive(Debug, Clone)]
pub struct NewTransfer {
    /// Torrent to transfer.
    pub torrent_id: Uuid,
    /// Preferred source node, when any.
    pub source_node: Option<Uuid>,
    /// Destination node.
    pub dest_node: Uuid,
    /// Priority in `[0, 9]`; lower means more urgent.
    pub priority: i64,
    /// Whether data should be deleted on cancel.
    pub delete_data: bool,
}

/// Per-field progress update applied to a transfer row.
///
/// Every field is optional so late or partial reports touch only what they
/// carry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferPatch {
    /// New status, validated against the transition table.
    pub status: Option<TransferStatus>,
    /// Completion percentage.
    pub progress_pct: Option<f64>,
    /// Bytes downloaded so far.
    pub bytes_done: Option<i64>,
    /// Download rate in bytes per second.
    pub dl_bps: Option<i64>,
    /// Upload rate in bytes per second.
    pub ul_bps: Option<i64>,
    /// Connected peer count.
    pub peers: Option<i64>,
    /// Estimated seconds remaining.
    pub eta_s: Option<i64>,
    /// Failure reason.
    pub error: Option<String>,
    /// Set when the site acknowledges the pending command.
    pub command_ack: Option<bool>,
}

/// One row of the append-only announce attempt log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceAttempt {
    /// Hex info-hash announced, as received.
    pub info_hash: String,
    /// Peer id, lossily decoded for display.
    pub peer_id: String,
    /// Resolved client IP.
    pub ip: String,
    /// Announced data port.
    pub port: u16,
    /// Announce event label.
    pub event: String,
    /// Outcome label (`ok` or `error`).
    pub status: String,
    /// Failure reason, when status is `error`.
    pub reason: Option<String>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

/// Ingestion pipeline status on a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    /// Download finished.
    Downloaded,
    /// Payload verified against piece hashes.
    Verified,
    /// Seeding switched to the ingested library copy.
    SeedingSwitched,
    /// Download-area copy removed.
    CleanupDone,
    /// The pipeline failed.
    Error,
}

impl IngestionStatus {
    /// Stable label stored in the catalog.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Downloaded => "downloaded",
            Self::Verified => "verified",
            Self::SeedingSwitched => "seeding_switched",
            Self::CleanupDone => "cleanup_done",
            Self::Error => "error",
        }
    }

    /// Parse a stored label, mapping unknown labels to `Error`.
    #[must_use]
    pub fn parse(label: &str) -> Self {
        match label {
            "downloaded" => Self::Downloaded,
            "verified" => Self::Verified,
            "seeding_switched" => Self::SeedingSwitched,
            "cleanup_done" => Self::CleanupDone,
            "error" => Self::Error,
            other => {
                warn!(status = %other, "unknown ingestion status in catalog");
                Self::Error
            }
        }
    }
}

/// Site-side record of a completed download's ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionRecord {
    /// Node that downloaded the payload.
    pub node_id: Uuid,
    /// Package downloaded.
    pub package_id: Uuid,
    /// Torrent the payload arrived through.
    pub info_hash: InfoHash,
    /// Where the download landed.
    pub download_path: String,
    /// Where ingest moved the payload, when it has.
    pub ingest_path: Option<String>,
    /// Pipeline status.
    pub status: IngestionStatus,
    /// Verification time.
    pub verified_at: Option<DateTime<Utc>>,
    /// Seeding-switch time.
    pub switched_at: Option<DateTime<Utc>>,
    /// Cleanup time.
    pub cleaned_at: Option<DateTime<Utc>>,
    /// Failure reason.
    pub error: Option<String>,
}

/// Hub-to-site command delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Created, not yet delivered.
    Pending,
    /// Handed to the site over either command path.
    Delivered,
    /// The site confirmed execution.
    Acknowledged,
    /// The site reported failure or the delivery timed out.
    Failed,
}

impl CommandStatus {
    /// Stable label stored in the catalog.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Acknowledged => "acknowledged",
            Self::Failed => "failed",
        }
    }

    /// Parse a stored label, mapping unknown labels to `Failed`.
    #[must_use]
    pub fn parse(label: &str) -> Self {
        match label {
            "pending" => Self::Pending,
            "delivered" => Self::Delivered,
            "acknowledged" => Self::Acknowledged,
            "failed" => Self::Failed,
            other => {
                warn!(status = %other, "unknown command status in catalog");
                Self::Failed
            }
        }
    }
}

/// A hub-to-site command record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Command identifier; doubles as the control-plane message id.
    pub id: Uuid,
    /// Target node.
    pub target_node: Uuid,
    /// Command kind label.
    pub kind: String,
    /// JSON payload delivered with the command.
    pub payload_json: serde_json::Value,
    /// Delivery status.
    pub status: CommandStatus,
    /// Result message from the site.
    pub result_msg: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Acknowledgement time.
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// Per-node settings shared with the scanner collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Node the settings belong to.
    pub node_id: Uuid,
    /// Site API URL reported over heartbeats.
    pub api_url: Option<String>,
    /// Reported storage capacity in bytes.
    pub storage_capacity_bytes: Option<i64>,
    /// Library locations the scanner watches, as JSON.
    pub library_locations: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_transitions_follow_the_table() {
        use TransferStatus::{Cancelled, Completed, Downloading, Failed, Paused, Queued};

        assert!(Queued.can_transition_to(Downloading));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(!Queued.can_transition_to(Completed));

        assert!(Downloading.can_transition_to(Completed));
        assert!(Downloading.can_transition_to(Failed));
        assert!(Downloading.can_transition_to(Paused));
        assert!(Downloading.can_transition_to(Cancelled));
        assert!(!Downloading.can_transition_to(Queued));

        assert!(Paused.can_transition_to(Downloading));
        assert!(Paused.can_transition_to(Cancelled));
        assert!(!Paused.can_transition_to(Completed));

        assert!(Failed.can_transition_to(Queued));
        assert!(!Failed.can_transition_to(Downloading));

        for next in [Queued, Downloading, Completed, Failed, Cancelled, Paused] {
            assert!(!Completed.can_transition_to(next), "completed is terminal");
            assert!(!Cancelled.can_transition_to(next), "cancelled is terminal");
        }
    }

    #[test]
    fn status_labels_round_trip() {
        for status in [
            TransferStatus::Queued,
            TransferStatus::Downloading,
            TransferStatus::Completed,
            TransferStatus::Failed,
            TransferStatus::Cancelled,
            TransferStatus::Paused,
        ] {
            assert_eq!(TransferStatus::parse(status.as_str()), status);
        }
        for status in [
            QueueStatus::Queued,
            QueueStatus::Generating,
            QueueStatus::Completed,
            QueueStatus::Failed,
            QueueStatus::Cancelled,
        ] {
            assert_eq!(QueueStatus::parse(status.as_str()), status);
        }
        for status in [
            SeederStatus::Seeding,
            SeederStatus::Completed,
            SeederStatus::Error,
        ] {
            assert_eq!(SeederStatus::parse(status.as_str()), status);
        }
        for status in [
            IngestionStatus::Downloaded,
            IngestionStatus::Verified,
            IngestionStatus::SeedingSwitched,
            IngestionStatus::CleanupDone,
            IngestionStatus::Error,
        ] {
            assert_eq!(IngestionStatus::parse(status.as_str()), status);
        }
        for command in [
            PendingCommand::None,
            PendingCommand::Cancel,
            PendingCommand::Pause,
            PendingCommand::Resume,
        ] {
            assert_eq!(PendingCommand::parse(command.as_str()), command);
        }
    }

    #[test]
    fn unknown_labels_map_to_safe_variants() {
        assert_eq!(TransferStatus::parse("bogus"), TransferStatus::Failed);
        assert_eq!(QueueStatus::parse("bogus"), QueueStatus::Failed);
        assert_eq!(InventoryStatus::parse("bogus"), InventoryStatus::Gone);
        assert_eq!(PendingCommand::parse("bogus"), PendingCommand::None);
    }
}
