//! Control-plane frame model.

use chrono::{DateTime, Utc};
use omnicloud_events::ActivityItem;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ControlError, ControlResult};

/// Bounded per-connection send buffer; overflow drops the connection.
pub const SEND_BUFFER_FRAMES: usize = 256;

/// Commands the hub may issue to a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Restart the node process.
    Restart,
    /// Self-upgrade to the hub's current binary.
    Upgrade,
    /// Re-scan the library.
    Rescan,
    /// Send a fresh status payload.
    StatusUpdate,
    /// Remove content for a package, optionally deleting data.
    DeleteContent,
}

impl CommandKind {
    /// Stable label used in the commands table.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Upgrade => "upgrade",
            Self::Rescan => "rescan",
            Self::StatusUpdate => "status_update",
            Self::DeleteContent => "delete_content",
        }
    }
}

/// Ad-hoc hub-to-site requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestAction {
    /// Ask the site for an immediate status frame.
    SendStatus,
}

/// Periodic site status carried on heartbeats.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Total storage capacity in bytes.
    pub storage_capacity_bytes: Option<i64>,
    /// Free storage in bytes.
    pub storage_free_bytes: Option<i64>,
    /// Software version.
    pub version: Option<String>,
    /// Number of packages in local inventory.
    pub package_count: Option<i64>,
    /// Public IP the site believes it has.
    pub public_ip: Option<String>,
    /// The site's own API URL.
    pub api_url: Option<String>,
}

/// Result of executing a command on the site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    /// Whether the command succeeded.
    pub success: bool,
    /// Human-readable result message.
    pub message: String,
    /// Optional machine-readable payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl CommandOutcome {
    /// A successful outcome with a message.
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            payload: None,
        }
    }

    /// A failed outcome with a message.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            payload: None,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Every frame either side may send. Unknown `type` tags fail to parse and
/// close the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Keepalive probe.
    Ping {
        /// Frame identifier.
        message_id: Uuid,
        /// Emission time.
        timestamp: DateTime<Utc>,
    },
    /// Keepalive reply.
    Pong {
        /// Frame identifier.
        message_id: Uuid,
        /// Emission time.
        timestamp: DateTime<Utc>,
    },
    /// Periodic site status (site to hub).
    Heartbeat {
        /// Frame identifier.
        message_id: Uuid,
        /// Emission time.
        timestamp: DateTime<Utc>,
        /// Status payload.
        payload: HeartbeatPayload,
    },
    /// Hub-to-site command; the response must echo `message_id`.
    Command {
        /// Correlation identifier the response must echo.
        message_id: Uuid,
        /// Emission time.
        timestamp: DateTime<Utc>,
        /// Command kind.
        kind: CommandKind,
        /// Command arguments.
        payload: serde_json::Value,
    },
    /// Site-to-hub command result, correlated via `message_id`.
    Response {
        /// The originating command's identifier.
        message_id: Uuid,
        /// This response's own identifier.
        response_id: Uuid,
        /// Emission time.
        timestamp: DateTime<Utc>,
        /// Whether the command succeeded.
        success: bool,
        /// Human-readable result message.
        message: String,
        /// Failure detail when unsuccessful.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Optional machine-readable payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    /// Ad-hoc hub-to-site RPC.
    Request {
        /// Correlation identifier the response must echo.
        message_id: Uuid,
        /// Emission time.
        timestamp: DateTime<Utc>,
        /// Requested action.
        action: RequestAction,
    },
    /// Live activity snapshot (site to hub).
    Activity {
        /// Frame identifier.
        message_id: Uuid,
        /// Emission time.
        timestamp: DateTime<Utc>,
        /// De-duplicated activity items for this tick.
        items: Vec<ActivityItem>,
    },
}

impl Frame {
    /// Encode as the JSON text carried over the socket.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> ControlResult<String> {
        serde_json::to_string(self).map_err(|source| ControlError::Frame {
            operation: "frame.encode",
            source,
        })
    }

    /// Decode a frame from JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON or unknown frame types.
    pub fn decode(raw: &str) -> ControlResult<Self> {
        serde_json::from_str(raw).map_err(|source| ControlError::Frame {
            operation: "frame.decode",
            source,
        })
    }

    /// A ping stamped now.
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        }
    }

    /// The pong answering `message_id`.
    #[must_use]
    pub fn pong(message_id: Uuid) -> Self {
        Self::Pong {
            message_id,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnicloud_events::{ActivityAction, ActivityCategory};

    #[test]
    fn frames_round_trip() {
        let frames = [
            Frame::ping(),
            Frame::pong(Uuid::new_v4()),
            Frame::Heartbeat {
                message_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                payload: HeartbeatPayload {
                    version: Some("0.1.0".to_string()),
                    package_count: Some(12),
                    ..HeartbeatPayload::default()
                },
            },
            Frame::Command {
                message_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                kind: CommandKind::DeleteContent,
                payload: serde_json::json!({"package_id": Uuid::new_v4()}),
            },
            Frame::Response {
                message_id: Uuid::new_v4(),
                response_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                success: true,
                message: "done".to_string(),
                error: None,
                payload: None,
            },
            Frame::Request {
                message_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                action: RequestAction::SendStatus,
            },
            Frame::Activity {
                message_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                items: vec![omnicloud_events::ActivityItem::new(
                    ActivityCategory::Torrent,
                    ActivityAction::Seeding,
                    "abc",
                )],
            },
        ];
        for frame in frames {
            let encoded = frame.encode().expect("encode");
            let decoded = Frame::decode(&encoded).expect("decode");
            assert_eq!(
                std::mem::discriminant(&frame),
                std::mem::discriminant(&decoded)
            );
        }
    }

    #[test]
    fn unknown_frame_type_is_a_protocol_error() {
        let raw = r#"{"type":"frobnicate","message_id":"00000000-0000-0000-0000-000000000000"}"#;
        assert!(Frame::decode(raw).is_err());
    }

    #[test]
    fn command_kind_labels_are_stable() {
        assert_eq!(CommandKind::Restart.as_str(), "restart");
        assert_eq!(CommandKind::DeleteContent.as_str(), "delete_content");
        let encoded = serde_json::to_string(&CommandKind::StatusUpdate).unwrap();
        assert_eq!(encoded, "\"status_update\"");
    }
}
