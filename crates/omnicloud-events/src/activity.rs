//! Activity items carried on the control-plane activity stream.
//!
//! Sites assemble these from pluggable collectors each reporting tick; the
//! hub renders them as a live feed. Categories and actions are closed sets so
//! the hub can render and filter them without free-text matching.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of activity categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCategory {
    /// Engine download/seed activity.
    Torrent,
    /// Piece-hashing queue activity.
    Generation,
    /// Transfer assignment activity.
    Transfer,
    /// Library scan activity (reported by the scanner collaborator).
    Scanner,
    /// Node-level activity, including the idle marker.
    System,
}

/// Closed set of activity actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    /// Payload bytes are being downloaded.
    Downloading,
    /// Payload bytes are being served to peers.
    Seeding,
    /// Local payload is being verified against piece hashes.
    Verifying,
    /// Pieces are being hashed for torrent generation.
    Hashing,
    /// A library scan is in progress.
    Scanning,
    /// Nothing to report; the node is connected and idle.
    Idle,
    /// An error condition is being surfaced.
    Error,
}

/// One entry on the live activity stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityItem {
    /// Category the item belongs to.
    pub category: ActivityCategory,
    /// Action within the category.
    pub action: ActivityAction,
    /// Subject of the action (package title, info-hash, transfer id).
    pub subject: String,
    /// Optional human-readable detail line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Completion percentage when the action has measurable progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    /// Timestamp the item was observed.
    pub observed_at: DateTime<Utc>,
}

impl ActivityItem {
    /// Construct an item observed now.
    #[must_use]
    pub fn new(category: ActivityCategory, action: ActivityAction, subject: impl Into<String>) -> Self {
        Self {
            category,
            action,
            subject: subject.into(),
            detail: None,
            percent: None,
            observed_at: Utc::now(),
        }
    }

    /// Attach a detail line.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attach a progress percentage.
    #[must_use]
    pub fn with_percent(mut self, percent: f64) -> Self {
        self.percent = Some(percent);
        self
    }

    /// The idle marker sent when no collector emits anything.
    #[must_use]
    pub fn idle() -> Self {
        Self::new(ActivityCategory::System, ActivityAction::Idle, "node")
    }

    /// Key used to de-duplicate items within one reporting tick.
    #[must_use]
    pub fn dedup_key(&self) -> (ActivityCategory, ActivityAction, &str) {
        (self.category, self.action, self.subject.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_item_uses_system_category() {
        let item = ActivityItem::idle();
        assert_eq!(item.category, ActivityCategory::System);
        assert_eq!(item.action, ActivityAction::Idle);
    }

    #[test]
    fn dedup_key_ignores_detail_and_percent() {
        let a = ActivityItem::new(ActivityCategory::Torrent, ActivityAction::Seeding, "abc")
            .with_detail("3 peers");
        let b = ActivityItem::new(ActivityCategory::Torrent, ActivityAction::Seeding, "abc")
            .with_percent(100.0);
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn serialization_is_snake_case() {
        let item = ActivityItem::new(ActivityCategory::Generation, ActivityAction::Hashing, "PkgA");
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"generation\""));
        assert!(json.contains("\"hashing\""));
    }
}
