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

//! Core event bus for the OmniCloud platform.
//!
//! The bus provides a typed event enum, sequential identifiers, and support
//! for replaying recent events when subscribers attach late (the activity
//! reporter does this after a control-channel reconnect). Internally it uses
//! `tokio::broadcast` with a bounded buffer; when the channel overflows, the
//! oldest events are dropped, matching the desired backpressure behaviour.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::{Receiver, Sender};
use tracing::error;
use uuid::Uuid;

pub mod activity;

pub use activity::{ActivityAction, ActivityCategory, ActivityItem};

/// Identifier assigned to each event emitted by the platform.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Typed domain events surfaced across the node.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A torrent was registered with the engine.
    TorrentRegistered {
        /// Hex info-hash of the registered torrent.
        info_hash: String,
        /// Display name from the torrent metadata.
        name: String,
    },
    /// A torrent transitioned into a new lifecycle state.
    TorrentStateChanged {
        /// Hex info-hash of the torrent whose state changed.
        info_hash: String,
        /// Updated state snapshot.
        state: TorrentState,
    },
    /// Periodic transfer metrics for a registered torrent.
    TorrentProgress {
        /// Hex info-hash of the torrent being tracked.
        info_hash: String,
        /// Aggregate bytes downloaded so far.
        bytes_done: u64,
        /// Total bytes expected for the torrent payload.
        bytes_total: u64,
        /// Current download rate in bytes per second.
        download_bps: u64,
        /// Current upload rate in bytes per second.
        upload_bps: u64,
        /// Number of connected peers.
        peers: usize,
    },
    /// A download-bound torrent finished and verified its payload.
    TorrentCompleted {
        /// Hex info-hash of the completed torrent.
        info_hash: String,
        /// Absolute path to the downloaded payload root.
        download_path: String,
    },
    /// Piece hashing started for a package.
    GenerationStarted {
        /// Package being hashed.
        package_id: Uuid,
    },
    /// Piece hashing committed another piece.
    GenerationProgress {
        /// Package being hashed.
        package_id: Uuid,
        /// Completion percentage (0-100).
        percent: f64,
        /// Relative path of the file currently being read.
        current_file: String,
        /// Observed hashing throughput in bytes per second.
        speed_bps: u64,
    },
    /// Piece hashing completed and produced a torrent.
    GenerationCompleted {
        /// Package that was hashed.
        package_id: Uuid,
        /// Hex info-hash of the produced torrent.
        info_hash: String,
    },
    /// Piece hashing failed.
    GenerationFailed {
        /// Package that was being hashed.
        package_id: Uuid,
        /// Human-readable failure detail.
        message: String,
    },
    /// A transfer assignment changed status locally.
    TransferUpdated {
        /// Transfer identifier assigned by the hub.
        transfer_id: Uuid,
        /// Status label reported to the hub.
        status: String,
        /// Completion percentage (0-100).
        percent: f64,
    },
    /// The control channel to the hub connected or reconnected.
    ControlConnected {
        /// Hub endpoint the channel attached to.
        endpoint: String,
    },
    /// The control channel to the hub dropped.
    ControlDisconnected {
        /// Human-readable disconnect reason.
        reason: String,
    },
}

impl Event {
    /// Machine-friendly discriminator for downstream consumers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TorrentRegistered { .. } => "torrent_registered",
            Self::TorrentStateChanged { .. } => "torrent_state_changed",
            Self::TorrentProgress { .. } => "torrent_progress",
            Self::TorrentCompleted { .. } => "torrent_completed",
            Self::GenerationStarted { .. } => "generation_started",
            Self::GenerationProgress { .. } => "generation_progress",
            Self::GenerationCompleted { .. } => "generation_completed",
            Self::GenerationFailed { .. } => "generation_failed",
            Self::TransferUpdated { .. } => "transfer_updated",
            Self::ControlConnected { .. } => "control_connected",
            Self::ControlDisconnected { .. } => "control_disconnected",
        }
    }
}

/// High-level torrent states the engine reports.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TorrentState {
    /// Registered but not yet verified.
    Added,
    /// Verifying local payload against piece hashes.
    Verifying,
    /// Actively downloading payload data.
    Downloading,
    /// Download paused by operator command.
    Paused,
    /// Serving payload data to peers.
    Seeding,
    /// Download finished; transitioning to seeding.
    Completed,
    /// Unrecoverable error with a description.
    Error {
        /// Detail describing why the torrent failed.
        reason: String,
    },
}

/// Metadata wrapper around events. Each envelope tracks the event id and
/// emission timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Monotonic identifier assigned to the wrapped event.
    pub id: EventId,
    /// Timestamp recording when the envelope was produced.
    pub timestamp: DateTime<Utc>,
    /// Wrapped event payload.
    pub event: Event,
}

/// Shared event bus built on top of `tokio::broadcast`.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    buffer: Arc<Mutex<VecDeque<EventEnvelope>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
    replay_capacity: usize,
}

impl EventBus {
    /// Construct a new bus with the provided broadcast capacity.
    ///
    /// The broadcast channel uses the same capacity as the in-memory replay
    /// buffer, ensuring dropped events impact both structures consistently.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event bus capacity must be positive");
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            next_id: Arc::new(std::sync::atomic::AtomicU64::new(1)),
            replay_capacity: capacity,
        }
    }

    /// Construct a bus with the default in-memory buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish a new event to the bus, assigning it a sequential identifier.
    #[must_use]
    pub fn publish(&self, event: Event) -> EventId {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };

        {
            let mut buffer = self.lock_buffer();
            if buffer.len() == self.replay_capacity {
                buffer.pop_front();
            }
            buffer.push_back(envelope.clone());
        }

        let _ = self.sender.send(envelope);
        id
    }

    /// Subscribe to the bus, replaying any buffered events newer than `since_id`.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let mut backlog = VecDeque::new();
        if let Some(since) = since_id {
            let buffer = self.lock_buffer();
            for item in buffer.iter() {
                if item.id > since {
                    backlog.push_back(item.clone());
                }
            }
        }

        let receiver = self.sender.subscribe();
        EventStream { backlog, receiver }
    }

    /// Returns the last assigned identifier, if any events have been published.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        let buffer = self.lock_buffer();
        buffer.back().map(|event| event.id)
    }

    fn lock_buffer(&self) -> MutexGuard<'_, VecDeque<EventEnvelope>> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("event buffer mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream wrapper that yields events either from the replay backlog or from
/// the live broadcast channel.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
}

impl EventStream {
    /// Receive the next event, respecting the replay backlog first.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => self.receiver.recv().await.ok(),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_progress_event(id: usize) -> Event {
        Event::TorrentProgress {
            info_hash: format!("{id:040x}"),
            bytes_done: (id * 1_000) as u64,
            bytes_total: 500_000,
            download_bps: 0,
            upload_bps: 0,
            peers: 1,
        }
    }

    #[test]
    fn event_kinds_cover_all_variants() {
        let package_id = Uuid::new_v4();
        let events = [
            (
                Event::TorrentRegistered {
                    info_hash: "00".repeat(20),
                    name: "PkgA".to_string(),
                },
                "torrent_registered",
            ),
            (
                Event::TorrentStateChanged {
                    info_hash: "00".repeat(20),
                    state: TorrentState::Seeding,
                },
                "torrent_state_changed",
            ),
            (sample_progress_event(1), "torrent_progress"),
            (
                Event::TorrentCompleted {
                    info_hash: "00".repeat(20),
                    download_path: "/tor/PkgA".to_string(),
                },
                "torrent_completed",
            ),
            (Event::GenerationStarted { package_id }, "generation_started"),
            (
                Event::GenerationProgress {
                    package_id,
                    percent: 55.5,
                    current_file: "VIDEO.mxf".to_string(),
                    speed_bps: 1_000_000,
                },
                "generation_progress",
            ),
            (
                Event::GenerationCompleted {
                    package_id,
                    info_hash: "00".repeat(20),
                },
                "generation_completed",
            ),
            (
                Event::GenerationFailed {
                    package_id,
                    message: "read error".to_string(),
                },
                "generation_failed",
            ),
            (
                Event::TransferUpdated {
                    transfer_id: Uuid::new_v4(),
                    status: "downloading".to_string(),
                    percent: 40.0,
                },
                "transfer_updated",
            ),
            (
                Event::ControlConnected {
                    endpoint: "ws://hub/ws".to_string(),
                },
                "control_connected",
            ),
            (
                Event::ControlDisconnected {
                    reason: "read timeout".to_string(),
                },
                "control_disconnected",
            ),
        ];

        for (event, expected) in events {
            assert_eq!(event.kind(), expected);
        }
    }

    #[tokio::test]
    async fn sequential_ids_and_replay() {
        let bus = EventBus::with_capacity(16);

        let mut last_id = 0;
        for i in 0..5 {
            last_id = bus.publish(sample_progress_event(i));
        }
        assert_eq!(last_id, 5);

        let mut stream = bus.subscribe(Some(2));
        let mut received = Vec::new();
        for _ in 0..3 {
            if let Some(event) = stream.next().await {
                received.push(event);
            }
        }

        assert_eq!(received.len(), 3);
        assert_eq!(received.first().unwrap().id, 3);
        assert_eq!(received.last().unwrap().id, 5);
    }

    #[tokio::test]
    async fn last_event_id_reflects_recent_publish() {
        let bus = EventBus::with_capacity(2);
        assert!(bus.last_event_id().is_none(), "no events published yet");
        let published = bus.publish(sample_progress_event(0));
        assert_eq!(bus.last_event_id(), Some(published));
    }

    #[tokio::test]
    async fn stream_returns_none_after_sender_dropped() {
        let mut stream = {
            let bus = EventBus::with_capacity(1);
            let stream = bus.subscribe(None);
            drop(bus);
            stream
        };
        assert!(
            stream.next().await.is_none(),
            "closing the sender should end the stream"
        );
    }

    #[test]
    fn torrent_state_serializes_snake_case() {
        let json = serde_json::to_string(&TorrentState::Error {
            reason: "missing file".to_string(),
        })
        .unwrap();
        assert!(json.contains("error"));
        assert!(json.contains("missing file"));
    }
}
