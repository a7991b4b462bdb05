//! Capability adapters wiring the engine, generator, and tracker seams to
//! the catalog and the hub API.

use async_trait::async_trait;
use chrono::Utc;
use omnicloud_api_models::TransferProgressRequest;
use omnicloud_catalog::{AnnounceAttempt, CatalogStore};
use omnicloud_events::{Event, EventBus};
use omnicloud_metainfo::{GenerationProgress, InfoHash, ProgressUpdate};
use omnicloud_torrent::{EngineReporter, PieceCache};
use omnicloud_tracker::{AnnounceLog, AnnounceRecord};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::hub_client::HubClient;

/// Piece-completion cache backed by the node's local catalog.
pub struct CatalogPieceCache {
    catalog: CatalogStore,
}

impl CatalogPieceCache {
    /// Construct over the local catalog.
    #[must_use]
    pub const fn new(catalog: CatalogStore) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl PieceCache for CatalogPieceCache {
    async fn load(&self, info_hash: InfoHash) -> anyhow::Result<Vec<(u32, bool)>> {
        Ok(self.catalog.piece_completion_map(&info_hash).await?)
    }

    async fn set(
        &self,
        info_hash: InfoHash,
        piece_index: u32,
        completed: bool,
    ) -> anyhow::Result<()> {
        Ok(self
            .catalog
            .set_piece_complete(&info_hash, piece_index, completed)
            .await?)
    }

    async fn clear(&self, info_hash: InfoHash) -> anyhow::Result<()> {
        Ok(self.catalog.clear_piece_records(&info_hash).await?)
    }
}

/// Announce attempt log backed by the hub catalog; used by the tracker.
pub struct CatalogAnnounceLog {
    catalog: CatalogStore,
}

impl CatalogAnnounceLog {
    /// Construct over the hub catalog.
    #[must_use]
    pub const fn new(catalog: CatalogStore) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl AnnounceLog for CatalogAnnounceLog {
    async fn record(&self, record: AnnounceRecord) -> anyhow::Result<()> {
        self.catalog
            .record_announce_attempt(&AnnounceAttempt {
                info_hash: record.info_hash,
                peer_id: record.peer_id,
                ip: record.ip,
                port: record.port,
                event: record.event,
                status: record.status,
                reason: record.reason,
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

/// Download lifecycle notifications the transfer runner consumes.
#[derive(Debug)]
pub enum TransferSignal {
    /// A download completed and verified.
    Completed {
        /// The finished torrent.
        info_hash: InfoHash,
        /// The transfer it was registered for.
        transfer_id: Uuid,
    },
}

/// Engine reporter for a site: failures reach the hub through the mandatory
/// transfer-error path; completions wake the transfer runner.
pub struct SiteEngineReporter {
    hub: HubClient,
    events: EventBus,
    signals: mpsc::Sender<TransferSignal>,
}

impl SiteEngineReporter {
    /// Construct with the hub client and the runner's signal channel.
    #[must_use]
    pub fn new(hub: HubClient, events: EventBus, signals: mpsc::Sender<TransferSignal>) -> Self {
        Self {
            hub,
            events,
            signals,
        }
    }
}

#[async_trait]
impl EngineReporter for SiteEngineReporter {
    async fn announce_ok(&self, info_hash: InfoHash, event: &str, complete: u64, incomplete: u64) {
        debug!(
            info_hash = %info_hash,
            event,
            complete,
            incomplete,
            "announce accepted"
        );
    }

    async fn announce_failed(&self, info_hash: InfoHash, event: &str, reason: &str) {
        debug!(info_hash = %info_hash, event, reason, "announce failed");
    }

    async fn transfer_error(&self, transfer_id: Uuid, message: &str) -> anyhow::Result<()> {
        self.hub
            .report_progress(
                transfer_id,
                &TransferProgressRequest {
                    status: Some("failed".to_string()),
                    error: Some(message.to_string()),
                    ..TransferProgressRequest::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn download_completed(&self, info_hash: InfoHash, transfer_id: Option<Uuid>) {
        let _ = self.events.publish(Event::TorrentCompleted {
            info_hash: info_hash.to_hex(),
            download_path: String::new(),
        });
        if let Some(transfer_id) = transfer_id {
            if self
                .signals
                .send(TransferSignal::Completed {
                    info_hash,
                    transfer_id,
                })
                .await
                .is_err()
            {
                warn!(transfer_id = %transfer_id, "transfer runner gone; completion unsignalled");
            }
        }
    }

    async fn integrity_failed(&self, info_hash: InfoHash, reason: &str) {
        warn!(info_hash = %info_hash, reason, "seeding torrent failed integrity checks");
    }
}

/// Generation progress sink: refreshes the local queue row (which protects
/// the hash claim) and publishes progress events. Writes are throttled to
/// once per second.
pub struct QueueProgressSink {
    catalog: CatalogStore,
    events: EventBus,
    node_id: Uuid,
    last_write: std::sync::Mutex<std::time::Instant>,
}

impl QueueProgressSink {
    /// Construct for one node's generation runs.
    #[must_use]
    pub fn new(catalog: CatalogStore, events: EventBus, node_id: Uuid) -> Self {
        Self {
            catalog,
            events,
            node_id,
            last_write: std::sync::Mutex::new(
                std::time::Instant::now() - std::time::Duration::from_secs(60),
            ),
        }
    }

    fn should_write(&self) -> bool {
        let mut last = self
            .last_write
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if last.elapsed() >= std::time::Duration::from_secs(1) {
            *last = std::time::Instant::now();
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl GenerationProgress for QueueProgressSink {
    async fn on_piece(&self, update: ProgressUpdate) {
        let _ = self.events.publish(Event::GenerationProgress {
            package_id: update.package_id,
            percent: update.percent,
            current_file: update.current_file.clone(),
            speed_bps: update.speed_bps,
        });
        let final_piece = update.piece_index + 1 == update.pieces_count;
        if !final_piece && !self.should_write() {
            return;
        }
        if let Err(err) = self
            .catalog
            .update_queue_progress(
                update.package_id,
                self.node_id,
                update.percent,
                &update.current_file,
                i64::try_from(update.speed_bps).unwrap_or(i64::MAX),
            )
            .await
        {
            warn!(package_id = %update.package_id, error = %err, "queue progress write failed");
        }
    }
}
