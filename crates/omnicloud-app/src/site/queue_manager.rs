//! The index cycle: inventory upload, dedup dispatch, seeding bootstrap,
//! and single-writer torrent generation.

use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use omnicloud_api_models::{
    EngineTorrentUpload, InventoryItem, InventoryResolution, InventoryUploadRequest,
    QueueItemUpload, TorrentCommitRequest, TorrentStatusUpload,
};
use omnicloud_catalog::QueueStatus;
use omnicloud_events::{Event, TorrentState};
use omnicloud_metainfo::{GenerationRequest, Metainfo, TorrentGenerator};
use omnicloud_torrent::{StorageBinding, TorrentParams};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::reporters::QueueProgressSink;
use crate::site::{InventorySource, LocalPackage, SiteContext, dedup};

/// One full index cycle: scan, upload, resolve, seed, hash, report.
pub(crate) async fn run_index_cycle(
    context: &Arc<SiteContext>,
    inventory: &dyn InventorySource,
    cancel: &CancellationToken,
) -> Result<()> {
    let packages = inventory.scan().await.context("inventory scan failed")?;
    context.package_count.store(
        i64::try_from(packages.len()).unwrap_or(i64::MAX),
        std::sync::atomic::Ordering::Relaxed,
    );
    if packages.is_empty() {
        upload_status(context).await?;
        return Ok(());
    }

    let upload = InventoryUploadRequest {
        items: packages
            .iter()
            .map(|package| InventoryItem {
                outer_fp: package.outer_fp.clone(),
                inner_fp: package.inner_fp.clone(),
                title: package.title.clone(),
                kind: package.kind.clone(),
                size_bytes: package.size_bytes,
                file_count: package.file_count,
                local_path: package.local_path.display().to_string(),
            })
            .collect(),
    };
    let resolutions = context
        .hub
        .upload_inventory(&context.identity, &upload)
        .await
        .context("inventory upload failed")?
        .resolutions;

    let generation_slots = Arc::new(Semaphore::new(context.config.generation_workers));
    for (package, resolution) in packages.iter().zip(resolutions.iter()) {
        if cancel.is_cancelled() {
            break;
        }
        if let Err(err) =
            process_resolution(context, package, resolution, &generation_slots, cancel).await
        {
            warn!(
                outer_fp = %package.outer_fp,
                error = %err,
                "package processing failed; will retry next cycle"
            );
        }
    }

    upload_status(context).await?;
    Ok(())
}

async fn process_resolution(
    context: &Arc<SiteContext>,
    package: &LocalPackage,
    resolution: &InventoryResolution,
    generation_slots: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<()> {
    match (&resolution.torrent, resolution.duplicate_of_canonical) {
        // Canonical copy with an existing torrent: make sure we seed it and
        // the hub holds the composition XML for future co-seeders.
        (Some(torrent), false) => {
            ensure_seeding(context, package, &torrent.info_hash).await?;
            ensure_canonical_xml(context, package, resolution).await;
        }
        // Duplicate delivery: co-seed through the shadow directory.
        (Some(torrent), true) => {
            dedup::co_seed(context, package, resolution.package_id, &torrent.info_hash).await?;
        }
        // Duplicate without a canonical torrent yet: nothing to do until the
        // canonical holder finishes hashing.
        (None, true) => {
            debug!(outer_fp = %package.outer_fp, "awaiting canonical torrent for co-seed");
        }
        // No torrent anywhere: ask the orchestrator whether we hash.
        (None, false) => {
            maybe_generate(context, package, resolution, generation_slots, cancel).await?;
        }
    }
    Ok(())
}

/// Register a torrent for seeding from the library path, once.
async fn ensure_seeding(
    context: &Arc<SiteContext>,
    package: &LocalPackage,
    info_hash_hex: &str,
) -> Result<()> {
    let already = context
        .engine
        .snapshot()
        .iter()
        .any(|torrent| torrent.info_hash.to_hex() == info_hash_hex);
    if already {
        return Ok(());
    }
    let meta_bytes = context
        .hub
        .torrent_file(info_hash_hex)
        .await
        .context("torrent file fetch failed")?;
    context
        .engine
        .register_bytes(
            &meta_bytes,
            StorageBinding::Single {
                root: package.local_path.clone(),
            },
            None,
            Some(context.announce_url.clone()),
        )
        .context("seed registration failed")?;
    info!(info_hash = %info_hash_hex, path = %package.local_path.display(), "seeding registered");
    Ok(())
}

/// Upload the composition XML if the hub does not hold it yet.
async fn ensure_canonical_xml(
    context: &Arc<SiteContext>,
    package: &LocalPackage,
    resolution: &InventoryResolution,
) {
    if context.hub.canonical_xml(resolution.package_id).await.is_ok() {
        return;
    }
    match dedup::collect_metadata_files(&package.local_path).await {
        Ok(files) if !files.is_empty() => {
            if let Err(err) = context
                .hub
                .put_canonical_xml(resolution.package_id, &files)
                .await
            {
                warn!(
                    package_id = %resolution.package_id,
                    error = %err,
                    "canonical xml upload failed"
                );
            }
        }
        Ok(_) => {}
        Err(err) => {
            warn!(
                package_id = %resolution.package_id,
                error = %err,
                "canonical xml collection failed"
            );
        }
    }
}

/// Ask the orchestrator for the claim and run a generation when granted.
async fn maybe_generate(
    context: &Arc<SiteContext>,
    package: &LocalPackage,
    resolution: &InventoryResolution,
    generation_slots: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<()> {
    let decision = context
        .hub
        .queue_check(&context.identity, resolution.package_id)
        .await
        .context("queue check failed")?;
    if decision.torrent_exists {
        // Generated elsewhere since the inventory upload; pick it up next
        // cycle.
        return Ok(());
    }
    if !decision.should_hash {
        debug!(
            package_id = %resolution.package_id,
            holder = ?decision.holder,
            "another node holds the hash claim"
        );
        return Ok(());
    }

    let permit = Arc::clone(generation_slots)
        .acquire_owned()
        .await
        .context("generation slot closed")?;
    let result = run_generation(context, package, resolution, cancel).await;
    drop(permit);
    result
}

async fn run_generation(
    context: &Arc<SiteContext>,
    package: &LocalPackage,
    resolution: &InventoryResolution,
    cancel: &CancellationToken,
) -> Result<()> {
    let package_id = resolution.package_id;
    let node_id = context.identity.node_id;

    context
        .catalog
        .upsert_queue_item(package_id, node_id, package.size_bytes)
        .await?;
    context
        .catalog
        .set_queue_status(package_id, node_id, QueueStatus::Generating, None, None)
        .await?;
    let _ = context.events.publish(Event::GenerationStarted { package_id });
    info!(package_id = %package_id, path = %package.local_path.display(), "generation started");

    let generator = TorrentGenerator::new(context.config.hash_workers);
    let request = GenerationRequest {
        package_id,
        node_id,
        root: package.local_path.clone(),
        piece_size: omnicloud_config::defaults::PIECE_SIZE,
        announce_url: context.announce_url.clone(),
        created_by: format!("omnicloud {}", env!("CARGO_PKG_VERSION")),
    };
    let progress = Arc::new(QueueProgressSink::new(
        context.catalog.clone(),
        context.events.clone(),
        node_id,
    ));

    let outcome = generator
        .generate(
            &request,
            Arc::new(context.catalog.clone()),
            progress,
            cancel.clone(),
        )
        .await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            let message = err.to_string();
            let status = if matches!(err, omnicloud_metainfo::MetainfoError::Cancelled { .. }) {
                QueueStatus::Cancelled
            } else {
                QueueStatus::Failed
            };
            context
                .catalog
                .set_queue_status(package_id, node_id, status, Some(&message), None)
                .await?;
            let _ = context.events.publish(Event::GenerationFailed {
                package_id,
                message: message.clone(),
            });
            // The hub-side claim must not outlive the run; the status upload
            // releases it.
            report_queue_failure(context, package_id, status, &message).await;
            return Err(err.into());
        }
    };

    let descriptor = &outcome.descriptor;
    context
        .hub
        .commit_torrent(
            &context.identity,
            &TorrentCommitRequest {
                package_id,
                info_hash: descriptor.info_hash.to_hex(),
                piece_size: i64::from(descriptor.piece_size),
                pieces_count: i64::from(descriptor.pieces_count),
                file_count: i64::from(descriptor.file_count),
                total_bytes: i64::try_from(descriptor.total_bytes).unwrap_or(i64::MAX),
                meta_b64: BASE64.encode(&descriptor.meta_bytes),
                local_path: package.local_path.display().to_string(),
            },
        )
        .await
        .context("torrent commit failed")?;

    context
        .catalog
        .set_queue_status(package_id, node_id, QueueStatus::Completed, None, None)
        .await?;
    let _ = context.events.publish(Event::GenerationCompleted {
        package_id,
        info_hash: descriptor.info_hash.to_hex(),
    });
    info!(
        package_id = %package_id,
        info_hash = %descriptor.info_hash,
        pieces = descriptor.pieces_count,
        resumed = outcome.resumed_pieces,
        "generation committed"
    );

    // The winner seeds immediately and uploads the canonical XML so
    // duplicate holders can co-seed.
    let metainfo = Metainfo::from_bytes(&descriptor.meta_bytes)?;
    context
        .engine
        .register(TorrentParams {
            metainfo,
            binding: StorageBinding::Single {
                root: package.local_path.clone(),
            },
            transfer_id: None,
            announce_url: context.announce_url.clone(),
        })
        .context("post-generation seed registration failed")?;
    ensure_canonical_xml(context, package, resolution).await;
    Ok(())
}

async fn report_queue_failure(
    context: &Arc<SiteContext>,
    package_id: uuid::Uuid,
    status: QueueStatus,
    message: &str,
) {
    let upload = TorrentStatusUpload {
        queue: vec![QueueItemUpload {
            package_id,
            status: status.as_str().to_string(),
            progress_pct: 0.0,
            current_file: None,
            total_bytes: 0,
            speed_bps: 0,
            error: Some(message.to_string()),
        }],
        torrents: Vec::new(),
    };
    if let Err(err) = context.hub.upload_status(&context.identity, &upload).await {
        warn!(error = %err, "queue failure report did not reach the hub");
    }
}

/// Push the batched queue and engine status to the hub.
pub(crate) async fn upload_status(context: &Arc<SiteContext>) -> Result<()> {
    let queue: Vec<QueueItemUpload> = context
        .catalog
        .list_queue()
        .await?
        .into_iter()
        .filter(|item| item.node_id == context.identity.node_id)
        .map(|item| QueueItemUpload {
            package_id: item.package_id,
            status: item.status.as_str().to_string(),
            progress_pct: item.progress_pct,
            current_file: item.current_file,
            total_bytes: item.total_bytes,
            speed_bps: item.speed_bps,
            error: item.error,
        })
        .collect();

    let torrents: Vec<EngineTorrentUpload> = context
        .engine
        .snapshot()
        .into_iter()
        .map(|torrent| EngineTorrentUpload {
            info_hash: torrent.info_hash.to_hex(),
            state: state_label(&torrent.state).to_string(),
            bytes_done: i64::try_from(torrent.bytes_done).unwrap_or(i64::MAX),
            bytes_total: i64::try_from(torrent.bytes_total).unwrap_or(i64::MAX),
            uploaded: i64::try_from(torrent.uploaded).unwrap_or(i64::MAX),
            peers: i64::try_from(torrent.peers).unwrap_or(i64::MAX),
            local_path: None,
        })
        .collect();

    if queue.is_empty() && torrents.is_empty() {
        return Ok(());
    }
    context
        .hub
        .upload_status(&context.identity, &TorrentStatusUpload { queue, torrents })
        .await
        .context("status upload failed")?;
    Ok(())
}

pub(crate) fn state_label(state: &TorrentState) -> &'static str {
    match state {
        TorrentState::Added => "added",
        TorrentState::Verifying => "verifying",
        TorrentState::Downloading => "downloading",
        TorrentState::Paused => "paused",
        TorrentState::Seeding => "seeding",
        TorrentState::Completed => "completed",
        TorrentState::Error { .. } => "error",
    }
}
