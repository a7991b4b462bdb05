//! The transfer runner: polls assignments, drives downloads through the
//! engine, reports progress, and finalizes completions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use omnicloud_api_models::{SeederRegisterRequest, TransferProgressRequest, TransferView};
use omnicloud_catalog::{IngestionRecord, IngestionStatus};
use omnicloud_events::TorrentState;
use omnicloud_metainfo::{InfoHash, Metainfo};
use omnicloud_torrent::StorageBinding;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::reporters::TransferSignal;
use crate::site::SiteContext;

/// Assignment poll cadence.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Progress report cadence; the hub tolerates up to five seconds.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive transient failures before the loop surfaces an error log at
/// warning level.
const SURFACE_AFTER_FAILURES: u32 = 10;

/// Run the transfer loops until cancelled.
pub(crate) async fn run(
    context: Arc<SiteContext>,
    mut signals: mpsc::Receiver<TransferSignal>,
    cancel: CancellationToken,
) {
    let mut poll_tick = tokio::time::interval(POLL_INTERVAL);
    let mut progress_tick = tokio::time::interval(PROGRESS_INTERVAL);
    poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    progress_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Transfers this runner has handed to the engine.
    let mut active: HashMap<Uuid, InfoHash> = HashMap::new();
    let mut backoff = Backoff::for_hub_calls();
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = poll_tick.tick() => {
                match poll_assignments(&context, &mut active).await {
                    Ok(()) => {
                        backoff.reset();
                        consecutive_failures = 0;
                    }
                    Err(err) => {
                        consecutive_failures += 1;
                        if consecutive_failures >= SURFACE_AFTER_FAILURES {
                            warn!(error = %err, failures = consecutive_failures,
                                "transfer polling keeps failing");
                        } else {
                            debug!(error = %err, "transfer poll failed; backing off");
                        }
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
            }
            _ = progress_tick.tick() => {
                report_progress(&context, &active).await;
            }
            signal = signals.recv() => {
                let Some(signal) = signal else { break };
                match signal {
                    TransferSignal::Completed { info_hash, transfer_id } => {
                        if let Err(err) =
                            finalize_completion(&context, transfer_id, info_hash).await
                        {
                            warn!(
                                transfer_id = %transfer_id,
                                error = %err,
                                "completion finalization failed"
                            );
                        }
                        active.remove(&transfer_id);
                    }
                }
            }
        }
    }
}

async fn poll_assignments(
    context: &Arc<SiteContext>,
    active: &mut HashMap<Uuid, InfoHash>,
) -> Result<()> {
    let assignments = context
        .hub
        .pending_transfers(&context.identity)
        .await
        .context("pending transfer poll failed")?;
    for view in assignments {
        if let Err(err) = handle_assignment(context, active, &view).await {
            warn!(transfer_id = %view.id, error = %err, "assignment handling failed");
        }
    }
    Ok(())
}

async fn handle_assignment(
    context: &Arc<SiteContext>,
    active: &mut HashMap<Uuid, InfoHash>,
    view: &TransferView,
) -> Result<()> {
    if view.info_hash.is_empty() {
        anyhow::bail!("assignment without an info-hash");
    }
    let info_hash: InfoHash = view
        .info_hash
        .parse()
        .map_err(|_err| anyhow::anyhow!("assignment carried a bad info-hash"))?;

    if !active.contains_key(&view.id) {
        let registered = context
            .engine
            .snapshot()
            .iter()
            .any(|torrent| torrent.info_hash == info_hash);
        if registered {
            active.insert(view.id, info_hash);
        } else {
            start_download(context, view, info_hash).await?;
            active.insert(view.id, info_hash);
        }
    }

    if view.pending_cmd.is_empty() || view.command_ack {
        return Ok(());
    }
    apply_pending_command(context, view, info_hash).await
}

async fn start_download(
    context: &Arc<SiteContext>,
    view: &TransferView,
    info_hash: InfoHash,
) -> Result<()> {
    let meta_bytes = context
        .hub
        .torrent_file(&view.info_hash)
        .await
        .context("torrent file fetch failed")?;
    let metainfo = Metainfo::from_bytes(&meta_bytes).context("torrent bytes did not parse")?;
    let download_root = context.config.download_root().join(&metainfo.info.name);

    context
        .engine
        .register_bytes(
            &meta_bytes,
            StorageBinding::Single {
                root: download_root,
            },
            Some(view.id),
            Some(context.announce_url.clone()),
        )
        .context("download registration failed")?;
    info!(transfer_id = %view.id, info_hash = %info_hash, "download started");

    context
        .hub
        .report_progress(
            view.id,
            &TransferProgressRequest {
                status: Some("downloading".to_string()),
                ..TransferProgressRequest::default()
            },
        )
        .await
        .context("downloading status report failed")?;
    Ok(())
}

async fn apply_pending_command(
    context: &Arc<SiteContext>,
    view: &TransferView,
    info_hash: InfoHash,
) -> Result<()> {
    info!(transfer_id = %view.id, command = %view.pending_cmd, "applying operator command");
    let status = match view.pending_cmd.as_str() {
        "pause" => {
            context.engine.pause(info_hash).await?;
            Some("paused".to_string())
        }
        "resume" => {
            context.engine.resume(info_hash).await?;
            Some("downloading".to_string())
        }
        "cancel" => {
            context.engine.remove(info_hash, view.delete_data).await?;
            // The hub usually moved the row to cancelled already; avoid a
            // rejected duplicate transition and only acknowledge then.
            (view.status != "cancelled").then(|| "cancelled".to_string())
        }
        other => anyhow::bail!("unknown pending command {other}"),
    };
    context
        .hub
        .report_progress(
            view.id,
            &TransferProgressRequest {
                status,
                command_ack: Some(true),
                ..TransferProgressRequest::default()
            },
        )
        .await
        .context("command acknowledgement failed")?;
    Ok(())
}

async fn report_progress(context: &Arc<SiteContext>, active: &HashMap<Uuid, InfoHash>) {
    if active.is_empty() {
        return;
    }
    let snapshot = context.engine.snapshot();
    for torrent in snapshot {
        let Some(transfer_id) = torrent.transfer_id else {
            continue;
        };
        if !active.contains_key(&transfer_id) {
            continue;
        }
        if matches!(torrent.state, TorrentState::Completed | TorrentState::Error { .. }) {
            // Terminal transitions travel through their dedicated paths.
            continue;
        }
        let percent = if torrent.bytes_total == 0 {
            0.0
        } else {
            torrent.bytes_done as f64 / torrent.bytes_total as f64 * 100.0
        };
        let eta_s = (torrent.download_bps > 0).then(|| {
            let remaining = torrent.bytes_total.saturating_sub(torrent.bytes_done);
            i64::try_from(remaining / torrent.download_bps).unwrap_or(i64::MAX)
        });
        let request = TransferProgressRequest {
            progress_pct: Some(percent),
            bytes_done: Some(i64::try_from(torrent.bytes_done).unwrap_or(i64::MAX)),
            dl_bps: Some(i64::try_from(torrent.download_bps).unwrap_or(i64::MAX)),
            ul_bps: Some(i64::try_from(torrent.upload_bps).unwrap_or(i64::MAX)),
            peers: Some(i64::try_from(torrent.peers).unwrap_or(i64::MAX)),
            eta_s,
            ..TransferProgressRequest::default()
        };
        if let Err(err) = context.hub.report_progress(transfer_id, &request).await {
            debug!(transfer_id = %transfer_id, error = %err, "progress report failed");
        }
    }
}

/// A finished download: report completion with the landing path, record the
/// ingestion row, and register as a seeder.
async fn finalize_completion(
    context: &Arc<SiteContext>,
    transfer_id: Uuid,
    info_hash: InfoHash,
) -> Result<()> {
    let snapshot = context.engine.snapshot();
    let torrent = snapshot
        .iter()
        .find(|torrent| torrent.info_hash == info_hash);
    let name = torrent.map_or_else(String::new, |torrent| torrent.name.clone());
    let download_path = context.config.download_root().join(&name);

    context
        .hub
        .report_progress(
            transfer_id,
            &TransferProgressRequest {
                status: Some("completed".to_string()),
                progress_pct: Some(100.0),
                local_path: Some(download_path.display().to_string()),
                ..TransferProgressRequest::default()
            },
        )
        .await
        .context("completion report failed")?;

    let detail = context
        .hub
        .torrent(&info_hash.to_hex())
        .await
        .context("torrent detail fetch failed")?;
    context
        .catalog
        .upsert_ingestion(&IngestionRecord {
            node_id: context.identity.node_id,
            package_id: detail.package_id,
            info_hash,
            download_path: download_path.display().to_string(),
            ingest_path: None,
            status: IngestionStatus::Downloaded,
            verified_at: Some(chrono::Utc::now()),
            switched_at: None,
            cleaned_at: None,
            error: None,
        })
        .await
        .context("ingestion record failed")?;

    context
        .hub
        .register_seeder(
            &context.identity,
            &info_hash.to_hex(),
            &SeederRegisterRequest {
                local_path: download_path.display().to_string(),
                status: "completed".to_string(),
                uploaded_bytes: 0,
            },
        )
        .await
        .context("seeder registration failed")?;

    info!(
        transfer_id = %transfer_id,
        info_hash = %info_hash,
        path = %download_path.display(),
        "transfer completed and seeding"
    );
    Ok(())
}
