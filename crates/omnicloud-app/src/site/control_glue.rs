//! Control-plane wiring for a site: heartbeat source, activity collectors,
//! and the command handler shared with the legacy poll path.

use std::sync::Arc;

use async_trait::async_trait;
use omnicloud_control::{
    ActivityCollector, CommandKind, CommandOutcome, ControlClient, ControlClientConfig,
    HeartbeatPayload, HeartbeatSource, SiteCommandHandler,
};
use omnicloud_events::{ActivityAction, ActivityCategory, ActivityItem, TorrentState};
use omnicloud_metainfo::InfoHash;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::site::SiteContext;
use crate::site::queue_manager::state_label;

/// Start the control client with the site's collectors and handler.
pub(crate) fn start_control_client(context: &Arc<SiteContext>, cancel: &CancellationToken) {
    let ws_url = context.hub.control_ws_url(&context.identity);
    let config = ControlClientConfig::new(ws_url);
    let heartbeat = Arc::new(SiteStatusSource {
        context: Arc::clone(context),
    });
    let collectors: Vec<Arc<dyn ActivityCollector>> = vec![
        Arc::new(EngineActivityCollector {
            context: Arc::clone(context),
        }),
        Arc::new(QueueActivityCollector {
            context: Arc::clone(context),
        }),
    ];
    let handler = Arc::new(SiteCommands {
        context: Arc::clone(context),
    });
    let _task = ControlClient::start(
        config,
        heartbeat,
        collectors,
        handler,
        context.events.clone(),
        cancel.clone(),
    );
}

struct SiteStatusSource {
    context: Arc<SiteContext>,
}

#[async_trait]
impl HeartbeatSource for SiteStatusSource {
    async fn heartbeat(&self) -> HeartbeatPayload {
        let public_ip = self
            .context
            .public_ip
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        HeartbeatPayload {
            storage_capacity_bytes: None,
            storage_free_bytes: None,
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            package_count: Some(
                self.context
                    .package_count
                    .load(std::sync::atomic::Ordering::Relaxed),
            ),
            public_ip,
            api_url: None,
        }
    }
}

struct EngineActivityCollector {
    context: Arc<SiteContext>,
}

#[async_trait]
impl ActivityCollector for EngineActivityCollector {
    async fn collect(&self) -> Vec<ActivityItem> {
        self.context
            .engine
            .snapshot()
            .into_iter()
            .filter_map(|torrent| {
                let action = match torrent.state {
                    TorrentState::Downloading => ActivityAction::Downloading,
                    TorrentState::Seeding => ActivityAction::Seeding,
                    TorrentState::Verifying => ActivityAction::Verifying,
                    TorrentState::Error { .. } => ActivityAction::Error,
                    TorrentState::Added | TorrentState::Paused | TorrentState::Completed => {
                        return None;
                    }
                };
                let category = if torrent.transfer_id.is_some() {
                    ActivityCategory::Transfer
                } else {
                    ActivityCategory::Torrent
                };
                let percent = if torrent.bytes_total == 0 {
                    0.0
                } else {
                    torrent.bytes_done as f64 / torrent.bytes_total as f64 * 100.0
                };
                Some(
                    ActivityItem::new(category, action, torrent.name.clone())
                        .with_detail(format!("{} peers", torrent.peers))
                        .with_percent(percent),
                )
            })
            .collect()
    }
}

struct QueueActivityCollector {
    context: Arc<SiteContext>,
}

#[async_trait]
impl ActivityCollector for QueueActivityCollector {
    async fn collect(&self) -> Vec<ActivityItem> {
        let Ok(items) = self.context.catalog.active_queue().await else {
            return Vec::new();
        };
        items
            .into_iter()
            .filter(|item| item.node_id == self.context.identity.node_id)
            .map(|item| {
                ActivityItem::new(
                    ActivityCategory::Generation,
                    ActivityAction::Hashing,
                    item.package_id.to_string(),
                )
                .with_detail(item.current_file.unwrap_or_default())
                .with_percent(item.progress_pct)
            })
            .collect()
    }
}

struct SiteCommands {
    context: Arc<SiteContext>,
}

#[async_trait]
impl SiteCommandHandler for SiteCommands {
    async fn handle(&self, kind: CommandKind, payload: serde_json::Value) -> CommandOutcome {
        execute_command(&self.context, kind, payload).await
    }
}

/// Execute one hub command. Shared between the control channel and the
/// legacy poll path so both apply identical semantics.
pub(crate) async fn execute_command(
    context: &Arc<SiteContext>,
    kind: CommandKind,
    payload: serde_json::Value,
) -> CommandOutcome {
    info!(kind = kind.as_str(), "executing hub command");
    match kind {
        // Process-lifecycle commands hand off to the out-of-scope service
        // manager; acknowledging schedules them.
        CommandKind::Restart => CommandOutcome::ok("restart scheduled"),
        CommandKind::Upgrade => CommandOutcome::ok("upgrade scheduled"),
        CommandKind::Rescan => CommandOutcome::ok("rescan scheduled"),
        CommandKind::StatusUpdate => {
            let snapshot: Vec<serde_json::Value> = context
                .engine
                .snapshot()
                .into_iter()
                .map(|torrent| {
                    serde_json::json!({
                        "info_hash": torrent.info_hash.to_hex(),
                        "state": state_label(&torrent.state),
                        "bytes_done": torrent.bytes_done,
                        "bytes_total": torrent.bytes_total,
                        "peers": torrent.peers,
                    })
                })
                .collect();
            CommandOutcome::ok("status").with_payload(serde_json::json!({ "torrents": snapshot }))
        }
        CommandKind::DeleteContent => delete_content(context, &payload).await,
    }
}

/// Resolve a legacy poll command label and execute it.
pub(crate) async fn execute_command_label(
    context: &Arc<SiteContext>,
    kind_label: &str,
    payload: serde_json::Value,
) -> CommandOutcome {
    let kind = match kind_label {
        "restart" => CommandKind::Restart,
        "upgrade" => CommandKind::Upgrade,
        "rescan" => CommandKind::Rescan,
        "status_update" => CommandKind::StatusUpdate,
        "delete_content" => CommandKind::DeleteContent,
        other => {
            return CommandOutcome::failed(format!("unknown command kind {other}"));
        }
    };
    execute_command(context, kind, payload).await
}

async fn delete_content(context: &Arc<SiteContext>, payload: &serde_json::Value) -> CommandOutcome {
    let Some(package_id) = payload
        .get("package_id")
        .and_then(|value| value.as_str())
        .and_then(|raw| raw.parse::<Uuid>().ok())
    else {
        return CommandOutcome::failed("delete_content payload missing package_id");
    };
    let delete_data = payload
        .get("delete_data")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    let info_hash = payload
        .get("info_hash")
        .and_then(|value| value.as_str())
        .and_then(|raw| raw.parse::<InfoHash>().ok());

    if let Some(info_hash) = info_hash {
        match context.engine.remove(info_hash, delete_data).await {
            Ok(()) => {}
            Err(err) => {
                // An unregistered torrent is already gone; anything else is
                // a real failure.
                if !matches!(err, omnicloud_torrent::EngineError::NotRegistered { .. }) {
                    return CommandOutcome::failed(format!("engine removal failed: {err}"));
                }
            }
        }
    }

    if let Err(err) = context
        .catalog
        .delete_ingestion(context.identity.node_id, package_id)
        .await
    {
        warn!(package_id = %package_id, error = %err, "ingestion row removal failed");
    }

    let shadow_dir = context.config.shadow_root().join(package_id.to_string());
    if tokio::fs::metadata(&shadow_dir).await.is_ok() {
        if let Err(err) = tokio::fs::remove_dir_all(&shadow_dir).await {
            warn!(path = %shadow_dir.display(), error = %err, "shadow directory removal failed");
        }
    }

    info!(package_id = %package_id, delete_data, "content deleted");
    CommandOutcome::ok("content deleted")
}
