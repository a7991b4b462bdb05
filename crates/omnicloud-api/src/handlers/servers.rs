//! Node-facing handlers: registration, heartbeats, dispatch polls, batched
//! uploads, the legacy command poll, the NAT probe, and settings.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, Extension, Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use omnicloud_api_models::{
    AckResponse, ActionDoneRequest, CommandView, HeartbeatRequest, InventoryResolution,
    InventoryUploadRequest, InventoryUploadResponse, LibraryLocation, LibraryLocationCreate,
    NatCheckResponse, NodeView, PendingActionResponse, QueueCheckResponse, RegisterRequest,
    RegisterResponse, SettingsView, TorrentStatusUpload, TransferView,
};
use omnicloud_catalog::{
    ClaimDecision, CommandStatus, InventoryEntry, InventoryStatus, NodeRecord, NodeSettings,
    QueueStatus, SeederRecord, SeederStatus,
};
use omnicloud_control::{CommandKind, probe_nat};
use omnicloud_metainfo::InfoHash;

use crate::auth::{AuthedNode, hash_registration_key};
use crate::error::ApiError;
use crate::handlers::torrents::torrent_view;
use crate::state::ApiState;

pub(crate) fn node_view(node: &NodeRecord) -> NodeView {
    NodeView {
        id: node.id,
        name: node.name.clone(),
        display_name: node.display_name.clone(),
        role: node.role.clone(),
        authorized: node.authorized,
        last_seen: node.last_seen,
        version: node.version.clone(),
        behind_nat: node.behind_nat,
        relay_registered: node.relay_registered,
    }
}

/// `POST /servers/register`.
pub(crate) async fn register(
    State(state): State<ApiState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    if request.registration_key != state.config.registration_key {
        return Err(ApiError::unauthorized("registration key rejected"));
    }
    let key_hash = hash_registration_key(&request.registration_key)?;
    let node = state
        .catalog
        .register_node(
            &request.name,
            &request.mac,
            request.role.as_deref().unwrap_or("site"),
            request.version.as_deref(),
            request.public_endpoint.as_deref(),
            &key_hash,
        )
        .await?;
    info!(node_id = %node.id, name = %node.name, "node registered");
    Ok(Json(RegisterResponse {
        node: node_view(&node),
    }))
}

/// `GET /servers`: node listing for the operator UI.
pub(crate) async fn list_servers(
    State(state): State<ApiState>,
) -> Result<Json<Vec<NodeView>>, ApiError> {
    let nodes = state.catalog.list_nodes().await?;
    Ok(Json(nodes.iter().map(node_view).collect()))
}

/// `POST /servers/{id}/authorize`: operator action.
pub(crate) async fn authorize(
    State(state): State<ApiState>,
    Path(node_id): Path<Uuid>,
) -> Result<Json<AckResponse>, ApiError> {
    state.catalog.authorize_node(node_id).await?;
    Ok(Json(AckResponse { ok: true }))
}

/// `POST /servers/{id}/heartbeat`.
pub(crate) async fn heartbeat(
    State(state): State<ApiState>,
    Extension(authed): Extension<AuthedNode>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    state
        .catalog
        .touch_node(
            authed.node_id,
            request.version.as_deref(),
            request.public_endpoint.as_deref(),
        )
        .await?;
    Ok(Json(AckResponse { ok: true }))
}

/// `GET /servers/{id}/pending-transfers`: the dispatcher site poll.
pub(crate) async fn pending_transfers(
    State(state): State<ApiState>,
    Extension(authed): Extension<AuthedNode>,
) -> Result<Json<Vec<TransferView>>, ApiError> {
    let transfers = state.catalog.pending_transfers_for(authed.node_id).await?;
    let mut views = Vec::with_capacity(transfers.len());
    for transfer in transfers {
        let info_hash = match state.catalog.torrent(transfer.torrent_id).await? {
            Some(torrent) => torrent.info_hash.to_hex(),
            None => String::new(),
        };
        views.push(crate::handlers::transfers::transfer_view(&transfer, info_hash));
    }
    Ok(Json(views))
}

/// `POST /servers/{id}/torrent-status`: batched queue and engine status.
pub(crate) async fn torrent_status(
    State(state): State<ApiState>,
    Extension(authed): Extension<AuthedNode>,
    Json(upload): Json<TorrentStatusUpload>,
) -> Result<Json<AckResponse>, ApiError> {
    for item in &upload.queue {
        let status = QueueStatus::parse(&item.status);
        state
            .catalog
            .upsert_queue_item(item.package_id, authed.node_id, item.total_bytes)
            .await?;
        match status {
            QueueStatus::Generating | QueueStatus::Queued => {
                state
                    .catalog
                    .update_queue_progress(
                        item.package_id,
                        authed.node_id,
                        item.progress_pct,
                        item.current_file.as_deref().unwrap_or(""),
                        item.speed_bps,
                    )
                    .await?;
                if status == QueueStatus::Generating {
                    state
                        .catalog
                        .set_queue_status(
                            item.package_id,
                            authed.node_id,
                            status,
                            item.error.as_deref(),
                            None,
                        )
                        .await?;
                }
            }
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Cancelled => {
                state
                    .catalog
                    .set_queue_status(
                        item.package_id,
                        authed.node_id,
                        status,
                        item.error.as_deref(),
                        None,
                    )
                    .await?;
                // A failed or cancelled run must not hold the hash claim for
                // the stale sweep to find; success released it at commit.
                if status != QueueStatus::Completed {
                    state
                        .catalog
                        .release_claim(item.package_id, authed.node_id)
                        .await?;
                }
            }
        }
    }

    for torrent in &upload.torrents {
        let Ok(info_hash) = torrent.info_hash.parse::<InfoHash>() else {
            warn!(info_hash = %torrent.info_hash, "status upload carried a bad info-hash");
            continue;
        };
        let Some(row) = state.catalog.torrent_by_info_hash(&info_hash).await? else {
            continue;
        };
        match torrent.state.as_str() {
            "seeding" | "completed" => {
                state
                    .catalog
                    .upsert_seeder(&SeederRecord {
                        torrent_id: row.id,
                        node_id: authed.node_id,
                        local_path: torrent.local_path.clone().unwrap_or_default(),
                        status: if torrent.state == "completed" {
                            SeederStatus::Completed
                        } else {
                            SeederStatus::Seeding
                        },
                        uploaded_bytes: torrent.uploaded,
                        last_announce: Some(Utc::now()),
                    })
                    .await?;
            }
            "error" => {
                state.catalog.delete_seeder(row.id, authed.node_id).await?;
            }
            _ => {}
        }
    }
    Ok(Json(AckResponse { ok: true }))
}

/// `POST /servers/{id}/inventory`: batched inventory upsert with dedup
/// resolution. A delivery whose composition fingerprint already has a
/// canonical package attaches to that package instead of creating a new
/// row.
pub(crate) async fn inventory_upload(
    State(state): State<ApiState>,
    Extension(authed): Extension<AuthedNode>,
    Json(upload): Json<InventoryUploadRequest>,
) -> Result<Json<InventoryUploadResponse>, ApiError> {
    let mut resolutions = Vec::with_capacity(upload.items.len());
    for item in &upload.items {
        let canonical = state.catalog.package_by_inner_fp(&item.inner_fp).await?;
        let (package, duplicate) = match canonical {
            Some(package) if package.outer_fp != item.outer_fp => (package, true),
            _ => {
                let package = state
                    .catalog
                    .upsert_package(
                        &item.outer_fp,
                        &item.inner_fp,
                        &item.title,
                        &item.kind,
                        item.size_bytes,
                        item.file_count,
                    )
                    .await?;
                (package, false)
            }
        };
        state
            .catalog
            .upsert_inventory(&InventoryEntry {
                node_id: authed.node_id,
                package_id: package.id,
                local_path: item.local_path.clone(),
                status: InventoryStatus::Present,
                last_verified: None,
            })
            .await?;
        let torrent = state.catalog.torrent_by_package(package.id).await?;
        resolutions.push(InventoryResolution {
            outer_fp: item.outer_fp.clone(),
            package_id: package.id,
            duplicate_of_canonical: duplicate,
            torrent: torrent.as_ref().map(torrent_view),
        });
    }
    Ok(Json(InventoryUploadResponse { resolutions }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct QueueCheckQuery {
    package_id: Uuid,
}

/// `GET /torrent-queue/check`: the hash orchestrator probe. One
/// transaction decides: torrent present, claim granted, or claim denied.
pub(crate) async fn queue_check(
    State(state): State<ApiState>,
    Extension(authed): Extension<AuthedNode>,
    Query(query): Query<QueueCheckQuery>,
) -> Result<Json<QueueCheckResponse>, ApiError> {
    let decision = state
        .catalog
        .claim_decision(query.package_id, authed.node_id)
        .await?;
    let response = match decision {
        ClaimDecision::TorrentExists => QueueCheckResponse {
            torrent_exists: true,
            should_hash: false,
            holder: None,
        },
        ClaimDecision::Granted => QueueCheckResponse {
            torrent_exists: false,
            should_hash: true,
            holder: None,
        },
        ClaimDecision::Denied { holder } => QueueCheckResponse {
            torrent_exists: false,
            should_hash: false,
            holder: Some(holder),
        },
    };
    Ok(Json(response))
}

/// `GET /torrent-queue`: queue listing for the observability UI.
pub(crate) async fn queue_list(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let items = state.catalog.list_queue().await?;
    Ok(Json(serde_json::json!({ "items": items })))
}

/// `GET /servers/{id}/pending-action`: legacy command poll for sites
/// without a control channel. Serving a command marks it delivered so the
/// control channel cannot deliver it again.
pub(crate) async fn pending_action(
    State(state): State<ApiState>,
    Extension(authed): Extension<AuthedNode>,
) -> Result<Json<PendingActionResponse>, ApiError> {
    let pending = state.catalog.pending_commands(authed.node_id).await?;
    let Some(command) = pending.into_iter().next() else {
        return Ok(Json(PendingActionResponse { command: None }));
    };
    state
        .catalog
        .mark_command(command.id, CommandStatus::Delivered, None)
        .await?;
    Ok(Json(PendingActionResponse {
        command: Some(CommandView {
            id: command.id,
            kind: command.kind,
            payload: command.payload_json,
        }),
    }))
}

/// `POST /servers/{id}/action-done`: legacy command acknowledgement.
pub(crate) async fn action_done(
    State(state): State<ApiState>,
    Extension(_authed): Extension<AuthedNode>,
    Json(request): Json<ActionDoneRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let status = if request.success {
        CommandStatus::Acknowledged
    } else {
        CommandStatus::Failed
    };
    state
        .catalog
        .mark_command(request.command_id, status, request.message.as_deref())
        .await?;
    Ok(Json(AckResponse { ok: true }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct NatCheckQuery {
    port: u16,
}

/// `GET /servers/{id}/nat-check`: dial back to the caller.
pub(crate) async fn nat_check(
    State(state): State<ApiState>,
    Extension(authed): Extension<AuthedNode>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<NatCheckQuery>,
) -> Result<Json<NatCheckResponse>, ApiError> {
    let reachable = probe_nat(remote.ip(), query.port).await;
    state
        .catalog
        .set_behind_nat(authed.node_id, !reachable)
        .await?;
    Ok(Json(NatCheckResponse {
        reachable,
        external_ip: remote.ip().to_string(),
    }))
}

/// `DELETE /servers/{id}/content/{package_id}`: operator content removal.
/// Cancels any active transfer, commands the site over the control plane,
/// and on success removes the node's inventory, seeder, and ingestion rows.
pub(crate) async fn delete_content(
    State(state): State<ApiState>,
    Path((node_id, package_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<AckResponse>, ApiError> {
    let torrent = state.catalog.torrent_by_package(package_id).await?;

    if let Some(torrent) = &torrent {
        let active = state
            .catalog
            .list_transfers(None, Some(node_id))
            .await?
            .into_iter()
            .find(|transfer| {
                transfer.torrent_id == torrent.id && !transfer.status.is_terminal()
            });
        if let Some(transfer) = active {
            state
                .catalog
                .mark_transfer_delete_data(transfer.id)
                .await?;
            state
                .catalog
                .set_pending_command(transfer.id, omnicloud_catalog::PendingCommand::Cancel)
                .await?;
            state
                .catalog
                .report_transfer_progress(
                    transfer.id,
                    &omnicloud_catalog::TransferPatch {
                        status: Some(omnicloud_catalog::TransferStatus::Cancelled),
                        ..omnicloud_catalog::TransferPatch::default()
                    },
                )
                .await?;
        }
    }

    let command_id = Uuid::new_v4();
    let payload = serde_json::json!({
        "package_id": package_id,
        "info_hash": torrent.as_ref().map(|t| t.info_hash.to_hex()),
        "delete_data": true,
    });
    state
        .catalog
        .create_command(command_id, node_id, CommandKind::DeleteContent.as_str(), &payload)
        .await?;

    let outcome = state
        .control
        .send_command_and_wait(
            node_id,
            CommandKind::DeleteContent,
            payload,
            Some(Duration::from_secs(30)),
        )
        .await;

    match outcome {
        Ok(result) if result.success => {
            state
                .catalog
                .mark_command(command_id, CommandStatus::Acknowledged, Some(&result.message))
                .await?;
            state.catalog.delete_inventory(node_id, package_id).await?;
            if let Some(torrent) = &torrent {
                state.catalog.delete_seeder(torrent.id, node_id).await?;
            }
            state.catalog.delete_ingestion(node_id, package_id).await?;
            info!(node_id = %node_id, package_id = %package_id, "content deleted");
            Ok(Json(AckResponse { ok: true }))
        }
        Ok(result) => {
            state
                .catalog
                .mark_command(command_id, CommandStatus::Failed, Some(&result.message))
                .await?;
            Err(ApiError::conflict(format!(
                "site rejected deletion: {}",
                result.message
            )))
        }
        Err(err) => {
            // The command record stays pending so the legacy poll path can
            // still deliver it when the site reconnects.
            warn!(node_id = %node_id, error = %err, "delete-content control command failed");
            Err(ApiError::unavailable(format!(
                "site unreachable over the control plane: {err}"
            )))
        }
    }
}

/// `GET /servers/{id}/settings`.
pub(crate) async fn get_settings(
    State(state): State<ApiState>,
    Path(node_id): Path<Uuid>,
) -> Result<Json<SettingsView>, ApiError> {
    let settings = state.catalog.node_settings(node_id).await?;
    Ok(Json(settings.map_or_else(SettingsView::default, |row| {
        SettingsView {
            api_url: row.api_url,
            storage_capacity_bytes: row.storage_capacity_bytes,
            library_locations: parse_locations(&row.library_locations),
        }
    })))
}

/// `PUT /servers/{id}/settings`.
pub(crate) async fn put_settings(
    State(state): State<ApiState>,
    Path(node_id): Path<Uuid>,
    Json(request): Json<SettingsView>,
) -> Result<Json<AckResponse>, ApiError> {
    let settings = NodeSettings {
        node_id,
        api_url: request.api_url,
        storage_capacity_bytes: request.storage_capacity_bytes,
        library_locations: serde_json::to_value(&request.library_locations)
            .map_err(|err| ApiError::bad_request(format!("bad library locations: {err}")))?,
    };
    state.catalog.upsert_node_settings(&settings).await?;
    Ok(Json(AckResponse { ok: true }))
}

/// `POST /servers/{id}/library-locations`.
pub(crate) async fn add_library_location(
    State(state): State<ApiState>,
    Path(node_id): Path<Uuid>,
    Json(request): Json<LibraryLocationCreate>,
) -> Result<Json<LibraryLocation>, ApiError> {
    let mut locations = current_locations(&state, node_id).await?;
    let location = LibraryLocation {
        id: Uuid::new_v4(),
        path: request.path,
        watch: request.watch,
    };
    locations.push(location.clone());
    save_locations(&state, node_id, locations).await?;
    Ok(Json(location))
}

/// `PUT /servers/{id}/library-locations/{loc_id}`.
pub(crate) async fn update_library_location(
    State(state): State<ApiState>,
    Path((node_id, loc_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<LibraryLocationCreate>,
) -> Result<Json<AckResponse>, ApiError> {
    let mut locations = current_locations(&state, node_id).await?;
    let slot = locations
        .iter_mut()
        .find(|location| location.id == loc_id)
        .ok_or_else(|| ApiError::not_found("library location not found"))?;
    slot.path = request.path;
    slot.watch = request.watch;
    save_locations(&state, node_id, locations).await?;
    Ok(Json(AckResponse { ok: true }))
}

/// `DELETE /servers/{id}/library-locations/{loc_id}`.
pub(crate) async fn delete_library_location(
    State(state): State<ApiState>,
    Path((node_id, loc_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<AckResponse>, ApiError> {
    let mut locations = current_locations(&state, node_id).await?;
    let before = locations.len();
    locations.retain(|location| location.id != loc_id);
    if locations.len() == before {
        return Err(ApiError::not_found("library location not found"));
    }
    save_locations(&state, node_id, locations).await?;
    Ok(Json(AckResponse { ok: true }))
}

/// `GET /activity`: live per-node activity from the control plane.
pub(crate) async fn activity(
    State(state): State<ApiState>,
) -> Json<HashMap<Uuid, serde_json::Value>> {
    let snapshot = state.activity.snapshot();
    Json(
        snapshot
            .into_iter()
            .map(|(node, (at, items))| {
                (node, serde_json::json!({ "observed_at": at, "items": items }))
            })
            .collect(),
    )
}

async fn current_locations(
    state: &ApiState,
    node_id: Uuid,
) -> Result<Vec<LibraryLocation>, ApiError> {
    Ok(state
        .catalog
        .node_settings(node_id)
        .await?
        .map(|row| parse_locations(&row.library_locations))
        .unwrap_or_default())
}

async fn save_locations(
    state: &ApiState,
    node_id: Uuid,
    locations: Vec<LibraryLocation>,
) -> Result<(), ApiError> {
    let existing = state.catalog.node_settings(node_id).await?;
    let settings = NodeSettings {
        node_id,
        api_url: existing.as_ref().and_then(|row| row.api_url.clone()),
        storage_capacity_bytes: existing.and_then(|row| row.storage_capacity_bytes),
        library_locations: serde_json::to_value(&locations)
            .map_err(|err| ApiError::internal(format!("locations encoding failed: {err}")))?,
    };
    state.catalog.upsert_node_settings(&settings).await?;
    Ok(())
}

fn parse_locations(value: &serde_json::Value) -> Vec<LibraryLocation> {
    serde_json::from_value(value.clone()).unwrap_or_default()
}
