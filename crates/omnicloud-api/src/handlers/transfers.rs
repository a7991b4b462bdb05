//! Transfer dispatch surfaces.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use uuid::Uuid;

use omnicloud_api_models::{
    AckResponse, TransferCreateRequest, TransferProgressRequest, TransferView,
};
use omnicloud_catalog::{
    NewTransfer, PendingCommand, TransferPatch, TransferRecord, TransferStatus,
};

use crate::error::ApiError;
use crate::state::ApiState;

pub(crate) fn transfer_view(record: &TransferRecord, info_hash: String) -> TransferView {
    TransferView {
        id: record.id,
        torrent_id: record.torrent_id,
        info_hash,
        dest_node: record.dest_node,
        status: record.status.as_str().to_string(),
        priority: record.priority,
        progress_pct: record.progress_pct,
        bytes_done: record.bytes_done,
        dl_bps: record.dl_bps,
        ul_bps: record.ul_bps,
        peers: record.peers,
        eta_s: record.eta_s,
        error: record.error.clone(),
        delete_data: record.delete_data,
        pending_cmd: record.pending_cmd.as_str().to_string(),
        command_ack: record.command_ack,
    }
}

async fn with_info_hash(
    state: &ApiState,
    record: &TransferRecord,
) -> Result<TransferView, ApiError> {
    let info_hash = state
        .catalog
        .torrent(record.torrent_id)
        .await?
        .map(|torrent| torrent.info_hash.to_hex())
        .unwrap_or_default();
    Ok(transfer_view(record, info_hash))
}

/// `POST /transfers`: operator or dedup-rule transfer creation.
pub(crate) async fn create_transfer(
    State(state): State<ApiState>,
    Json(request): Json<TransferCreateRequest>,
) -> Result<Json<TransferView>, ApiError> {
    if state.catalog.torrent(request.torrent_id).await?.is_none() {
        return Err(ApiError::not_found("torrent not found"));
    }
    if state.catalog.node(request.dest_node).await?.is_none() {
        return Err(ApiError::not_found("destination node not found"));
    }
    let record = state
        .catalog
        .create_transfer(&NewTransfer {
            torrent_id: request.torrent_id,
            source_node: request.source_node,
            dest_node: request.dest_node,
            priority: request.priority,
            delete_data: request.delete_data,
        })
        .await?;
    Ok(Json(with_info_hash(&state, &record).await?))
}

#[derive(Debug, Deserialize)]
pub(crate) struct TransferListQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    dest: Option<Uuid>,
}

/// `GET /transfers` with optional status and destination filters.
pub(crate) async fn list_transfers(
    State(state): State<ApiState>,
    Query(query): Query<TransferListQuery>,
) -> Result<Json<Vec<TransferView>>, ApiError> {
    let status = query.status.as_deref().map(TransferStatus::parse);
    let records = state.catalog.list_transfers(status, query.dest).await?;
    let mut views = Vec::with_capacity(records.len());
    for record in &records {
        views.push(with_info_hash(&state, record).await?);
    }
    Ok(Json(views))
}

/// `PUT /transfers/{id}`: per-field progress update with guarded status
/// transitions; late reports against terminal transfers are dropped, never
/// applied.
pub(crate) async fn report_progress(
    State(state): State<ApiState>,
    Path(transfer_id): Path<Uuid>,
    Json(request): Json<TransferProgressRequest>,
) -> Result<Json<TransferView>, ApiError> {
    let patch = TransferPatch {
        status: request.status.as_deref().map(TransferStatus::parse),
        progress_pct: request.progress_pct,
        bytes_done: request.bytes_done,
        dl_bps: request.dl_bps,
        ul_bps: request.ul_bps,
        peers: request.peers,
        eta_s: request.eta_s,
        error: request.error,
        command_ack: request.command_ack,
    };
    let record = state
        .catalog
        .report_transfer_progress(transfer_id, &patch)
        .await?;

    // A completed transfer makes the destination a holder: write its
    // inventory row so the catalog reflects the new copy.
    if record.status == TransferStatus::Completed {
        if let Some(torrent) = state.catalog.torrent(record.torrent_id).await? {
            state
                .catalog
                .upsert_inventory(&omnicloud_catalog::InventoryEntry {
                    node_id: record.dest_node,
                    package_id: torrent.package_id,
                    local_path: request.local_path.clone().unwrap_or_default(),
                    status: omnicloud_catalog::InventoryStatus::Present,
                    last_verified: Some(chrono::Utc::now()),
                })
                .await?;
        }
    }
    Ok(Json(with_info_hash(&state, &record).await?))
}

/// `DELETE /transfers/{id}`: operator cancel; the destination site sees
/// the pending command on its next poll and acknowledges.
pub(crate) async fn cancel_transfer(
    State(state): State<ApiState>,
    Path(transfer_id): Path<Uuid>,
) -> Result<Json<AckResponse>, ApiError> {
    state
        .catalog
        .set_pending_command(transfer_id, PendingCommand::Cancel)
        .await?;
    state
        .catalog
        .report_transfer_progress(
            transfer_id,
            &TransferPatch {
                status: Some(TransferStatus::Cancelled),
                ..TransferPatch::default()
            },
        )
        .await?;
    Ok(Json(AckResponse { ok: true }))
}

/// `POST /transfers/{id}/command`: operator pause/resume.
#[derive(Debug, Deserialize)]
pub(crate) struct TransferCommandRequest {
    command: String,
}

pub(crate) async fn set_command(
    State(state): State<ApiState>,
    Path(transfer_id): Path<Uuid>,
    Json(request): Json<TransferCommandRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let command = match request.command.as_str() {
        "pause" => PendingCommand::Pause,
        "resume" => PendingCommand::Resume,
        "cancel" => PendingCommand::Cancel,
        other => {
            return Err(ApiError::bad_request(format!(
                "unknown transfer command {other}"
            )));
        }
    };
    state
        .catalog
        .set_pending_command(transfer_id, command)
        .await?;
    Ok(Json(AckResponse { ok: true }))
}
