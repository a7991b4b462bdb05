//! Torrent surfaces: listing, detail, `.torrent` bytes, commits, seeders,
//! and the announce log.

use axum::extract::{Extension, Path, Query, State};
use axum::http::{HeaderMap, header};
use axum::response::IntoResponse;
use axum::Json;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use omnicloud_api_models::{
    AckResponse, AnnounceAttemptView, SeederRegisterRequest, TorrentCommitRequest, TorrentView,
};
use omnicloud_catalog::{SeederRecord, SeederStatus, TorrentRecord};
use omnicloud_metainfo::InfoHash;

use crate::auth::AuthedNode;
use crate::error::ApiError;
use crate::state::ApiState;

pub(crate) fn torrent_view(record: &TorrentRecord) -> TorrentView {
    TorrentView {
        id: record.id,
        package_id: record.package_id,
        info_hash: record.info_hash.to_hex(),
        piece_size: record.piece_size,
        pieces_count: record.pieces_count,
        file_count: record.file_count,
        total_bytes: record.total_bytes,
        created_by_node: record.created_by_node,
        created_at: record.created_at,
    }
}

fn parse_hash(raw: &str) -> Result<InfoHash, ApiError> {
    raw.parse()
        .map_err(|_err| ApiError::bad_request("malformed info-hash"))
}

#[derive(Debug, Deserialize)]
pub(crate) struct TorrentListQuery {
    #[serde(default)]
    package_id: Option<Uuid>,
}

/// `GET /torrents` with optional `package_id` filter.
pub(crate) async fn list_torrents(
    State(state): State<ApiState>,
    Query(query): Query<TorrentListQuery>,
) -> Result<Json<Vec<TorrentView>>, ApiError> {
    let views = match query.package_id {
        Some(package_id) => state
            .catalog
            .torrent_by_package(package_id)
            .await?
            .into_iter()
            .map(|record| torrent_view(&record))
            .collect(),
        None => state
            .catalog
            .list_torrents()
            .await?
            .iter()
            .map(torrent_view)
            .collect(),
    };
    Ok(Json(views))
}

/// `GET /torrents/{info_hash}`.
pub(crate) async fn get_torrent(
    State(state): State<ApiState>,
    Path(info_hash): Path<String>,
) -> Result<Json<TorrentView>, ApiError> {
    let hash = parse_hash(&info_hash)?;
    let record = state
        .catalog
        .torrent_by_info_hash(&hash)
        .await?
        .ok_or_else(|| ApiError::not_found("torrent not found"))?;
    Ok(Json(torrent_view(&record)))
}

/// `GET /torrents/{info_hash}/file`: the bencoded `.torrent` bytes.
pub(crate) async fn torrent_file(
    State(state): State<ApiState>,
    Path(info_hash): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let hash = parse_hash(&info_hash)?;
    let record = state
        .catalog
        .torrent_by_info_hash(&hash)
        .await?
        .ok_or_else(|| ApiError::not_found("torrent not found"))?;
    Ok((
        [(header::CONTENT_TYPE, "application/x-bittorrent")],
        record.meta_bytes,
    ))
}

/// `POST /torrents`: a generation winner commits its descriptor. The
/// torrent row, queue completion, and claim release land in one
/// transaction; the winner also becomes the first seeder.
///
/// This path is shared with the operator listing, so node authentication
/// happens in the handler rather than the route middleware.
pub(crate) async fn commit_torrent(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<TorrentCommitRequest>,
) -> Result<Json<TorrentView>, ApiError> {
    let authed = crate::auth::authenticate_headers(&state, &headers).await?;
    let info_hash = parse_hash(&request.info_hash)?;
    let meta_bytes = BASE64
        .decode(&request.meta_b64)
        .map_err(|_err| ApiError::bad_request("meta_b64 is not valid base64"))?;

    if let Some(existing) = state.catalog.torrent_by_package(request.package_id).await? {
        // Idempotent re-commit after a lost response.
        if existing.info_hash == info_hash {
            return Ok(Json(torrent_view(&existing)));
        }
        return Err(ApiError::conflict("package already has a torrent"));
    }

    let record = TorrentRecord {
        id: Uuid::new_v4(),
        package_id: request.package_id,
        info_hash,
        piece_size: request.piece_size,
        pieces_count: request.pieces_count,
        file_count: request.file_count,
        total_bytes: request.total_bytes,
        meta_bytes,
        created_by_node: authed.node_id,
        created_at: Utc::now(),
    };
    state.catalog.commit_generated_torrent(&record).await?;
    state
        .catalog
        .upsert_seeder(&SeederRecord {
            torrent_id: record.id,
            node_id: authed.node_id,
            local_path: request.local_path.clone(),
            status: SeederStatus::Seeding,
            uploaded_bytes: 0,
            last_announce: None,
        })
        .await?;
    Ok(Json(torrent_view(&record)))
}

/// `POST /torrents/{info_hash}/seeders`: seeder registration.
pub(crate) async fn register_seeder(
    State(state): State<ApiState>,
    Extension(authed): Extension<AuthedNode>,
    Path(info_hash): Path<String>,
    Json(request): Json<SeederRegisterRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let hash = parse_hash(&info_hash)?;
    let record = state
        .catalog
        .torrent_by_info_hash(&hash)
        .await?
        .ok_or_else(|| ApiError::not_found("torrent not found"))?;
    state
        .catalog
        .upsert_seeder(&SeederRecord {
            torrent_id: record.id,
            node_id: authed.node_id,
            local_path: request.local_path,
            status: SeederStatus::parse(&request.status),
            uploaded_bytes: request.uploaded_bytes,
            last_announce: Some(Utc::now()),
        })
        .await?;
    Ok(Json(AckResponse { ok: true }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct AnnounceAttemptsQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

const fn default_limit() -> i64 {
    50
}

/// `GET /torrents/{info_hash}/announce-attempts`.
pub(crate) async fn announce_attempts(
    State(state): State<ApiState>,
    Path(info_hash): Path<String>,
    Query(query): Query<AnnounceAttemptsQuery>,
) -> Result<Json<Vec<AnnounceAttemptView>>, ApiError> {
    let attempts = state
        .catalog
        .recent_announce_attempts(&info_hash, query.limit.clamp(1, 500))
        .await?;
    Ok(Json(
        attempts
            .into_iter()
            .map(|attempt| AnnounceAttemptView {
                info_hash: attempt.info_hash,
                peer_id: attempt.peer_id,
                ip: attempt.ip,
                port: attempt.port,
                event: attempt.event,
                status: attempt.status,
                reason: attempt.reason,
                created_at: attempt.created_at,
            })
            .collect(),
    ))
}
