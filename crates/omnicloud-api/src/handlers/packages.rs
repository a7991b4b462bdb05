//! Package surfaces: listing, detail, and canonical XML custody for dedup
//! co-seeding.

use axum::Json;
use axum::extract::{Path, Query, State};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use uuid::Uuid;

use omnicloud_api_models::{
    AckResponse, CanonicalXmlFile, CanonicalXmlPayload, PackageView,
};
use omnicloud_catalog::PackageRecord;

use crate::error::ApiError;
use crate::state::ApiState;

fn package_view(record: &PackageRecord, holders: Vec<Uuid>) -> PackageView {
    PackageView {
        id: record.id,
        outer_fp: record.outer_fp.clone(),
        inner_fp: record.inner_fp.clone(),
        title: record.title.clone(),
        kind: record.kind.clone(),
        size_bytes: record.size_bytes,
        file_count: record.file_count,
        discovered_at: record.discovered_at,
        holders,
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PackageListQuery {
    #[serde(default)]
    title: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
}

const fn default_limit() -> i64 {
    100
}

/// `GET /packages`.
pub(crate) async fn list_packages(
    State(state): State<ApiState>,
    Query(query): Query<PackageListQuery>,
) -> Result<Json<Vec<PackageView>>, ApiError> {
    let records = state
        .catalog
        .list_packages(query.title.as_deref(), query.limit.clamp(1, 1000))
        .await?;
    let mut views = Vec::with_capacity(records.len());
    for record in &records {
        views.push(package_view(record, Vec::new()));
    }
    Ok(Json(views))
}

/// `GET /packages/{id}`: detail with current holders.
pub(crate) async fn get_package(
    State(state): State<ApiState>,
    Path(package_id): Path<Uuid>,
) -> Result<Json<PackageView>, ApiError> {
    let record = state
        .catalog
        .package(package_id)
        .await?
        .ok_or_else(|| ApiError::not_found("package not found"))?;
    let holders = state
        .catalog
        .holders_of_package(package_id)
        .await?
        .into_iter()
        .map(|entry| entry.node_id)
        .collect();
    Ok(Json(package_view(&record, holders)))
}

/// `POST /packages/{id}/canonical-xml`: the canonical holder uploads the
/// composition's XML bytes so duplicate holders can co-seed.
pub(crate) async fn put_canonical_xml(
    State(state): State<ApiState>,
    Path(package_id): Path<Uuid>,
    Json(payload): Json<CanonicalXmlPayload>,
) -> Result<Json<AckResponse>, ApiError> {
    if state.catalog.package(package_id).await?.is_none() {
        return Err(ApiError::not_found("package not found"));
    }
    let mut files = Vec::with_capacity(payload.files.len());
    for file in &payload.files {
        let content = BASE64
            .decode(&file.content_b64)
            .map_err(|_err| ApiError::bad_request("content_b64 is not valid base64"))?;
        files.push((file.rel_path.clone(), content));
    }
    state.catalog.put_canonical_xml(package_id, &files).await?;
    Ok(Json(AckResponse { ok: true }))
}

/// `GET /packages/{id}/canonical-xml`.
pub(crate) async fn get_canonical_xml(
    State(state): State<ApiState>,
    Path(package_id): Path<Uuid>,
) -> Result<Json<CanonicalXmlPayload>, ApiError> {
    let files = state.catalog.canonical_xml(package_id).await?;
    if files.is_empty() {
        return Err(ApiError::not_found("no canonical xml for package"));
    }
    Ok(Json(CanonicalXmlPayload {
        files: files
            .into_iter()
            .map(|(rel_path, content)| CanonicalXmlFile {
                rel_path,
                content_b64: BASE64.encode(content),
            })
            .collect(),
    }))
}
