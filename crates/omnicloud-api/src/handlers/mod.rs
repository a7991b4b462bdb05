//! Route handlers, grouped by surface.

pub mod packages;
pub mod servers;
pub mod torrents;
pub mod transfers;
pub mod ws;

use axum::Json;
use axum::extract::State;
use omnicloud_api_models::HealthResponse;

use crate::state::ApiState;

/// `GET /health`: liveness plus a catalog ping.
pub(crate) async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let catalog_ok = state.catalog.ping().await.is_ok();
    Json(HealthResponse {
        status: if catalog_ok { "ok" } else { "degraded" }.to_string(),
        catalog_ok,
        version: state.config.version.clone(),
    })
}

/// `GET /tracker/live`: the tracker snapshot.
pub(crate) async fn tracker_live(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let snapshot = state.tracker.snapshot();
    Json(serde_json::json!({ "swarms": snapshot }))
}

/// `GET /relay/stats`: relay counters, when the relay is enabled.
pub(crate) async fn relay_stats(State(state): State<ApiState>) -> Json<serde_json::Value> {
    match &state.relay {
        Some(relay) => {
            let stats = relay.stats();
            Json(serde_json::json!({
                "enabled": true,
                "registered": stats.registered,
                "active_sessions": stats.active_sessions,
                "total_sessions": stats.total_sessions,
                "bytes_relayed": stats.bytes_relayed,
            }))
        }
        None => Json(serde_json::json!({ "enabled": false })),
    }
}
