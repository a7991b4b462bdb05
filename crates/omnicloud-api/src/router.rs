//! Router construction and server host for the hub API.

use std::net::SocketAddr;

use axum::Router;
use axum::http::Request;
use axum::middleware;
use axum::routing::{delete, get, post, put};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::require_node;
use crate::handlers::{
    self, packages, servers, torrents, transfers, ws,
};
use crate::state::ApiState;

/// Axum router wrapper hosting the hub API.
pub struct ApiServer {
    router: Router,
}

impl ApiServer {
    /// Construct the router with every surface mounted under `/api/v1`.
    #[must_use]
    pub fn new(state: ApiState) -> Self {
        // Site-authenticated surfaces carry the identity-header middleware;
        // operator/UI surfaces ride out-of-scope session cookies and mount
        // without it.
        let node_routes = Router::new()
            .route("/servers/{id}/heartbeat", post(servers::heartbeat))
            .route(
                "/servers/{id}/pending-transfers",
                get(servers::pending_transfers),
            )
            .route("/servers/{id}/torrent-status", post(servers::torrent_status))
            .route("/servers/{id}/inventory", post(servers::inventory_upload))
            .route("/servers/{id}/pending-action", get(servers::pending_action))
            .route("/servers/{id}/action-done", post(servers::action_done))
            .route("/servers/{id}/nat-check", get(servers::nat_check))
            .route("/torrent-queue/check", get(servers::queue_check))
            .route(
                "/torrents/{info_hash}/seeders",
                post(torrents::register_seeder),
            )
            .layer(middleware::from_fn_with_state(
                state.clone(),
                require_node,
            ));

        let open_routes = Router::new()
            .route("/health", get(handlers::health))
            .route("/servers/register", post(servers::register))
            .route("/servers", get(servers::list_servers))
            .route("/servers/{id}/authorize", post(servers::authorize))
            .route(
                "/servers/{id}/content/{package_id}",
                delete(servers::delete_content),
            )
            .route(
                "/servers/{id}/settings",
                get(servers::get_settings).put(servers::put_settings),
            )
            .route(
                "/servers/{id}/library-locations",
                post(servers::add_library_location),
            )
            .route(
                "/servers/{id}/library-locations/{loc_id}",
                put(servers::update_library_location).delete(servers::delete_library_location),
            )
            .route("/activity", get(servers::activity))
            .route("/torrent-queue", get(servers::queue_list))
            // The commit POST authenticates in the handler; the GET is an
            // operator surface on the same path.
            .route(
                "/torrents",
                get(torrents::list_torrents).post(torrents::commit_torrent),
            )
            .route("/torrents/{info_hash}", get(torrents::get_torrent))
            .route("/torrents/{info_hash}/file", get(torrents::torrent_file))
            .route(
                "/torrents/{info_hash}/announce-attempts",
                get(torrents::announce_attempts),
            )
            .route("/tracker/live", get(handlers::tracker_live))
            .route("/relay/stats", get(handlers::relay_stats))
            .route(
                "/transfers",
                post(transfers::create_transfer).get(transfers::list_transfers),
            )
            .route(
                "/transfers/{id}",
                put(transfers::report_progress).delete(transfers::cancel_transfer),
            )
            .route("/transfers/{id}/command", post(transfers::set_command))
            .route("/packages", get(packages::list_packages))
            .route("/packages/{id}", get(packages::get_package))
            .route(
                "/packages/{id}/canonical-xml",
                get(packages::get_canonical_xml).post(packages::put_canonical_xml),
            );

        let api = Router::new().merge(node_routes).merge(open_routes);
        let router = Router::new()
            .nest("/api/v1", api)
            .route("/ws", get(ws::control_upgrade))
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                    tracing::info_span!(
                        "http.request",
                        method = %request.method(),
                        route = %request.uri().path(),
                    )
                }),
            )
            .with_state(state);

        Self { router }
    }

    /// Consume the wrapper, yielding the router for custom hosting.
    #[must_use]
    pub fn into_router(self) -> Router {
        self.router
    }
}

/// Serve the API until cancelled.
///
/// # Errors
///
/// Returns an error if the server fails to start or crashes.
pub async fn serve(
    state: ApiState,
    listener: TcpListener,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "hub api listening");
    let app = ApiServer::new(state)
        .into_router()
        .into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
