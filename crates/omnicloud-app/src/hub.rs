//! Hub-role wiring: catalog, tracker, relay, control hub, API, and the
//! stale-claim sweep.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use omnicloud_api::{ApiState, HubHandlerImpl};
use omnicloud_api::state::{ActivityStore, ApiConfig};
use omnicloud_catalog::CatalogStore;
use omnicloud_config::Config;
use omnicloud_control::ControlHub;
use omnicloud_relay::{RelayServer, RelayServerConfig};
use omnicloud_telemetry::Metrics;
use omnicloud_tracker::{Tracker, TrackerConfig};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::reporters::CatalogAnnounceLog;

/// Stale hash claims are swept on this cadence.
const CLAIM_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Run the hub role to completion.
///
/// # Errors
///
/// Returns an error if startup wiring fails.
pub async fn run_hub(config: Config, cancel: CancellationToken) -> Result<()> {
    tokio::fs::create_dir_all(&config.torrent_root)
        .await
        .context("torrent root creation failed")?;
    let catalog = CatalogStore::open(&config.catalog_path)
        .await
        .context("catalog open failed")?;
    let repaired = catalog
        .delete_incomplete_piece_records()
        .await
        .context("piece-completion repair failed")?;
    if repaired > 0 {
        info!(repaired, "incomplete piece-completion rows dropped at startup");
    }

    let metrics = Metrics::new().context("metrics registry failed")?;

    // The relay hint rides every tracker reply once the relay is up, so
    // NATted downloaders learn the fallback path without extra round trips.
    let relay = if config.relay_enabled {
        let listener = TcpListener::bind(("0.0.0.0", config.relay_port))
            .await
            .context("relay listener bind failed")?;
        let server = RelayServer::new(RelayServerConfig::default());
        tokio::spawn(Arc::clone(&server).run(listener, cancel.clone()));
        Some(server)
    } else {
        None
    };

    let relay_hint = match (&relay, &config.advertise_host) {
        (Some(_), Some(host)) => Some((host.clone(), config.relay_port)),
        (Some(_), None) => {
            warn!("relay enabled without an advertise host; replies carry no relay hint");
            None
        }
        (None, _) => None,
    };
    let tracker = Arc::new(Tracker::new(TrackerConfig {
        interval: Duration::from_secs(60),
        advertise_host: config.advertise_host.clone(),
        relay_hint,
    }));
    let tracker_listener = TcpListener::bind(("0.0.0.0", config.tracker_port))
        .await
        .context("tracker listener bind failed")?;
    tokio::spawn(omnicloud_tracker::serve(
        Arc::clone(&tracker),
        Arc::new(CatalogAnnounceLog::new(catalog.clone())),
        tracker_listener,
        cancel.clone(),
    ));

    let activity = Arc::new(ActivityStore::default());
    let control = ControlHub::new(Arc::new(HubHandlerImpl::new(
        catalog.clone(),
        Arc::clone(&activity),
        metrics.clone(),
    )));

    let api_state = ApiState {
        catalog: catalog.clone(),
        tracker,
        control,
        relay,
        metrics,
        config: ApiConfig {
            registration_key: config.registration_key.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        activity,
    };
    let api_listener = TcpListener::bind(("0.0.0.0", config.api_port))
        .await
        .context("api listener bind failed")?;
    let api_task = tokio::spawn(omnicloud_api::serve(
        api_state,
        api_listener,
        cancel.clone(),
    ));

    let sweep_task = spawn_claim_sweep(catalog, cancel.clone());

    info!(
        api_port = config.api_port,
        tracker_port = config.tracker_port,
        relay_enabled = config.relay_enabled,
        "hub started"
    );

    cancel.cancelled().await;
    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        let _ = api_task.await;
        let _ = sweep_task.await;
    })
    .await;
    Ok(())
}

/// Delete claims older than the TTL whose queue items stopped syncing.
fn spawn_claim_sweep(
    catalog: CatalogStore,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(CLAIM_SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => {
                    match catalog.sweep_stale_claims().await {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "stale claims swept"),
                        Err(err) => warn!(error = %err, "claim sweep failed"),
                    }
                }
            }
        }
    })
}
