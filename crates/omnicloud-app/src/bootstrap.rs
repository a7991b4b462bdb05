//! Application bootstrap: configuration, logging, role dispatch, shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use omnicloud_config::NodeRole;
use omnicloud_telemetry::{LogFormat, LoggingConfig, init_logging};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::hub;
use crate::site;

/// Load configuration, start the role's services, and block until shutdown.
///
/// # Errors
///
/// Returns an error when configuration is invalid or startup wiring fails.
pub async fn run_app() -> Result<()> {
    let config = omnicloud_config::load_from_env().context("configuration load failed")?;
    init_logging(&LoggingConfig {
        level: &config.log_level,
        format: LogFormat::parse(&config.log_format),
        version: env!("CARGO_PKG_VERSION"),
    })
    .context("logging initialisation failed")?;

    info!(
        role = %config.role,
        node = %config.node_name,
        version = env!("CARGO_PKG_VERSION"),
        "omnicloud starting"
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match config.role {
        NodeRole::Hub => hub::run_hub(config, cancel).await,
        NodeRole::Site => {
            // The scanner collaborator replaces the null source when it
            // attaches; until then the site serves transfers and co-seeding
            // driven by hub assignments.
            site::run_site(config, Arc::new(site::NullInventorySource), cancel).await
        }
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            cancel.cancel();
        }
    });
}
