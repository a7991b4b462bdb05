//! Site-role wiring: registration, engine and relay startup, the control
//! client, and the orchestration loops.

pub mod control_glue;
pub mod dedup;
pub mod queue_manager;
pub mod transfer_runner;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use omnicloud_api_models::RegisterRequest;
use omnicloud_catalog::CatalogStore;
use omnicloud_config::Config;
use omnicloud_events::{Event, EventBus};
use omnicloud_relay::{RelayClient, RelayDialer};
use omnicloud_torrent::{Engine, EngineConfig, generate_peer_id};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backoff::Backoff;
use crate::hub_client::{HubClient, NodeIdentity};
use crate::reporters::{CatalogPieceCache, SiteEngineReporter, TransferSignal};

/// One package as reported by the scanner collaborator.
#[derive(Debug, Clone)]
pub struct LocalPackage {
    /// Per-delivery fingerprint (ASSETMAP UUID).
    pub outer_fp: String,
    /// Composition fingerprint (CPL UUID).
    pub inner_fp: String,
    /// Human-readable title.
    pub title: String,
    /// Content kind label.
    pub kind: String,
    /// Total payload bytes.
    pub size_bytes: i64,
    /// Number of payload files.
    pub file_count: i64,
    /// Absolute package directory.
    pub local_path: PathBuf,
}

/// Attachment point for the out-of-scope scanner: whatever watches the
/// library reports its current view here.
#[async_trait]
pub trait InventorySource: Send + Sync {
    /// The current set of local packages.
    async fn scan(&self) -> Result<Vec<LocalPackage>>;
}

/// Placeholder source until the scanner collaborator attaches.
pub struct NullInventorySource;

#[async_trait]
impl InventorySource for NullInventorySource {
    async fn scan(&self) -> Result<Vec<LocalPackage>> {
        Ok(Vec::new())
    }
}

/// Everything the site loops share.
pub struct SiteContext {
    /// Immutable node configuration.
    pub config: Config,
    /// Authenticated identity for hub calls.
    pub identity: NodeIdentity,
    /// Hub API client.
    pub hub: HubClient,
    /// Local catalog (checkpoints, piece cache, ingestion, queue mirror).
    pub catalog: CatalogStore,
    /// The torrent engine.
    pub engine: Engine,
    /// Shared event bus.
    pub events: EventBus,
    /// Tracker announce URL for generated torrents.
    pub announce_url: String,
    /// Package count from the last scan, reported on heartbeats.
    pub package_count: AtomicI64,
    /// Public IP learned from the NAT probe.
    pub public_ip: std::sync::Mutex<Option<String>>,
    /// Whether the control channel is currently attached; the legacy poll
    /// path only acts while it is not.
    pub control_connected: AtomicBool,
}

/// How often the index cycle (scan, dedup, generation) runs.
const INDEX_INTERVAL: Duration = Duration::from_secs(60);

/// How often the legacy command poll runs while the control channel is
/// down.
const LEGACY_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Heartbeat cadence on the plain HTTP path.
const HTTP_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Run the site role to completion.
///
/// # Errors
///
/// Returns an error if startup wiring fails; loop failures are retried, not
/// propagated.
pub async fn run_site(
    config: Config,
    inventory: Arc<dyn InventorySource>,
    cancel: CancellationToken,
) -> Result<()> {
    tokio::fs::create_dir_all(&config.torrent_root)
        .await
        .context("torrent root creation failed")?;
    tokio::fs::create_dir_all(config.download_root())
        .await
        .context("download root creation failed")?;
    tokio::fs::create_dir_all(config.shadow_root())
        .await
        .context("shadow root creation failed")?;

    let catalog = CatalogStore::open(&config.catalog_path)
        .await
        .context("local catalog open failed")?;
    let repaired = catalog
        .delete_incomplete_piece_records()
        .await
        .context("piece-completion repair failed")?;
    if repaired > 0 {
        info!(repaired, "incomplete piece-completion rows dropped at startup");
    }

    let hub_url = config
        .hub_url
        .clone()
        .context("site role requires a hub url")?;
    let hub = HubClient::new(&hub_url).context("hub client construction failed")?;
    let identity = register_until_authorized(&config, &hub, &cancel).await?;
    info!(node_id = %identity.node_id, "site registered and authorized");

    let hub_host = reqwest::Url::parse(&hub_url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .context("hub url has no host")?;
    let announce_url = config.announce_url(&hub_host);

    let events = EventBus::new();
    let (signals_tx, signals_rx) = mpsc::channel::<TransferSignal>(32);
    let reporter = Arc::new(SiteEngineReporter::new(
        hub.clone(),
        events.clone(),
        signals_tx,
    ));
    let engine = Engine::bind(
        EngineConfig {
            peer_id: generate_peer_id(),
            data_port: config.torrent_data_port,
            own_addrs: HashSet::new(),
        },
        Arc::new(CatalogPieceCache::new(catalog.clone())),
        reporter,
        events.clone(),
        cancel.clone(),
    )
    .await
    .context("engine bind failed")?;

    let context = Arc::new(SiteContext {
        config,
        identity,
        hub,
        catalog,
        engine,
        events,
        announce_url,
        package_count: AtomicI64::new(0),
        public_ip: std::sync::Mutex::new(None),
        control_connected: AtomicBool::new(false),
    });

    start_relay_if_natted(&context, &hub_host, &cancel).await;
    control_glue::start_control_client(&context, &cancel);
    spawn_connectivity_tracker(&context, &cancel);

    let index_loop = spawn_index_loop(Arc::clone(&context), Arc::clone(&inventory), cancel.clone());
    let transfer_loop = tokio::spawn(transfer_runner::run(
        Arc::clone(&context),
        signals_rx,
        cancel.clone(),
    ));
    let legacy_loop = spawn_legacy_poll(Arc::clone(&context), cancel.clone());
    let heartbeat_loop = spawn_http_heartbeat(Arc::clone(&context), cancel.clone());

    cancel.cancelled().await;
    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        let _ = index_loop.await;
        let _ = transfer_loop.await;
        let _ = legacy_loop.await;
        let _ = heartbeat_loop.await;
    })
    .await;
    Ok(())
}

/// Register with the hub, retrying with backoff, then wait for an operator
/// to authorize the node.
async fn register_until_authorized(
    config: &Config,
    hub: &HubClient,
    cancel: &CancellationToken,
) -> Result<NodeIdentity> {
    let mac = read_mac_address();
    let request = RegisterRequest {
        name: config.node_name.clone(),
        mac: mac.clone(),
        registration_key: config.registration_key.clone(),
        role: Some(config.role.as_str().to_string()),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
        public_endpoint: None,
    };

    let mut backoff = Backoff::for_hub_calls();
    loop {
        if cancel.is_cancelled() {
            anyhow::bail!("cancelled during registration");
        }
        match hub.register(&request).await {
            Ok(response) if response.node.authorized => {
                return Ok(NodeIdentity {
                    node_id: response.node.id,
                    mac,
                    registration_key: config.registration_key.clone(),
                });
            }
            Ok(response) => {
                info!(
                    node_id = %response.node.id,
                    "registered; waiting for operator authorization"
                );
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Err(err) => {
                warn!(error = %err, "registration attempt failed");
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
    }
}

/// Probe reachability; behind NAT with the relay enabled, start the relay
/// client and register the relay dialer with the engine.
async fn start_relay_if_natted(
    context: &Arc<SiteContext>,
    hub_host: &str,
    cancel: &CancellationToken,
) {
    let probe = context
        .hub
        .nat_check(&context.identity, context.engine.data_port())
        .await;
    let (reachable, external_ip) = match probe {
        Ok(response) => (response.reachable, response.external_ip),
        Err(err) => {
            warn!(error = %err, "nat probe failed; assuming unreachable");
            (false, String::new())
        }
    };
    {
        let mut public_ip = context
            .public_ip
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *public_ip = (!external_ip.is_empty()).then(|| external_ip.clone());
    }
    if reachable || !context.config.relay_enabled {
        info!(reachable, "nat probe complete; relay client not needed");
        return;
    }
    if external_ip.is_empty() {
        warn!("no external ip known; relay registration would be unroutable");
        return;
    }

    let relay_addr = format!("{hub_host}:{}", context.config.relay_port);
    let adv_addr = format!("{external_ip}:{}", context.engine.data_port());
    info!(relay = %relay_addr, adv_addr = %adv_addr, "starting relay client");

    let mut listener = RelayClient::start(relay_addr.clone(), adv_addr, cancel.clone());
    let engine = context.engine.clone();
    tokio::spawn(async move {
        // Relayed inbound connections enter the same accept path as direct
        // ones.
        while let Some(stream) = listener.accept().await {
            engine.handle_inbound(stream).await;
        }
    });
    context
        .engine
        .register_dialer(Arc::new(RelayDialer::new(relay_addr)));
}

/// Track control-channel state off the event bus for the legacy poll guard.
fn spawn_connectivity_tracker(context: &Arc<SiteContext>, cancel: &CancellationToken) {
    let context = Arc::clone(context);
    let cancel = cancel.clone();
    let mut stream = context.events.subscribe(None);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                envelope = stream.next() => {
                    let Some(envelope) = envelope else { break };
                    match envelope.event {
                        Event::ControlConnected { .. } => {
                            context
                                .control_connected
                                .store(true, std::sync::atomic::Ordering::Relaxed);
                        }
                        Event::ControlDisconnected { .. } => {
                            context
                                .control_connected
                                .store(false, std::sync::atomic::Ordering::Relaxed);
                        }
                        _ => {}
                    }
                }
            }
        }
    });
}

fn spawn_index_loop(
    context: Arc<SiteContext>,
    inventory: Arc<dyn InventorySource>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(INDEX_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(err) =
                        queue_manager::run_index_cycle(&context, inventory.as_ref(), &cancel).await
                    {
                        warn!(error = %err, "index cycle failed; retrying next interval");
                    }
                }
            }
        }
    })
}

/// Legacy command poll for sites without a live control channel. The
/// control channel is authoritative; this loop only acts while it is down,
/// and the hub marks commands delivered per path, so a command is never
/// applied twice.
fn spawn_legacy_poll(
    context: Arc<SiteContext>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(LEGACY_POLL_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if context
                        .control_connected
                        .load(std::sync::atomic::Ordering::Relaxed)
                    {
                        continue;
                    }
                    if let Err(err) = poll_legacy_commands(&context).await {
                        warn!(error = %err, "legacy command poll failed");
                    }
                }
            }
        }
    })
}

async fn poll_legacy_commands(context: &Arc<SiteContext>) -> Result<()> {
    let response = context.hub.pending_action(&context.identity).await?;
    let Some(command) = response.command else {
        return Ok(());
    };
    info!(command_id = %command.id, kind = %command.kind, "legacy command received");
    let outcome = control_glue::execute_command_label(context, &command.kind, command.payload).await;
    context
        .hub
        .action_done(
            &context.identity,
            &omnicloud_api_models::ActionDoneRequest {
                command_id: command.id,
                success: outcome.success,
                message: Some(outcome.message),
            },
        )
        .await?;
    Ok(())
}

fn spawn_http_heartbeat(
    context: Arc<SiteContext>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(HTTP_HEARTBEAT_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let request = omnicloud_api_models::HeartbeatRequest {
                        version: Some(env!("CARGO_PKG_VERSION").to_string()),
                        public_endpoint: None,
                    };
                    if let Err(err) = context.hub.heartbeat(&context.identity, &request).await {
                        warn!(error = %err, "http heartbeat failed");
                    }
                }
            }
        }
    })
}

/// First non-loopback interface MAC, or a zero MAC when none is readable.
/// The MAC is half of the node's identity key.
fn read_mac_address() -> String {
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return "00:00:00:00:00:00".to_string();
    };
    let mut names: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| name != "lo")
        .collect();
    names.sort();
    for name in names {
        if let Ok(address) = std::fs::read_to_string(format!("/sys/class/net/{name}/address")) {
            let address = address.trim();
            if !address.is_empty() && address != "00:00:00:00:00:00" {
                return address.to_string();
            }
        }
    }
    "00:00:00:00:00:00".to_string()
}
