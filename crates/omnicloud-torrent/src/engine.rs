//! Engine facade: torrent registration, snapshots, inbound routing, and the
//! periodic watchers.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use omnicloud_events::{Event, EventBus, TorrentState};
use omnicloud_metainfo::{InfoHash, Metainfo};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::storage::{FileMap, StorageBinding};
use crate::torrent::{
    self, SharedStatus, SharedStatusHandle, TorrentCommand, TorrentNotice, TorrentParams,
    TorrentTaskContext,
};
use crate::wire;

/// Cadence of the integrity watcher and seed-health monitor.
const WATCHER_INTERVAL: Duration = Duration::from_secs(60);

/// A torrent announcing but unheard-of for this long re-announces (three
/// default tracker intervals).
const ANNOUNCE_STALE_AFTER: Duration = Duration::from_secs(180);

/// Direct-dial timeout.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Persistence seam for the piece-completion cache.
#[async_trait]
pub trait PieceCache: Send + Sync {
    /// Load every completion row for an info-hash.
    async fn load(&self, info_hash: InfoHash) -> anyhow::Result<Vec<(u32, bool)>>;

    /// Record one piece's verification outcome.
    async fn set(&self, info_hash: InfoHash, piece_index: u32, completed: bool)
    -> anyhow::Result<()>;

    /// Drop every row for an info-hash.
    async fn clear(&self, info_hash: InfoHash) -> anyhow::Result<()>;
}

/// In-memory cache for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryPieceCache {
    rows: StdMutex<HashMap<(InfoHash, u32), bool>>,
}

#[async_trait]
impl PieceCache for MemoryPieceCache {
    async fn load(&self, info_hash: InfoHash) -> anyhow::Result<Vec<(u32, bool)>> {
        let rows = self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(rows
            .iter()
            .filter(|((hash, _), _)| *hash == info_hash)
            .map(|((_, index), completed)| (*index, *completed))
            .collect())
    }

    async fn set(
        &self,
        info_hash: InfoHash,
        piece_index: u32,
        completed: bool,
    ) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        rows.insert((info_hash, piece_index), completed);
        Ok(())
    }

    async fn clear(&self, info_hash: InfoHash) -> anyhow::Result<()> {
        let mut rows = self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        rows.retain(|(hash, _), _| *hash != info_hash);
        Ok(())
    }
}

/// Callbacks the engine uses to surface outcomes; the transfer-error path is
/// the mandatory route for making download failures visible on the hub.
#[async_trait]
pub trait EngineReporter: Send + Sync {
    /// A successful announce with the tracker's swarm counts.
    async fn announce_ok(&self, info_hash: InfoHash, event: &str, complete: u64, incomplete: u64);

    /// A failed announce attempt.
    async fn announce_failed(&self, info_hash: InfoHash, event: &str, reason: &str);

    /// A download-bound torrent hit a terminal error.
    ///
    /// # Errors
    ///
    /// Returns an error if the failure could not be surfaced; the engine
    /// logs it and does not retry.
    async fn transfer_error(
        &self,
        transfer_id: Uuid,
        message: &str,
    ) -> anyhow::Result<()>;

    /// A download completed and verified.
    async fn download_completed(&self, info_hash: InfoHash, transfer_id: Option<Uuid>);

    /// A seeding torrent failed integrity checks and left the swarm.
    async fn integrity_failed(&self, info_hash: InfoHash, reason: &str);
}

/// No-op reporter for tests.
pub struct NullReporter;

#[async_trait]
impl EngineReporter for NullReporter {
    async fn announce_ok(&self, _: InfoHash, _: &str, _: u64, _: u64) {}
    async fn announce_failed(&self, _: InfoHash, _: &str, _: &str) {}
    async fn transfer_error(&self, _: Uuid, _: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn download_completed(&self, _: InfoHash, _: Option<Uuid>) {}
    async fn integrity_failed(&self, _: InfoHash, _: &str) {}
}

/// Outbound connection seam; the relay crate registers a fallback dialer.
#[async_trait]
pub trait PeerDialer: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Open a connection to a peer address.
    async fn dial(&self, addr: SocketAddr) -> std::io::Result<TcpStream>;
}

/// Plain TCP dialer with a bounded timeout; always registered first.
pub struct DirectDialer;

#[async_trait]
impl PeerDialer for DirectDialer {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn dial(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_elapsed| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "direct dial timed out")
            })?
    }
}

/// Engine construction inputs.
pub struct EngineConfig {
    /// Peer id announced to the tracker and in handshakes.
    pub peer_id: [u8; 20],
    /// Requested data port; zero binds an ephemeral port.
    pub data_port: u16,
    /// Addresses that are this node itself; never dialed.
    pub own_addrs: HashSet<SocketAddr>,
}

/// Generate a peer id in the conventional client convention.
#[must_use]
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = *b"-OC0100-000000000000";
    let mut rng = rand::rng();
    for slot in id.iter_mut().skip(8) {
        *slot = rng.random_range(b'0'..=b'9');
    }
    id
}

/// One torrent's lifecycle snapshot, assembled without blocking on peer I/O.
#[derive(Debug, Clone)]
pub struct TorrentSnapshot {
    /// Torrent identity.
    pub info_hash: InfoHash,
    /// Display name from the metainfo.
    pub name: String,
    /// Current lifecycle state.
    pub state: TorrentState,
    /// Bytes verified or downloaded so far.
    pub bytes_done: u64,
    /// Total payload bytes.
    pub bytes_total: u64,
    /// Bytes served to peers.
    pub uploaded: u64,
    /// Connected peer count.
    pub peers: usize,
    /// Download rate in bytes per second.
    pub download_bps: u64,
    /// Upload rate in bytes per second.
    pub upload_bps: u64,
    /// Seconds since the last successful announce, when any.
    pub last_announce_age_s: Option<u64>,
    /// Transfer the torrent is downloading for, when any.
    pub transfer_id: Option<Uuid>,
}

struct TorrentHandle {
    commands: mpsc::Sender<TorrentCommand>,
    shared: SharedStatusHandle,
    files: Arc<FileMap>,
    binding: StorageBinding,
}

struct EngineInner {
    peer_id: [u8; 20],
    data_port: u16,
    own_addrs: HashSet<SocketAddr>,
    torrents: StdMutex<HashMap<InfoHash, TorrentHandle>>,
    dialers: StdMutex<Vec<Arc<dyn PeerDialer>>>,
    cache: Arc<dyn PieceCache>,
    reporter: Arc<dyn EngineReporter>,
    events: EventBus,
    notices_tx: mpsc::Sender<TorrentNotice>,
}

/// The long-lived torrent runtime for one node.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Bind the data listener and start the engine's background tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the data port cannot be bound.
    pub async fn bind(
        config: EngineConfig,
        cache: Arc<dyn PieceCache>,
        reporter: Arc<dyn EngineReporter>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> EngineResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.data_port))
            .await
            .map_err(|source| EngineError::Io {
                operation: "engine.bind",
                path: std::path::PathBuf::new(),
                source,
            })?;
        let data_port = listener
            .local_addr()
            .map_err(|source| EngineError::Io {
                operation: "engine.local_addr",
                path: std::path::PathBuf::new(),
                source,
            })?
            .port();

        // The tracker echoes this node back as a peer when it is also a
        // seeder; never dial ourselves.
        let mut own_addrs = config.own_addrs;
        own_addrs.insert(SocketAddr::from(([127, 0, 0, 1], data_port)));

        let (notices_tx, notices_rx) = mpsc::channel(256);
        let inner = Arc::new(EngineInner {
            peer_id: config.peer_id,
            data_port,
            own_addrs,
            torrents: StdMutex::new(HashMap::new()),
            dialers: StdMutex::new(vec![Arc::new(DirectDialer)]),
            cache,
            reporter,
            events,
            notices_tx,
        });

        let engine = Self { inner };
        engine.spawn_accept_loop(listener, cancel.clone());
        engine.spawn_notice_pump(notices_rx, cancel.clone());
        engine.spawn_watchers(cancel);
        info!(data_port, "torrent engine started");
        Ok(engine)
    }

    /// The resolved peer data port.
    #[must_use]
    pub fn data_port(&self) -> u16 {
        self.inner.data_port
    }

    /// Register an additional dialer, tried after every earlier one.
    pub fn register_dialer(&self, dialer: Arc<dyn PeerDialer>) {
        let mut dialers = self
            .inner
            .dialers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        dialers.push(dialer);
    }

    /// Register a torrent and start its task immediately.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate registrations or unusable metainfo.
    pub fn register(&self, params: TorrentParams) -> EngineResult<InfoHash> {
        let info_hash = params
            .metainfo
            .info
            .info_hash()
            .map_err(|source| EngineError::Metainfo { source })?;

        let files = Arc::new(FileMap::new(&params.metainfo.info, &params.binding));
        let shared: SharedStatusHandle = Arc::new(StdMutex::new(SharedStatus {
            state: TorrentState::Added,
            name: params.metainfo.info.name.clone(),
            bytes_done: 0,
            bytes_total: files.total_bytes(),
            uploaded: 0,
            peers: 0,
            download_bps: 0,
            upload_bps: 0,
            last_announce_ok: None,
            transfer_id: params.transfer_id,
        }));

        let (commands_tx, commands_rx) = mpsc::channel(32);
        {
            let mut torrents = self
                .inner
                .torrents
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if torrents.contains_key(&info_hash) {
                return Err(EngineError::AlreadyRegistered { info_hash });
            }
            torrents.insert(
                info_hash,
                TorrentHandle {
                    commands: commands_tx,
                    shared: Arc::clone(&shared),
                    files: Arc::clone(&files),
                    binding: params.binding.clone(),
                },
            );
        }

        let _ = self.inner.events.publish(Event::TorrentRegistered {
            info_hash: info_hash.to_hex(),
            name: params.metainfo.info.name.clone(),
        });

        let dialers = {
            let guard = self
                .inner
                .dialers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.clone()
        };
        let ctx = TorrentTaskContext {
            params,
            files,
            shared,
            commands: commands_rx,
            notices: self.inner.notices_tx.clone(),
            cache: Arc::clone(&self.inner.cache),
            reporter: Arc::clone(&self.inner.reporter),
            dialers,
            local_peer_id: self.inner.peer_id,
            data_port: self.inner.data_port,
            own_addrs: self.inner.own_addrs.clone(),
        };
        tokio::spawn(torrent::run_torrent(ctx));
        Ok(info_hash)
    }

    /// Convenience: parse metainfo bytes and register.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not parse or registration fails.
    pub fn register_bytes(
        &self,
        meta_bytes: &[u8],
        binding: StorageBinding,
        transfer_id: Option<Uuid>,
        announce_override: Option<String>,
    ) -> EngineResult<InfoHash> {
        let metainfo =
            Metainfo::from_bytes(meta_bytes).map_err(|source| EngineError::Metainfo { source })?;
        let announce_url = announce_override.unwrap_or_else(|| metainfo.announce.clone());
        self.register(TorrentParams {
            metainfo,
            binding,
            transfer_id,
            announce_url,
        })
    }

    /// Remove a torrent, optionally deleting a download binding's data.
    ///
    /// Library and shadow roots are never deleted here; the ingest system
    /// and the dedup resolver own those respectively.
    ///
    /// # Errors
    ///
    /// Returns an error if the torrent is unknown.
    pub async fn remove(&self, info_hash: InfoHash, delete_data: bool) -> EngineResult<()> {
        let handle = {
            let mut torrents = self
                .inner
                .torrents
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            torrents
                .remove(&info_hash)
                .ok_or(EngineError::NotRegistered { info_hash })?
        };
        let _ = handle.commands.send(TorrentCommand::Shutdown).await;
        if let Err(err) = self.inner.cache.clear(info_hash).await {
            warn!(info_hash = %info_hash, error = %err, "piece cache clear failed");
        }
        if delete_data {
            if let StorageBinding::Single { root } = &handle.binding {
                if let Err(err) = tokio::fs::remove_dir_all(root).await {
                    warn!(
                        info_hash = %info_hash,
                        path = %root.display(),
                        error = %err,
                        "download data removal failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Pause a downloading torrent.
    ///
    /// # Errors
    ///
    /// Returns an error if the torrent is unknown.
    pub async fn pause(&self, info_hash: InfoHash) -> EngineResult<()> {
        self.send_command(info_hash, TorrentCommand::Pause).await
    }

    /// Resume a paused torrent.
    ///
    /// # Errors
    ///
    /// Returns an error if the torrent is unknown.
    pub async fn resume(&self, info_hash: InfoHash) -> EngineResult<()> {
        self.send_command(info_hash, TorrentCommand::Resume).await
    }

    /// Force an immediate re-announce.
    ///
    /// # Errors
    ///
    /// Returns an error if the torrent is unknown.
    pub async fn reannounce(&self, info_hash: InfoHash) -> EngineResult<()> {
        self.send_command(info_hash, TorrentCommand::Reannounce)
            .await
    }

    /// A consistent snapshot of every registered torrent; never blocks on
    /// peer or disk I/O.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TorrentSnapshot> {
        let torrents = self
            .inner
            .torrents
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        torrents
            .iter()
            .map(|(info_hash, handle)| {
                let shared = handle
                    .shared
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                TorrentSnapshot {
                    info_hash: *info_hash,
                    name: shared.name.clone(),
                    state: shared.state.clone(),
                    bytes_done: shared.bytes_done,
                    bytes_total: shared.bytes_total,
                    uploaded: shared.uploaded,
                    peers: shared.peers,
                    download_bps: shared.download_bps,
                    upload_bps: shared.upload_bps,
                    last_announce_age_s: shared
                        .last_announce_ok
                        .map(|at| at.elapsed().as_secs()),
                    transfer_id: shared.transfer_id,
                }
            })
            .collect()
    }

    async fn send_command(
        &self,
        info_hash: InfoHash,
        command: TorrentCommand,
    ) -> EngineResult<()> {
        let sender = {
            let torrents = self
                .inner
                .torrents
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            torrents
                .get(&info_hash)
                .ok_or(EngineError::NotRegistered { info_hash })?
                .commands
                .clone()
        };
        sender
            .send(command)
            .await
            .map_err(|_err| EngineError::ChannelClosed {
                operation: "engine.send_command",
            })
    }

    /// Route an inbound peer connection by its handshake info-hash. Exposed
    /// so relay-delivered connections enter the same path as direct accepts.
    pub async fn handle_inbound(&self, mut stream: TcpStream) {
        let handshake = match wire::read_handshake(&mut stream).await {
            Ok(handshake) => handshake,
            Err(err) => {
                debug!(error = %err, "inbound peer sent a bad handshake");
                return;
            }
        };
        let info_hash = InfoHash(handshake.info_hash);
        let sender = {
            let torrents = self
                .inner
                .torrents
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            torrents.get(&info_hash).map(|handle| handle.commands.clone())
        };
        match sender {
            Some(sender) => {
                let _ = sender
                    .send(TorrentCommand::Inbound(stream, handshake))
                    .await;
            }
            None => {
                debug!(info_hash = %info_hash, "inbound peer for unknown torrent dropped");
            }
        }
    }

    fn spawn_accept_loop(&self, listener: TcpListener, cancel: CancellationToken) {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                debug!(peer = %addr, "inbound peer connection");
                                let engine = engine.clone();
                                tokio::spawn(async move {
                                    engine.handle_inbound(stream).await;
                                });
                            }
                            Err(err) => {
                                warn!(error = %err, "peer accept failed");
                            }
                        }
                    }
                }
            }
        });
    }

    fn spawn_notice_pump(
        &self,
        mut notices_rx: mpsc::Receiver<TorrentNotice>,
        cancel: CancellationToken,
    ) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    notice = notices_rx.recv() => {
                        let Some(notice) = notice else { break };
                        dispatch_notice(&inner, notice).await;
                    }
                }
            }
        });
    }

    fn spawn_watchers(&self, cancel: CancellationToken) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(WATCHER_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so freshly
            // registered torrents get a full interval before checks.
            tick.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        engine.run_integrity_pass().await;
                        engine.run_seed_health_pass().await;
                    }
                }
            }
        });
    }

    async fn run_integrity_pass(&self) {
        let seeding: Vec<(InfoHash, Arc<FileMap>)> = {
            let torrents = self
                .inner
                .torrents
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            torrents
                .iter()
                .filter(|(_, handle)| {
                    let shared = handle
                        .shared
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    shared.state == TorrentState::Seeding
                })
                .map(|(info_hash, handle)| (*info_hash, Arc::clone(&handle.files)))
                .collect()
        };

        for (info_hash, files) in seeding {
            if let Err(failure) = files.check_files().await {
                let reason = match failure.actual {
                    Some(actual) => format!(
                        "{} shrunk to {actual} bytes (expected {})",
                        failure.path.display(),
                        failure.expected
                    ),
                    None => format!("{} missing", failure.path.display()),
                };
                warn!(info_hash = %info_hash, reason = %reason, "integrity check failed");
                self.mark_error(info_hash, &reason).await;
                self.inner.reporter.integrity_failed(info_hash, &reason).await;
            }
        }
    }

    async fn run_seed_health_pass(&self) {
        for snapshot in self.snapshot() {
            info!(
                info_hash = %snapshot.info_hash,
                state = ?snapshot.state,
                peers = snapshot.peers,
                last_announce_success_age = ?snapshot.last_announce_age_s,
                "seed health"
            );
            let stale = snapshot
                .last_announce_age_s
                .is_some_and(|age| age > ANNOUNCE_STALE_AFTER.as_secs());
            if stale && matches!(snapshot.state, TorrentState::Seeding) {
                debug!(info_hash = %snapshot.info_hash, "stale announce; re-announcing");
                let _ = self.reannounce(snapshot.info_hash).await;
            }
        }
    }

    async fn mark_error(&self, info_hash: InfoHash, reason: &str) {
        let handle = {
            let torrents = self
                .inner
                .torrents
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            torrents.get(&info_hash).map(|handle| {
                (handle.commands.clone(), Arc::clone(&handle.shared))
            })
        };
        if let Some((commands, shared)) = handle {
            {
                let mut shared = shared
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                shared.state = TorrentState::Error {
                    reason: reason.to_string(),
                };
            }
            let _ = commands.send(TorrentCommand::Shutdown).await;
            let _ = self.inner.events.publish(Event::TorrentStateChanged {
                info_hash: info_hash.to_hex(),
                state: TorrentState::Error {
                    reason: reason.to_string(),
                },
            });
        }
    }
}

async fn dispatch_notice(inner: &Arc<EngineInner>, notice: TorrentNotice) {
    match notice {
        TorrentNotice::StateChanged { info_hash, state } => {
            let _ = inner.events.publish(Event::TorrentStateChanged {
                info_hash: info_hash.to_hex(),
                state,
            });
        }
        TorrentNotice::DownloadCompleted {
            info_hash,
            transfer_id,
        } => {
            let download_path = {
                let torrents = inner
                    .torrents
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                torrents.get(&info_hash).map_or_else(String::new, |handle| {
                    match &handle.binding {
                        StorageBinding::Single { root } => root.display().to_string(),
                        StorageBinding::Split { media_root, .. } => {
                            media_root.display().to_string()
                        }
                    }
                })
            };
            let _ = inner.events.publish(Event::TorrentCompleted {
                info_hash: info_hash.to_hex(),
                download_path,
            });
            inner
                .reporter
                .download_completed(info_hash, transfer_id)
                .await;
        }
        TorrentNotice::DownloadError {
            info_hash,
            transfer_id,
            message,
        } => {
            warn!(info_hash = %info_hash, message = %message, "download error");
            if let Some(transfer_id) = transfer_id {
                if let Err(err) = inner.reporter.transfer_error(transfer_id, &message).await {
                    warn!(
                        transfer_id = %transfer_id,
                        error = %err,
                        "transfer error could not be surfaced to the hub"
                    );
                }
            }
        }
        TorrentNotice::IntegrityFailed { info_hash, reason } => {
            inner.reporter.integrity_failed(info_hash, &reason).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_ids_carry_the_client_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-OC0100-");
        assert!(id[8..].iter().all(u8::is_ascii_digit));
        assert_ne!(generate_peer_id(), generate_peer_id());
    }
}
