//! The per-torrent task.
//!
//! One task per torrent owns verification, peer scheduling, announces, and
//! the lifecycle state machine: `Added → Verifying → (Seeding | Downloading)
//! → Completed → Seeding`, with `Error` reachable from anywhere and `Paused`
//! only from `Downloading`.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use omnicloud_events::TorrentState;
use omnicloud_metainfo::{InfoHash, Metainfo};
use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::announce::{AnnounceClient, AnnounceEvent, AnnounceRequest};
use crate::engine::{EngineReporter, PeerDialer, PieceCache};
use crate::peer::{self, PeerCommand, PeerEvent, PeerKey, PeerSessionParams};
use crate::storage::{FileMap, StorageBinding};
use crate::wire::Bitfield;

/// Base delay for announce retry backoff.
const ANNOUNCE_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Cadence of snapshot/rate refreshes.
const STATUS_TICK: Duration = Duration::from_secs(1);

/// Registration inputs for one torrent.
pub struct TorrentParams {
    /// Parsed metainfo.
    pub metainfo: Metainfo,
    /// Where payload bytes live.
    pub binding: StorageBinding,
    /// Set when the torrent was registered for a transfer download; `None`
    /// means seed existing content.
    pub transfer_id: Option<Uuid>,
    /// Tracker announce URL.
    pub announce_url: String,
}

/// Mutable status shared with the engine's snapshot API.
pub(crate) struct SharedStatus {
    pub(crate) state: TorrentState,
    pub(crate) name: String,
    pub(crate) bytes_done: u64,
    pub(crate) bytes_total: u64,
    pub(crate) uploaded: u64,
    pub(crate) peers: usize,
    pub(crate) download_bps: u64,
    pub(crate) upload_bps: u64,
    pub(crate) last_announce_ok: Option<Instant>,
    pub(crate) transfer_id: Option<Uuid>,
}

pub(crate) type SharedStatusHandle = Arc<StdMutex<SharedStatus>>;

/// Commands from the engine to a torrent task.
pub(crate) enum TorrentCommand {
    /// Hand an accepted inbound peer socket to the torrent, along with the
    /// handshake the engine consumed while routing.
    Inbound(TcpStream, crate::wire::Handshake),
    /// Pause a download; only honored in the `Downloading` state.
    Pause,
    /// Resume a paused download.
    Resume,
    /// Re-announce immediately.
    Reannounce,
    /// Stop the task; data stays on disk.
    Shutdown,
}

/// Notifications from a torrent task to the engine supervisor.
pub(crate) enum TorrentNotice {
    /// The task entered a new state.
    StateChanged {
        info_hash: InfoHash,
        state: TorrentState,
    },
    /// A download completed and verified.
    DownloadCompleted {
        info_hash: InfoHash,
        transfer_id: Option<Uuid>,
    },
    /// A download-bound torrent hit a terminal error.
    DownloadError {
        info_hash: InfoHash,
        transfer_id: Option<Uuid>,
        message: String,
    },
    /// A seeding torrent failed integrity checks.
    IntegrityFailed { info_hash: InfoHash, reason: String },
}

/// Everything the spawned task needs.
pub(crate) struct TorrentTaskContext {
    pub(crate) params: TorrentParams,
    pub(crate) files: Arc<FileMap>,
    pub(crate) shared: SharedStatusHandle,
    pub(crate) commands: mpsc::Receiver<TorrentCommand>,
    pub(crate) notices: mpsc::Sender<TorrentNotice>,
    pub(crate) cache: Arc<dyn PieceCache>,
    pub(crate) reporter: Arc<dyn EngineReporter>,
    pub(crate) dialers: Vec<Arc<dyn PeerDialer>>,
    pub(crate) local_peer_id: [u8; 20],
    pub(crate) data_port: u16,
    pub(crate) own_addrs: HashSet<SocketAddr>,
}

struct PeerCtl {
    commands: mpsc::Sender<PeerCommand>,
    addr: SocketAddr,
    availability: Bitfield,
    assigned: Option<u32>,
    ready: bool,
}

struct TaskState {
    info_hash: InfoHash,
    missing: HashSet<u32>,
    peers: HashMap<PeerKey, PeerCtl>,
    next_peer_key: PeerKey,
    have_tx: watch::Sender<Bitfield>,
    uploaded: u64,
    downloaded_window: u64,
    uploaded_window: u64,
    connecting: HashSet<SocketAddr>,
    paused: bool,
}

pub(crate) async fn run_torrent(mut ctx: TorrentTaskContext) {
    let info_hash = match ctx.params.metainfo.info.info_hash() {
        Ok(hash) => hash,
        Err(err) => {
            warn!(error = %err, "torrent task could not hash its own metainfo");
            return;
        }
    };

    set_state(&ctx, info_hash, TorrentState::Verifying).await;

    let missing = match verify_payload(&ctx, info_hash).await {
        Ok(missing) => missing,
        Err(reason) => {
            enter_error(&ctx, info_hash, reason).await;
            return;
        }
    };

    let downloading = !missing.is_empty();
    if downloading && ctx.params.transfer_id.is_none() {
        // Seed registrations must verify completely; a hole is integrity,
        // not a download opportunity.
        let reason = format!("{} pieces failed verification", missing.len());
        let _ = ctx
            .notices
            .send(TorrentNotice::IntegrityFailed { info_hash, reason: reason.clone() })
            .await;
        enter_error(&ctx, info_hash, reason).await;
        return;
    }

    let pieces_count = ctx.files.pieces_count();
    let mut have = Bitfield::with_piece_count(pieces_count);
    for index in 0..pieces_count {
        if !missing.contains(&index) {
            have.set(index);
        }
    }
    let (have_tx, _have_rx) = watch::channel(have);

    {
        let mut shared = ctx.shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        shared.bytes_total = ctx.files.total_bytes();
        shared.bytes_done = remaining_to_done(&ctx, &missing);
    }

    let mut state = TaskState {
        info_hash,
        missing,
        peers: HashMap::new(),
        next_peer_key: 1,
        have_tx,
        uploaded: 0,
        downloaded_window: 0,
        uploaded_window: 0,
        connecting: HashSet::new(),
        paused: false,
    };

    if downloading {
        set_state(&ctx, info_hash, TorrentState::Downloading).await;
    } else {
        set_state(&ctx, info_hash, TorrentState::Seeding).await;
    }

    let announcer = match AnnounceClient::new(&ctx.params.announce_url) {
        Ok(client) => client,
        Err(err) => {
            enter_error(&ctx, info_hash, format!("announce client: {err}")).await;
            return;
        }
    };

    let (peer_events_tx, mut peer_events_rx) = mpsc::channel::<PeerEvent>(256);
    let (dial_tx, mut dial_rx) = mpsc::channel::<(SocketAddr, Option<TcpStream>)>(16);

    let mut announce_event = AnnounceEvent::Started;
    let mut announce_interval = Duration::from_secs(60);
    let mut announce_backoff = ANNOUNCE_BACKOFF_BASE;
    let mut next_announce = Instant::now();
    let mut status_tick = tokio::time::interval(STATUS_TICK);
    status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut window_started = Instant::now();

    loop {
        let announce_sleep = tokio::time::sleep_until(next_announce.into());
        tokio::select! {
            () = announce_sleep => {
                let left = remaining_bytes(&ctx, &state.missing);
                let request = AnnounceRequest {
                    info_hash,
                    peer_id: ctx.local_peer_id,
                    port: ctx.data_port,
                    left,
                    uploaded: state.uploaded,
                    downloaded: ctx.files.total_bytes().saturating_sub(left),
                    event: announce_event,
                };
                match announcer.announce(&request).await {
                    Ok(outcome) => {
                        announce_interval = outcome.interval;
                        announce_backoff = ANNOUNCE_BACKOFF_BASE;
                        next_announce = Instant::now() + announce_interval;
                        {
                            let mut shared = ctx.shared.lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner);
                            shared.last_announce_ok = Some(Instant::now());
                        }
                        ctx.reporter
                            .announce_ok(info_hash, announce_event.label(), outcome.complete, outcome.incomplete)
                            .await;
                        announce_event = AnnounceEvent::Interval;
                        if !state.paused {
                            dial_new_peers(&ctx, &mut state, &outcome.peers, &dial_tx);
                        }
                    }
                    Err(err) => {
                        ctx.reporter
                            .announce_failed(info_hash, announce_event.label(), &err.to_string())
                            .await;
                        next_announce = Instant::now() + announce_backoff.min(announce_interval);
                        announce_backoff = (announce_backoff * 2).min(announce_interval);
                        debug!(info_hash = %info_hash, error = %err, "announce failed; backing off");
                    }
                }
            }
            command = ctx.commands.recv() => {
                match command {
                    Some(TorrentCommand::Inbound(stream, remote)) => {
                        accept_peer(&mut state, stream, None, Some(remote), &ctx, &peer_events_tx);
                    }
                    Some(TorrentCommand::Pause) => {
                        if current_state(&ctx) == TorrentState::Downloading {
                            state.paused = true;
                            set_state(&ctx, info_hash, TorrentState::Paused).await;
                        }
                    }
                    Some(TorrentCommand::Resume) => {
                        if state.paused {
                            state.paused = false;
                            set_state(&ctx, info_hash, TorrentState::Downloading).await;
                            schedule_pieces(&ctx, &mut state).await;
                        }
                    }
                    Some(TorrentCommand::Reannounce) => {
                        next_announce = Instant::now();
                    }
                    Some(TorrentCommand::Shutdown) | None => {
                        let request = AnnounceRequest {
                            info_hash,
                            peer_id: ctx.local_peer_id,
                            port: ctx.data_port,
                            left: remaining_bytes(&ctx, &state.missing),
                            uploaded: state.uploaded,
                            downloaded: 0,
                            event: AnnounceEvent::Stopped,
                        };
                        if let Err(err) = announcer.announce(&request).await {
                            debug!(info_hash = %info_hash, error = %err, "stopped announce failed");
                        }
                        for ctl in state.peers.values() {
                            let _ = ctl.commands.try_send(PeerCommand::Shutdown);
                        }
                        return;
                    }
                }
            }
            Some((addr, dialed)) = dial_rx.recv() => {
                state.connecting.remove(&addr);
                if let Some(stream) = dialed {
                    accept_peer(&mut state, stream, Some(addr), None, &ctx, &peer_events_tx);
                }
            }
            Some(event) = peer_events_rx.recv() => {
                if let Some(completed) = handle_peer_event(&ctx, &mut state, event).await {
                    if completed {
                        announce_event = AnnounceEvent::Completed;
                        next_announce = Instant::now();
                        set_state(&ctx, info_hash, TorrentState::Completed).await;
                        let _ = ctx.notices.send(TorrentNotice::DownloadCompleted {
                            info_hash,
                            transfer_id: ctx.params.transfer_id,
                        }).await;
                        set_state(&ctx, info_hash, TorrentState::Seeding).await;
                    } else {
                        enter_error(&ctx, info_hash, "storage failure during download".to_string()).await;
                        return;
                    }
                }
            }
            _ = status_tick.tick() => {
                let elapsed = window_started.elapsed().as_secs_f64();
                if elapsed >= 1.0 {
                    let mut shared = ctx.shared.lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    shared.download_bps = (state.downloaded_window as f64 / elapsed) as u64;
                    shared.upload_bps = (state.uploaded_window as f64 / elapsed) as u64;
                    shared.peers = state.peers.len();
                    shared.uploaded = state.uploaded;
                    state.downloaded_window = 0;
                    state.uploaded_window = 0;
                    window_started = Instant::now();
                }
            }
        }
    }
}

/// Verify the payload against the completion cache and disk. Returns the set
/// of missing piece indexes.
async fn verify_payload(
    ctx: &TorrentTaskContext,
    info_hash: InfoHash,
) -> Result<HashSet<u32>, String> {
    let pieces_count = ctx.files.pieces_count();
    let cached: HashMap<u32, bool> = ctx
        .cache
        .load(info_hash)
        .await
        .map_err(|err| format!("piece cache load failed: {err}"))?
        .into_iter()
        .collect();

    let mut missing = HashSet::new();
    for index in 0..pieces_count {
        if cached.get(&index).copied().unwrap_or(false) {
            // A cached-true piece is trusted without rereading bytes.
            continue;
        }
        let expected = ctx
            .params
            .metainfo
            .info
            .piece_hash(index)
            .ok_or_else(|| format!("metainfo missing hash for piece {index}"))?;
        let offset = ctx.files.piece_offset(index);
        let len = ctx.files.piece_len(index);
        match ctx.files.read_block(offset, len).await {
            Ok(Some(bytes)) => {
                let digest: [u8; 20] = Sha1::digest(&bytes).into();
                if digest == expected {
                    ctx.cache
                        .set(info_hash, index, true)
                        .await
                        .map_err(|err| format!("piece cache write failed: {err}"))?;
                } else if ctx.params.transfer_id.is_some() {
                    missing.insert(index);
                } else {
                    return Err(format!("piece {index} failed hash verification"));
                }
            }
            Ok(None) => {
                missing.insert(index);
            }
            Err(err) => return Err(format!("verification read failed: {err}")),
        }
    }
    Ok(missing)
}

fn accept_peer(
    state: &mut TaskState,
    stream: TcpStream,
    dialed_addr: Option<SocketAddr>,
    inbound_remote: Option<crate::wire::Handshake>,
    ctx: &TorrentTaskContext,
    events: &mpsc::Sender<PeerEvent>,
) {
    let addr = dialed_addr
        .or_else(|| stream.peer_addr().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    let key = state.next_peer_key;
    state.next_peer_key += 1;

    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    state.peers.insert(
        key,
        PeerCtl {
            commands: cmd_tx,
            addr,
            availability: Bitfield::default(),
            assigned: None,
            ready: false,
        },
    );

    let params = PeerSessionParams {
        key,
        addr,
        info_hash: *state.info_hash.as_bytes(),
        local_peer_id: ctx.local_peer_id,
        outbound: dialed_addr.is_some(),
        inbound_remote,
        files: Arc::clone(&ctx.files),
        have: state.have_tx.subscribe(),
        events: events.clone(),
        commands: cmd_rx,
    };
    tokio::spawn(peer::run_session(stream, params));
}

fn dial_new_peers(
    ctx: &TorrentTaskContext,
    state: &mut TaskState,
    peers: &[SocketAddr],
    dial_tx: &mpsc::Sender<(SocketAddr, Option<TcpStream>)>,
) {
    for addr in peers {
        if ctx.own_addrs.contains(addr)
            || state.connecting.contains(addr)
            || state.peers.values().any(|ctl| ctl.addr == *addr)
        {
            continue;
        }
        state.connecting.insert(*addr);
        let addr = *addr;
        let dialers = ctx.dialers.clone();
        let dial_tx = dial_tx.clone();
        tokio::spawn(async move {
            for dialer in dialers {
                match dialer.dial(addr).await {
                    Ok(stream) => {
                        let _ = dial_tx.send((addr, Some(stream))).await;
                        return;
                    }
                    Err(err) => {
                        debug!(peer = %addr, dialer = dialer.name(), error = %err, "dial failed");
                    }
                }
            }
            // Every dialer failed; unblock the address for the next
            // announce round.
            let _ = dial_tx.send((addr, None)).await;
        });
    }
}

/// Handle one peer event. Returns `Some(true)` when the download just
/// completed, `Some(false)` on a fatal storage failure, `None` otherwise.
async fn handle_peer_event(
    ctx: &TorrentTaskContext,
    state: &mut TaskState,
    event: PeerEvent,
) -> Option<bool> {
    match event {
        PeerEvent::Ready { key, addr, .. } => {
            if let Some(ctl) = state.peers.get_mut(&key) {
                ctl.ready = true;
                debug!(info_hash = %state.info_hash, peer = %addr, "peer session ready");
            }
            schedule_pieces(ctx, state).await;
        }
        PeerEvent::Availability { key, bitfield } => {
            if let Some(ctl) = state.peers.get_mut(&key) {
                ctl.availability = bitfield;
            }
            schedule_pieces(ctx, state).await;
        }
        PeerEvent::Have { key, piece_index } => {
            if let Some(ctl) = state.peers.get_mut(&key) {
                ctl.availability.set(piece_index);
            }
            schedule_pieces(ctx, state).await;
        }
        PeerEvent::PieceAssembled {
            key,
            piece_index,
            data,
        } => {
            if let Some(ctl) = state.peers.get_mut(&key) {
                ctl.assigned = None;
            }
            if !state.missing.contains(&piece_index) {
                return None;
            }
            let expected = ctx.params.metainfo.info.piece_hash(piece_index)?;
            let digest: [u8; 20] = Sha1::digest(&data).into();
            if digest != expected {
                warn!(
                    info_hash = %state.info_hash,
                    piece_index,
                    "downloaded piece failed verification; rescheduling"
                );
                schedule_pieces(ctx, state).await;
                return None;
            }
            let offset = ctx.files.piece_offset(piece_index);
            if let Err(err) = ctx.files.write_block(offset, &data).await {
                warn!(info_hash = %state.info_hash, error = %err, "piece write failed");
                return Some(false);
            }
            if let Err(err) = ctx.cache.set(state.info_hash, piece_index, true).await {
                warn!(info_hash = %state.info_hash, error = %err, "piece cache write failed");
            }
            state.missing.remove(&piece_index);
            state.downloaded_window += data.len() as u64;
            state.have_tx.send_modify(|have| have.set(piece_index));
            for ctl in state.peers.values() {
                let _ = ctl.commands.try_send(PeerCommand::SendHave(piece_index));
            }
            {
                let mut shared = ctx
                    .shared
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                shared.bytes_done = remaining_to_done(ctx, &state.missing);
            }
            if state.missing.is_empty() {
                info!(info_hash = %state.info_hash, "download complete");
                return Some(true);
            }
            schedule_pieces(ctx, state).await;
        }
        PeerEvent::PieceFailed {
            key,
            piece_index,
            reason,
        } => {
            warn!(
                info_hash = %state.info_hash,
                piece_index,
                reason = %reason,
                "peer failed an assigned piece"
            );
            if let Some(ctl) = state.peers.get_mut(&key) {
                ctl.assigned = None;
            }
            schedule_pieces(ctx, state).await;
        }
        PeerEvent::Uploaded { bytes, .. } => {
            state.uploaded += bytes;
            state.uploaded_window += bytes;
        }
        PeerEvent::Closed { key, reason } => {
            if let Some(ctl) = state.peers.remove(&key) {
                debug!(
                    info_hash = %state.info_hash,
                    peer = %ctl.addr,
                    reason = %reason,
                    "peer session closed"
                );
            }
            schedule_pieces(ctx, state).await;
        }
    }
    None
}

/// Assign missing pieces to idle ready peers, rarest first.
async fn schedule_pieces(ctx: &TorrentTaskContext, state: &mut TaskState) {
    if state.paused || state.missing.is_empty() {
        return;
    }

    let assigned: HashSet<u32> = state
        .peers
        .values()
        .filter_map(|ctl| ctl.assigned)
        .collect();

    // Availability count per candidate piece across connected peers.
    let mut candidates: Vec<(u32, usize)> = state
        .missing
        .iter()
        .filter(|index| !assigned.contains(index))
        .map(|index| {
            let availability = state
                .peers
                .values()
                .filter(|ctl| ctl.availability.has(*index))
                .count();
            (*index, availability)
        })
        .filter(|(_, availability)| *availability > 0)
        .collect();
    candidates.sort_by_key(|(index, availability)| (*availability, *index));

    for (index, _) in candidates {
        let Some(ctl) = state
            .peers
            .values_mut()
            .find(|ctl| ctl.ready && ctl.assigned.is_none() && ctl.availability.has(index))
        else {
            continue;
        };
        ctl.assigned = Some(index);
        let len = ctx.files.piece_len(index);
        let _ = ctl
            .commands
            .send(PeerCommand::DownloadPiece { index, len })
            .await;
    }
}

fn remaining_bytes(ctx: &TorrentTaskContext, missing: &HashSet<u32>) -> u64 {
    missing
        .iter()
        .map(|index| u64::from(ctx.files.piece_len(*index)))
        .sum()
}

fn remaining_to_done(ctx: &TorrentTaskContext, missing: &HashSet<u32>) -> u64 {
    ctx.files
        .total_bytes()
        .saturating_sub(remaining_bytes(ctx, missing))
}

fn current_state(ctx: &TorrentTaskContext) -> TorrentState {
    ctx.shared
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .state
        .clone()
}

async fn set_state(ctx: &TorrentTaskContext, info_hash: InfoHash, state: TorrentState) {
    {
        let mut shared = ctx
            .shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        shared.state = state.clone();
    }
    let _ = ctx
        .notices
        .send(TorrentNotice::StateChanged { info_hash, state })
        .await;
}

async fn enter_error(ctx: &TorrentTaskContext, info_hash: InfoHash, reason: String) {
    warn!(info_hash = %info_hash, reason = %reason, "torrent entering error state");
    if ctx.params.transfer_id.is_some() {
        let _ = ctx
            .notices
            .send(TorrentNotice::DownloadError {
                info_hash,
                transfer_id: ctx.params.transfer_id,
                message: reason.clone(),
            })
            .await;
    }
    set_state(ctx, info_hash, TorrentState::Error { reason }).await;
}
