//! Per-peer session task.
//!
//! Each connected peer runs one task that owns the socket. Serving happens
//! entirely inside the session (it holds the file map and a live view of the
//! verified bitfield); downloading is directed by the torrent task, which
//! assigns one piece at a time and receives assembled pieces back for
//! verification.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::storage::FileMap;
use crate::wire::{Bitfield, BlockInfo, Handshake, HandshakeCodec, Message, PeerCodec, BLOCK_SIZE};

/// Outstanding block requests per peer.
const REQUEST_PIPELINE: usize = 8;

/// Keep-alive cadence.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Idle read timeout before the session closes the socket.
const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Identifier the torrent task uses to address a session.
pub(crate) type PeerKey = u64;

/// Commands from the torrent task to a session.
#[derive(Debug)]
pub(crate) enum PeerCommand {
    /// Broadcast that a piece completed verification.
    SendHave(u32),
    /// Download one piece of the given length.
    DownloadPiece { index: u32, len: u32 },
    /// Close the session.
    Shutdown,
}

/// Events from a session to the torrent task.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    /// Handshake completed; the session is ready for work.
    Ready {
        key: PeerKey,
        addr: SocketAddr,
        #[allow(dead_code)]
        remote_peer_id: [u8; 20],
    },
    /// The peer advertised piece availability.
    Availability { key: PeerKey, bitfield: Bitfield },
    /// The peer announced one new piece.
    Have { key: PeerKey, piece_index: u32 },
    /// An assigned piece was fully assembled.
    PieceAssembled {
        key: PeerKey,
        piece_index: u32,
        data: Vec<u8>,
    },
    /// An assigned piece could not be fetched from this peer.
    PieceFailed {
        key: PeerKey,
        piece_index: u32,
        reason: String,
    },
    /// Bytes served to the peer.
    Uploaded {
        #[allow(dead_code)]
        key: PeerKey,
        bytes: u64,
    },
    /// The session ended.
    Closed { key: PeerKey, reason: String },
}

/// Everything a session needs at spawn time.
pub(crate) struct PeerSessionParams {
    pub(crate) key: PeerKey,
    pub(crate) addr: SocketAddr,
    pub(crate) info_hash: [u8; 20],
    pub(crate) local_peer_id: [u8; 20],
    pub(crate) outbound: bool,
    /// Set when the engine already consumed the inbound handshake to route
    /// the connection; the session only sends its reply.
    pub(crate) inbound_remote: Option<Handshake>,
    pub(crate) files: Arc<FileMap>,
    pub(crate) have: watch::Receiver<Bitfield>,
    pub(crate) events: mpsc::Sender<PeerEvent>,
    pub(crate) commands: mpsc::Receiver<PeerCommand>,
}

/// Run one peer session to completion.
pub(crate) async fn run_session(stream: TcpStream, params: PeerSessionParams) {
    let key = params.key;
    let events = params.events.clone();
    let reason = match session_loop(stream, params).await {
        Ok(()) => "closed".to_string(),
        Err(reason) => reason,
    };
    let _ = events.send(PeerEvent::Closed { key, reason }).await;
}

async fn session_loop(stream: TcpStream, mut params: PeerSessionParams) -> Result<(), String> {
    let addr = params.addr;
    let mut handshake_framed = Framed::new(stream, HandshakeCodec);

    let remote = if let Some(remote) = params.inbound_remote {
        // The engine already read the peer's handshake to route by
        // info-hash; only the reply remains.
        handshake_framed
            .send(Handshake::new(params.info_hash, params.local_peer_id))
            .await
            .map_err(|err| format!("handshake reply failed: {err}"))?;
        remote
    } else {
        if params.outbound {
            handshake_framed
                .send(Handshake::new(params.info_hash, params.local_peer_id))
                .await
                .map_err(|err| format!("handshake send failed: {err}"))?;
        }
        let remote = tokio::time::timeout(READ_TIMEOUT, handshake_framed.next())
            .await
            .map_err(|_elapsed| "handshake timed out".to_string())?
            .ok_or_else(|| "connection closed during handshake".to_string())?
            .map_err(|err| format!("handshake decode failed: {err}"))?;
        if !params.outbound {
            handshake_framed
                .send(Handshake::new(params.info_hash, params.local_peer_id))
                .await
                .map_err(|err| format!("handshake reply failed: {err}"))?;
        }
        remote
    };

    if remote.info_hash != params.info_hash {
        return Err("handshake info-hash mismatch".to_string());
    }

    let parts = handshake_framed.into_parts();
    let mut framed = Framed::from_parts(tokio_util::codec::FramedParts::new::<Message>(
        parts.io,
        PeerCodec,
    ));
    // Carry over any bytes the peer pipelined behind its handshake.
    *framed.read_buffer_mut() = parts.read_buf;

    params
        .events
        .send(PeerEvent::Ready {
            key: params.key,
            addr,
            remote_peer_id: remote.peer_id,
        })
        .await
        .map_err(|_err| "torrent task gone".to_string())?;

    // Private swarm policy: advertise, never choke.
    let current_have = params.have.borrow().clone();
    framed
        .send(Message::Bitfield(current_have))
        .await
        .map_err(|err| format!("bitfield send failed: {err}"))?;
    framed
        .send(Message::Unchoke)
        .await
        .map_err(|err| format!("unchoke send failed: {err}"))?;

    let mut state = SessionState::default();
    let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
    keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = params.commands.recv() => {
                match command {
                    Some(PeerCommand::SendHave(piece_index)) => {
                        framed
                            .send(Message::Have { piece_index })
                            .await
                            .map_err(|err| format!("have send failed: {err}"))?;
                    }
                    Some(PeerCommand::DownloadPiece { index, len }) => {
                        state.begin_piece(index, len);
                        if !state.remote_choked {
                            pump_requests(&mut framed, &mut state).await?;
                        } else {
                            framed
                                .send(Message::Interested)
                                .await
                                .map_err(|err| format!("interested send failed: {err}"))?;
                        }
                    }
                    Some(PeerCommand::Shutdown) | None => return Ok(()),
                }
            }
            _ = keep_alive.tick() => {
                framed
                    .send(Message::KeepAlive)
                    .await
                    .map_err(|err| format!("keep-alive send failed: {err}"))?;
            }
            frame = tokio::time::timeout(READ_TIMEOUT, framed.next()) => {
                let frame = frame
                    .map_err(|_elapsed| "peer read timed out".to_string())?
                    .ok_or_else(|| "peer closed the connection".to_string())?
                    .map_err(|err| format!("peer frame decode failed: {err}"))?;
                handle_frame(frame, &mut framed, &mut state, &mut params).await?;
            }
        }
    }
}

struct SessionState {
    remote_choked: bool,
    assembling: Option<PieceAssembly>,
}

impl Default for SessionState {
    fn default() -> Self {
        // Wire protocol: every connection starts choked.
        Self {
            remote_choked: true,
            assembling: None,
        }
    }
}

struct PieceAssembly {
    index: u32,
    len: u32,
    data: Vec<u8>,
    received: Vec<bool>,
    next_request: u32,
    outstanding: usize,
}

impl SessionState {
    fn begin_piece(&mut self, index: u32, len: u32) {
        let blocks = len.div_ceil(BLOCK_SIZE) as usize;
        self.assembling = Some(PieceAssembly {
            index,
            len,
            data: vec![0u8; len as usize],
            received: vec![false; blocks],
            next_request: 0,
            outstanding: 0,
        });
    }
}

impl PieceAssembly {
    fn block_len(&self, block: u32) -> u32 {
        let start = block * BLOCK_SIZE;
        (self.len - start).min(BLOCK_SIZE)
    }

    const fn blocks(&self) -> u32 {
        self.len.div_ceil(BLOCK_SIZE)
    }

    fn complete(&self) -> bool {
        self.received.iter().all(|done| *done)
    }
}

async fn pump_requests(
    framed: &mut Framed<TcpStream, PeerCodec>,
    state: &mut SessionState,
) -> Result<(), String> {
    let Some(assembly) = state.assembling.as_mut() else {
        return Ok(());
    };
    while assembly.outstanding < REQUEST_PIPELINE && assembly.next_request < assembly.blocks() {
        let block = assembly.next_request;
        let info = BlockInfo {
            piece_index: assembly.index,
            offset: block * BLOCK_SIZE,
            len: assembly.block_len(block),
        };
        framed
            .send(Message::Request(info))
            .await
            .map_err(|err| format!("request send failed: {err}"))?;
        assembly.next_request += 1;
        assembly.outstanding += 1;
    }
    Ok(())
}

async fn handle_frame(
    frame: Message,
    framed: &mut Framed<TcpStream, PeerCodec>,
    state: &mut SessionState,
    params: &mut PeerSessionParams,
) -> Result<(), String> {
    match frame {
        Message::KeepAlive => {}
        Message::Choke => {
            state.remote_choked = true;
            if let Some(assembly) = state.assembling.as_mut() {
                // Outstanding requests are void; re-request on unchoke.
                assembly.next_request = first_missing_block(assembly);
                assembly.outstanding = 0;
            }
        }
        Message::Unchoke => {
            state.remote_choked = false;
            pump_requests(framed, state).await?;
        }
        Message::Interested | Message::NotInterested => {
            // Everyone stays unchoked on the private swarm; nothing to do.
            trace!(addr = %params.addr, "peer interest change");
        }
        Message::Have { piece_index } => {
            params
                .events
                .send(PeerEvent::Have {
                    key: params.key,
                    piece_index,
                })
                .await
                .map_err(|_err| "torrent task gone".to_string())?;
        }
        Message::Bitfield(bitfield) => {
            params
                .events
                .send(PeerEvent::Availability {
                    key: params.key,
                    bitfield,
                })
                .await
                .map_err(|_err| "torrent task gone".to_string())?;
        }
        Message::Request(info) => {
            serve_block(info, framed, params).await?;
        }
        Message::Block {
            piece_index,
            offset,
            data,
        } => {
            accept_block(piece_index, offset, data, framed, state, params).await?;
        }
        Message::Cancel(_info) => {
            // Blocks are served synchronously, so there is nothing in flight
            // to cancel by the time this arrives.
            debug!(addr = %params.addr, "ignoring cancel for already-served block");
        }
    }
    Ok(())
}

fn first_missing_block(assembly: &PieceAssembly) -> u32 {
    assembly
        .received
        .iter()
        .position(|done| !*done)
        .map_or(assembly.blocks(), |index| index as u32)
}

async fn serve_block(
    info: BlockInfo,
    framed: &mut Framed<TcpStream, PeerCodec>,
    params: &mut PeerSessionParams,
) -> Result<(), String> {
    if info.len > BLOCK_SIZE {
        return Err(format!("oversized block request ({} bytes)", info.len));
    }
    if !params.have.borrow().has(info.piece_index) {
        return Err(format!(
            "request for unavailable piece {}",
            info.piece_index
        ));
    }

    let offset = params.files.piece_offset(info.piece_index) + u64::from(info.offset);
    let data = params
        .files
        .read_block(offset, info.len)
        .await
        .map_err(|err| format!("serve read failed: {err}"))?
        .ok_or_else(|| format!("payload bytes missing for piece {}", info.piece_index))?;

    let bytes = data.len() as u64;
    framed
        .send(Message::Block {
            piece_index: info.piece_index,
            offset: info.offset,
            data,
        })
        .await
        .map_err(|err| format!("block send failed: {err}"))?;

    params
        .events
        .send(PeerEvent::Uploaded {
            key: params.key,
            bytes,
        })
        .await
        .map_err(|_err| "torrent task gone".to_string())?;
    Ok(())
}

async fn accept_block(
    piece_index: u32,
    offset: u32,
    data: Vec<u8>,
    framed: &mut Framed<TcpStream, PeerCodec>,
    state: &mut SessionState,
    params: &mut PeerSessionParams,
) -> Result<(), String> {
    let Some(assembly) = state.assembling.as_mut() else {
        warn!(addr = %params.addr, piece_index, "unsolicited block dropped");
        return Ok(());
    };
    if assembly.index != piece_index || offset % BLOCK_SIZE != 0 {
        warn!(addr = %params.addr, piece_index, offset, "block outside current assignment");
        return Ok(());
    }
    let block = offset / BLOCK_SIZE;
    if block >= assembly.blocks() || data.len() as u32 != assembly.block_len(block) {
        let reason = format!("bad block geometry for piece {piece_index}");
        let failed_index = assembly.index;
        state.assembling = None;
        params
            .events
            .send(PeerEvent::PieceFailed {
                key: params.key,
                piece_index: failed_index,
                reason: reason.clone(),
            })
            .await
            .map_err(|_err| "torrent task gone".to_string())?;
        return Err(reason);
    }

    if !assembly.received[block as usize] {
        let start = (block * BLOCK_SIZE) as usize;
        assembly.data[start..start + data.len()].copy_from_slice(&data);
        assembly.received[block as usize] = true;
        assembly.outstanding = assembly.outstanding.saturating_sub(1);
    }

    if assembly.complete() {
        let finished = state.assembling.take().unwrap_or_else(|| unreachable!());
        params
            .events
            .send(PeerEvent::PieceAssembled {
                key: params.key,
                piece_index: finished.index,
                data: finished.data,
            })
            .await
            .map_err(|_err| "torrent task gone".to_string())?;
    } else {
        pump_requests(framed, state).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnicloud_metainfo::{FileEntry, Info};
    use serde_bytes::ByteBuf;
    use sha1::{Digest, Sha1};
    use std::path::Path;

    use crate::storage::StorageBinding;

    fn build_payload(root: &Path, media_len: usize) -> Info {
        std::fs::create_dir_all(root).unwrap();
        std::fs::write(root.join("ASSETMAP"), vec![b'A'; 50]).unwrap();
        let media: Vec<u8> = (0..media_len).map(|i| (i % 251) as u8).collect();
        std::fs::write(root.join("VIDEO.mxf"), &media).unwrap();

        let mut stream = vec![b'A'; 50];
        stream.extend_from_slice(&media);
        let piece_length = 32 * 1024u32;
        let mut pieces = Vec::new();
        for chunk in stream.chunks(piece_length as usize) {
            let digest: [u8; 20] = Sha1::digest(chunk).into();
            pieces.extend_from_slice(&digest);
        }
        Info {
            files: vec![
                FileEntry {
                    length: 50,
                    path: vec!["ASSETMAP".to_string()],
                },
                FileEntry {
                    length: media_len as u64,
                    path: vec!["VIDEO.mxf".to_string()],
                },
            ],
            name: "PkgA".to_string(),
            piece_length,
            pieces: ByteBuf::from(pieces),
        }
    }

    /// Two sessions wired over a real socket: a seeder with full payload and
    /// a downloader assigned every piece in turn.
    #[tokio::test]
    async fn seeder_serves_downloader_end_to_end() {
        let temp = tempfile::tempdir().unwrap();
        let seed_root = temp.path().join("seed").join("PkgA");
        let info = build_payload(&seed_root, 100 * 1024);
        let info_hash = info.info_hash().unwrap().0;
        let pieces_count = info.pieces_count();

        let seed_files = Arc::new(FileMap::new(
            &info,
            &StorageBinding::Single { root: seed_root },
        ));
        let download_files = Arc::new(FileMap::new(
            &info,
            &StorageBinding::Single {
                root: temp.path().join("dl").join("PkgA"),
            },
        ));

        let mut full = Bitfield::with_piece_count(pieces_count);
        for index in 0..pieces_count {
            full.set(index);
        }
        let (_full_tx, full_rx) = watch::channel(full);
        let (_empty_tx, empty_rx) =
            watch::channel(Bitfield::with_piece_count(pieces_count));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (seed_events_tx, mut seed_events_rx) = mpsc::channel(64);
        let (_seed_cmd_tx, seed_cmd_rx) = mpsc::channel(8);
        let seeder = tokio::spawn({
            let seed_files = Arc::clone(&seed_files);
            async move {
                let (stream, peer_addr) = listener.accept().await.unwrap();
                run_session(
                    stream,
                    PeerSessionParams {
                        key: 1,
                        addr: peer_addr,
                        info_hash,
                        local_peer_id: *b"-OC0100-seeder000001",
                        outbound: false,
                        inbound_remote: None,
                        files: seed_files,
                        have: full_rx,
                        events: seed_events_tx,
                        commands: seed_cmd_rx,
                    },
                )
                .await;
            }
        });

        let (dl_events_tx, mut dl_events_rx) = mpsc::channel(64);
        let (dl_cmd_tx, dl_cmd_rx) = mpsc::channel(8);
        let stream = TcpStream::connect(addr).await.unwrap();
        let downloader = tokio::spawn(run_session(
            stream,
            PeerSessionParams {
                key: 2,
                addr,
                info_hash,
                local_peer_id: *b"-OC0100-downloader01",
                outbound: true,
                inbound_remote: None,
                files: Arc::clone(&download_files),
                have: empty_rx,
                events: dl_events_tx,
                commands: dl_cmd_rx,
            },
        ));

        // Wait for ready + the seeder's bitfield.
        let saw_full_bitfield;
        loop {
            match tokio::time::timeout(Duration::from_secs(5), dl_events_rx.recv())
                .await
                .expect("event")
                .expect("open")
            {
                PeerEvent::Availability { bitfield, .. } => {
                    assert_eq!(bitfield.count_set(pieces_count), pieces_count);
                    saw_full_bitfield = true;
                    break;
                }
                PeerEvent::Ready { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(saw_full_bitfield);

        // Pull every piece and compare against the seeder's disk bytes.
        for index in 0..pieces_count {
            let len = seed_files.piece_len(index);
            dl_cmd_tx
                .send(PeerCommand::DownloadPiece { index, len })
                .await
                .unwrap();
            loop {
                match tokio::time::timeout(Duration::from_secs(5), dl_events_rx.recv())
                    .await
                    .expect("event")
                    .expect("open")
                {
                    PeerEvent::PieceAssembled {
                        piece_index, data, ..
                    } => {
                        assert_eq!(piece_index, index);
                        let expected = seed_files
                            .read_block(seed_files.piece_offset(index), len)
                            .await
                            .unwrap()
                            .unwrap();
                        assert_eq!(data, expected);
                        break;
                    }
                    PeerEvent::PieceFailed { reason, .. } => panic!("piece failed: {reason}"),
                    _ => {}
                }
            }
        }

        dl_cmd_tx.send(PeerCommand::Shutdown).await.unwrap();
        downloader.await.unwrap();
        // Seeder sees the close and reports uploaded bytes along the way.
        let mut uploaded = 0u64;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(5), seed_events_rx.recv()).await
        {
            match event {
                PeerEvent::Uploaded { bytes, .. } => uploaded += bytes,
                PeerEvent::Closed { .. } => break,
                _ => {}
            }
        }
        assert_eq!(uploaded, seed_files.total_bytes());
        seeder.await.unwrap();
    }
}
