//! The relay server hosted on the hub.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::protocol::{RelayCommand, read_line, write_command};

/// Bridge copy buffer size.
const BRIDGE_BUFFER: usize = 256 * 1024;

/// Relay server tunables.
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Maximum concurrently bridged sessions.
    pub max_sessions: usize,
    /// Expected keepalive cadence; control connections idle for twice this
    /// long are closed.
    pub ping_interval: Duration,
    /// How long a pending session waits for its seeder data connection.
    pub data_conn_timeout: Duration,
    /// Timeout for the direct-dial fallback.
    pub dial_timeout: Duration,
    /// How long a direct-dial failure is cached.
    pub negcache_ttl: Duration,
    /// Cadence of the stats log line.
    pub stats_interval: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            ping_interval: Duration::from_secs(30),
            data_conn_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(10),
            negcache_ttl: Duration::from_secs(60),
            stats_interval: Duration::from_secs(120),
        }
    }
}

/// Counters exposed through the hub API.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayStats {
    /// Seeders currently registered.
    pub registered: usize,
    /// Bridges currently open.
    pub active_sessions: usize,
    /// Bridges opened since start.
    pub total_sessions: u64,
    /// Bytes bridged in both directions since start.
    pub bytes_relayed: u64,
}

struct PeerEntry {
    ctrl_tx: mpsc::Sender<RelayCommand>,
    last_ping: Instant,
}

struct ServerState {
    peers: HashMap<String, PeerEntry>,
    pending: HashMap<String, oneshot::Sender<TcpStream>>,
    negcache: HashMap<String, Instant>,
    active_sessions: usize,
    total_sessions: u64,
    bytes_relayed: u64,
}

/// The TCP bridge hosted on the hub.
pub struct RelayServer {
    config: RelayServerConfig,
    state: Arc<StdMutex<ServerState>>,
}

impl RelayServer {
    /// Construct a server with the given tunables.
    #[must_use]
    pub fn new(config: RelayServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Arc::new(StdMutex::new(ServerState {
                peers: HashMap::new(),
                pending: HashMap::new(),
                negcache: HashMap::new(),
                active_sessions: 0,
                total_sessions: 0,
                bytes_relayed: 0,
            })),
        })
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        let state = self.lock_state();
        RelayStats {
            registered: state.peers.len(),
            active_sessions: state.active_sessions,
            total_sessions: state.total_sessions,
            bytes_relayed: state.bytes_relayed,
        }
    }

    /// Accept and serve connections until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the accept loop fails fatally.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> RelayResult<()> {
        info!(
            addr = %listener.local_addr().map_err(RelayError::io("relay.local_addr"))?,
            "relay server listening"
        );
        self.spawn_housekeeping(cancel.clone());

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(peer = %addr, "relay connection accepted");
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(err) = server.handle_conn(stream).await {
                                    debug!(peer = %addr, error = %err, "relay connection ended");
                                }
                            });
                        }
                        Err(err) => warn!(error = %err, "relay accept failed"),
                    }
                }
            }
        }
    }

    fn spawn_housekeeping(self: &Arc<Self>, cancel: CancellationToken) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut stats_tick = tokio::time::interval(server.config.stats_interval);
            let mut sweep_tick = tokio::time::interval(server.config.ping_interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = stats_tick.tick() => {
                        let stats = server.stats();
                        info!(
                            registered = stats.registered,
                            active = stats.active_sessions,
                            total_sessions = stats.total_sessions,
                            bytes_relayed = stats.bytes_relayed,
                            "relay stats"
                        );
                    }
                    _ = sweep_tick.tick() => {
                        server.sweep_idle_controls();
                        server.sweep_negcache();
                    }
                }
            }
        });
    }

    fn sweep_idle_controls(&self) {
        let cutoff = self.config.ping_interval * 2;
        let mut state = self.lock_state();
        let stale: Vec<String> = state
            .peers
            .iter()
            .filter(|(_, entry)| entry.last_ping.elapsed() > cutoff)
            .map(|(adv, _)| adv.clone())
            .collect();
        for adv in stale {
            // Dropping the channel makes the control task exit and close the
            // socket.
            state.peers.remove(&adv);
            warn!(adv_addr = %adv, "idle relay registration dropped");
        }
    }

    fn sweep_negcache(&self) {
        let ttl = self.config.negcache_ttl;
        let mut state = self.lock_state();
        state.negcache.retain(|_, failed_at| failed_at.elapsed() < ttl);
    }

    async fn handle_conn(self: Arc<Self>, mut stream: TcpStream) -> RelayResult<()> {
        let line = read_line(&mut stream).await?;
        match RelayCommand::parse(&line) {
            Ok(RelayCommand::Register { adv_addr }) => {
                self.run_control_conn(stream, adv_addr).await
            }
            Ok(RelayCommand::Connect { target }) => self.handle_connect(stream, target).await,
            Ok(RelayCommand::Session { session_id }) => {
                self.handle_session_conn(stream, session_id).await
            }
            Ok(other) => {
                let reason = format!("unexpected opening command {other:?}");
                let _ = write_command(&mut stream, &RelayCommand::Error { reason: reason.clone() })
                    .await;
                Err(RelayError::Protocol { line: reason })
            }
            Err(err) => {
                let _ = write_command(
                    &mut stream,
                    &RelayCommand::Error {
                        reason: "malformed command".to_string(),
                    },
                )
                .await;
                Err(err)
            }
        }
    }

    /// Control connection lifecycle: register, keepalive, session requests.
    async fn run_control_conn(
        self: Arc<Self>,
        stream: TcpStream,
        adv_addr: String,
    ) -> RelayResult<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let (ctrl_tx, mut ctrl_rx) = mpsc::channel::<RelayCommand>(16);
        let my_channel = ctrl_tx.clone();
        {
            let mut state = self.lock_state();
            // A re-registration replaces the previous control connection.
            state.peers.insert(
                adv_addr.clone(),
                PeerEntry {
                    ctrl_tx,
                    last_ping: Instant::now(),
                },
            );
        }
        write_command(&mut write_half, &RelayCommand::Ok { session_id: None }).await?;
        info!(adv_addr = %adv_addr, "relay registration accepted");

        let result = loop {
            tokio::select! {
                line = read_line(&mut reader) => {
                    let line = match line {
                        Ok(line) => line,
                        Err(err) => break Err(err),
                    };
                    match RelayCommand::parse(&line) {
                        Ok(RelayCommand::Ping) => {
                            {
                                let mut state = self.lock_state();
                                if let Some(entry) = state.peers.get_mut(&adv_addr) {
                                    entry.last_ping = Instant::now();
                                }
                            }
                            if let Err(err) =
                                write_command(&mut write_half, &RelayCommand::Pong).await
                            {
                                break Err(err);
                            }
                        }
                        Ok(RelayCommand::Pong) => {}
                        Ok(other) => {
                            break Err(RelayError::Protocol {
                                line: format!("unexpected control command {other:?}"),
                            });
                        }
                        Err(err) => break Err(err),
                    }
                }
                outbound = ctrl_rx.recv() => {
                    match outbound {
                        Some(command) => {
                            if let Err(err) = write_command(&mut write_half, &command).await {
                                break Err(err);
                            }
                        }
                        // Entry removed by the idle sweep or a replacement.
                        None => break Ok(()),
                    }
                }
            }
        };

        let mut state = self.lock_state();
        // Only unregister if the entry still belongs to this connection; a
        // replacement registration must survive.
        if state
            .peers
            .get(&adv_addr)
            .is_some_and(|entry| entry.ctrl_tx.same_channel(&my_channel))
        {
            state.peers.remove(&adv_addr);
        }
        drop(state);
        debug!(adv_addr = %adv_addr, "relay control connection ended");
        result
    }

    /// One downloader session: find the seeder (relayed or direct), bridge.
    async fn handle_connect(
        self: Arc<Self>,
        mut downloader: TcpStream,
        target: String,
    ) -> RelayResult<()> {
        if self.is_at_capacity() {
            let _ = write_command(
                &mut downloader,
                &RelayCommand::Error {
                    reason: "relay at capacity".to_string(),
                },
            )
            .await;
            return Err(RelayError::AtCapacity);
        }

        let ctrl_tx = {
            let state = self.lock_state();
            state.peers.get(&target).map(|entry| entry.ctrl_tx.clone())
        };

        let seeder = match ctrl_tx {
            Some(ctrl_tx) => {
                let session_id = new_session_id();
                let (fulfil_tx, fulfil_rx) = oneshot::channel();
                {
                    let mut state = self.lock_state();
                    state.pending.insert(session_id.clone(), fulfil_tx);
                }
                let request = RelayCommand::SessionRequest {
                    session_id: session_id.clone(),
                };
                if ctrl_tx.send(request).await.is_err() {
                    self.lock_state().pending.remove(&session_id);
                    let _ = write_command(
                        &mut downloader,
                        &RelayCommand::Error {
                            reason: "peer not registered".to_string(),
                        },
                    )
                    .await;
                    return Err(RelayError::PeerNotRegistered { target });
                }
                match tokio::time::timeout(self.config.data_conn_timeout, fulfil_rx).await {
                    Ok(Ok(seeder)) => seeder,
                    _ => {
                        self.lock_state().pending.remove(&session_id);
                        let _ = write_command(
                            &mut downloader,
                            &RelayCommand::Error {
                                reason: "session timed out".to_string(),
                            },
                        )
                        .await;
                        return Err(RelayError::SessionTimeout { session_id });
                    }
                }
            }
            None => match self.try_direct_dial(&target).await {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = write_command(
                        &mut downloader,
                        &RelayCommand::Error {
                            reason: "peer not registered".to_string(),
                        },
                    )
                    .await;
                    return Err(err);
                }
            },
        };

        write_command(&mut downloader, &RelayCommand::Ok { session_id: None }).await?;
        self.bridge(downloader, seeder, &target).await;
        Ok(())
    }

    /// Bind a seeder's data connection to its pending session.
    async fn handle_session_conn(
        self: Arc<Self>,
        mut stream: TcpStream,
        session_id: String,
    ) -> RelayResult<()> {
        let fulfil = {
            let mut state = self.lock_state();
            state.pending.remove(&session_id)
        };
        match fulfil {
            Some(fulfil) => {
                write_command(&mut stream, &RelayCommand::Ok { session_id: None }).await?;
                if fulfil.send(stream).is_err() {
                    debug!(session_id = %session_id, "session vanished before the data conn bound");
                }
                Ok(())
            }
            None => {
                let _ = write_command(
                    &mut stream,
                    &RelayCommand::Error {
                        reason: "unknown session".to_string(),
                    },
                )
                .await;
                Err(RelayError::Protocol {
                    line: format!("unknown session {session_id}"),
                })
            }
        }
    }

    async fn try_direct_dial(&self, target: &str) -> RelayResult<TcpStream> {
        {
            let state = self.lock_state();
            if let Some(failed_at) = state.negcache.get(target) {
                if failed_at.elapsed() < self.config.negcache_ttl {
                    return Err(RelayError::PeerNotRegistered {
                        target: target.to_string(),
                    });
                }
            }
        }
        let dialed =
            tokio::time::timeout(self.config.dial_timeout, TcpStream::connect(target)).await;
        match dialed {
            Ok(Ok(stream)) => Ok(stream),
            _ => {
                self.lock_state()
                    .negcache
                    .insert(target.to_string(), Instant::now());
                Err(RelayError::PeerNotRegistered {
                    target: target.to_string(),
                })
            }
        }
    }

    /// Pump bytes both ways until either side closes write; `CloseWrite`
    /// propagates so buffered bytes drain before the other half ends.
    async fn bridge(&self, downloader: TcpStream, seeder: TcpStream, target: &str) {
        {
            let mut state = self.lock_state();
            state.active_sessions += 1;
            state.total_sessions += 1;
        }

        let (down_read, down_write) = downloader.into_split();
        let (seed_read, seed_write) = seeder.into_split();
        let to_seeder = tokio::spawn(copy_half(down_read, seed_write));
        let to_downloader = tokio::spawn(copy_half(seed_read, down_write));

        let up = to_seeder.await.unwrap_or(0);
        let down = to_downloader.await.unwrap_or(0);

        {
            let mut state = self.lock_state();
            state.active_sessions -= 1;
            state.bytes_relayed += up + down;
        }
        info!(
            target = %target,
            bytes_to_seeder = up,
            bytes_to_downloader = down,
            "relay session closed"
        );
    }

    fn is_at_capacity(&self) -> bool {
        self.lock_state().active_sessions >= self.config.max_sessions
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

async fn copy_half(
    read: tokio::net::tcp::OwnedReadHalf,
    mut write: OwnedWriteHalf,
) -> u64 {
    let mut reader = BufReader::with_capacity(BRIDGE_BUFFER, read);
    let copied = tokio::io::copy_buf(&mut reader, &mut write).await.unwrap_or(0);
    let _ = write.shutdown().await;
    copied
}

fn new_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    (0..12)
        .map(|_| {
            let value: u8 = rng.random_range(0..16);
            char::from_digit(u32::from(value), 16).unwrap_or('0')
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn start_server(config: RelayServerConfig) -> (Arc<RelayServer>, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = RelayServer::new(config);
        tokio::spawn(Arc::clone(&server).run(listener, CancellationToken::new()));
        (server, addr)
    }

    async fn expect_line(stream: &mut TcpStream) -> RelayCommand {
        let line = read_line(stream).await.expect("line");
        RelayCommand::parse(&line).expect("command")
    }

    #[tokio::test]
    async fn register_connect_and_bridge_round_trip() {
        let (server, addr) = start_server(RelayServerConfig::default()).await;

        // Seeder registers a control connection.
        let mut ctrl = TcpStream::connect(addr).await.unwrap();
        write_command(
            &mut ctrl,
            &RelayCommand::Register {
                adv_addr: "203.0.113.9:6881".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(expect_line(&mut ctrl).await, RelayCommand::Ok { session_id: None });

        // Downloader requests a session.
        let mut down = TcpStream::connect(addr).await.unwrap();
        write_command(
            &mut down,
            &RelayCommand::Connect {
                target: "203.0.113.9:6881".to_string(),
            },
        )
        .await
        .unwrap();

        // The seeder receives the session request and dials in.
        let request = expect_line(&mut ctrl).await;
        let RelayCommand::SessionRequest { session_id } = request else {
            panic!("expected session request, got {request:?}");
        };
        let mut data = TcpStream::connect(addr).await.unwrap();
        write_command(&mut data, &RelayCommand::Session { session_id }).await.unwrap();
        assert_eq!(expect_line(&mut data).await, RelayCommand::Ok { session_id: None });
        assert_eq!(expect_line(&mut down).await, RelayCommand::Ok { session_id: None });

        // Bridge transparency: bytes pass unmodified both ways, and
        // CloseWrite propagates as EOF without truncation.
        use tokio::io::AsyncWriteExt;
        let payload = vec![0x5a_u8; 100_000];
        down.write_all(&payload).await.unwrap();
        down.shutdown().await.unwrap();

        let mut received = Vec::new();
        data.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);

        let reply = b"response-bytes";
        data.write_all(reply).await.unwrap();
        data.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        down.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, reply);

        // Stats settle once the bridge closes.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = server.stats();
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.bytes_relayed, payload.len() as u64 + reply.len() as u64);
    }

    #[tokio::test]
    async fn unregistered_target_with_failed_dial_is_rejected_and_cached() {
        let config = RelayServerConfig {
            dial_timeout: Duration::from_millis(200),
            ..RelayServerConfig::default()
        };
        let (server, addr) = start_server(config).await;

        let mut down = TcpStream::connect(addr).await.unwrap();
        write_command(
            &mut down,
            &RelayCommand::Connect {
                // TEST-NET address nobody answers on.
                target: "203.0.113.254:1".to_string(),
            },
        )
        .await
        .unwrap();
        let reply = expect_line(&mut down).await;
        assert_eq!(
            reply,
            RelayCommand::Error {
                reason: "peer not registered".to_string()
            }
        );

        // The second request fails fast out of the negative cache.
        let started = Instant::now();
        let mut again = TcpStream::connect(addr).await.unwrap();
        write_command(
            &mut again,
            &RelayCommand::Connect {
                target: "203.0.113.254:1".to_string(),
            },
        )
        .await
        .unwrap();
        let reply = expect_line(&mut again).await;
        assert_eq!(
            reply,
            RelayCommand::Error {
                reason: "peer not registered".to_string()
            }
        );
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(server.stats().total_sessions, 0);
    }

    #[tokio::test]
    async fn capacity_limit_rejects_with_distinct_reason() {
        let config = RelayServerConfig {
            max_sessions: 0,
            ..RelayServerConfig::default()
        };
        let (_server, addr) = start_server(config).await;

        let mut down = TcpStream::connect(addr).await.unwrap();
        write_command(
            &mut down,
            &RelayCommand::Connect {
                target: "203.0.113.9:6881".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            expect_line(&mut down).await,
            RelayCommand::Error {
                reason: "relay at capacity".to_string()
            }
        );
    }

    #[tokio::test]
    async fn malformed_opening_line_is_rejected() {
        let (_server, addr) = start_server(RelayServerConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        use tokio::io::AsyncWriteExt;
        stream.write_all(b"NOT-A-COMMAND\n").await.unwrap();
        let reply = expect_line(&mut stream).await;
        assert!(matches!(reply, RelayCommand::Error { .. }));
    }
}
