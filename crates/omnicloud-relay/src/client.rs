//! Site-side relay client: persistent control connection, relayed inbound
//! listener, and the delayed fallback dialer.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use omnicloud_torrent::PeerDialer;

use crate::error::{RelayError, RelayResult};
use crate::protocol::{RelayCommand, read_line, write_command};

/// Initial reconnect delay.
const RECONNECT_BASE: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling.
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// A connection stable for this long resets the backoff.
const STABLE_AFTER: Duration = Duration::from_secs(60);

/// Keepalive cadence on the control connection.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long the dialer waits before falling back to the relay, giving direct
/// TCP the chance to win when it works.
const DIAL_FALLBACK_DELAY: Duration = Duration::from_secs(1);

/// Relay dial timeout.
const RELAY_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered inbound data connections not yet drained by the accept loop.
const DATA_CONN_BUFFER: usize = 16;

/// Persistent control-connection client for a NATted seeder.
pub struct RelayClient;

impl RelayClient {
    /// Start the control loop. Returns the listener that yields relayed
    /// inbound connections; the loop reconnects with capped backoff until
    /// `cancel` fires.
    #[must_use]
    pub fn start(
        relay_addr: String,
        adv_addr: String,
        cancel: CancellationToken,
    ) -> RelayListener {
        let (data_tx, data_rx) = mpsc::channel(DATA_CONN_BUFFER);
        tokio::spawn(control_loop(relay_addr, adv_addr, data_tx, cancel));
        RelayListener { inbound: data_rx }
    }
}

async fn control_loop(
    relay_addr: String,
    adv_addr: String,
    data_tx: mpsc::Sender<TcpStream>,
    cancel: CancellationToken,
) {
    let mut backoff = RECONNECT_BASE;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let attempt_started = std::time::Instant::now();
        match run_control_once(&relay_addr, &adv_addr, &data_tx, &cancel).await {
            Ok(()) => return,
            Err(err) => {
                if cancel.is_cancelled() {
                    return;
                }
                warn!(relay = %relay_addr, error = %err, "relay control connection lost");
            }
        }
        if attempt_started.elapsed() > STABLE_AFTER {
            backoff = RECONNECT_BASE;
        }
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RECONNECT_CAP);
    }
}

async fn run_control_once(
    relay_addr: &str,
    adv_addr: &str,
    data_tx: &mpsc::Sender<TcpStream>,
    cancel: &CancellationToken,
) -> RelayResult<()> {
    let mut stream = TcpStream::connect(relay_addr)
        .await
        .map_err(RelayError::io("relay_client.connect"))?;
    write_command(
        &mut stream,
        &RelayCommand::Register {
            adv_addr: adv_addr.to_string(),
        },
    )
    .await?;
    match RelayCommand::parse(&read_line(&mut stream).await?)? {
        RelayCommand::Ok { .. } => {}
        RelayCommand::Error { reason } => return Err(RelayError::Rejected { reason }),
        other => {
            return Err(RelayError::Protocol {
                line: format!("unexpected register reply {other:?}"),
            });
        }
    }
    info!(relay = %relay_addr, adv_addr = %adv_addr, "relay registration established");

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = tokio::io::BufReader::new(read_half);
    let mut ping_tick = tokio::time::interval(PING_INTERVAL);
    ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            _ = ping_tick.tick() => {
                write_command(&mut write_half, &RelayCommand::Ping).await?;
            }
            line = read_line(&mut reader) => {
                match RelayCommand::parse(&line?)? {
                    RelayCommand::Ping => {
                        write_command(&mut write_half, &RelayCommand::Pong).await?;
                    }
                    RelayCommand::Pong => {}
                    RelayCommand::SessionRequest { session_id } => {
                        let relay_addr = relay_addr.to_string();
                        let data_tx = data_tx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = open_data_conn(&relay_addr, &session_id, &data_tx).await {
                                warn!(
                                    session_id = %session_id,
                                    error = %err,
                                    "relay data connection failed"
                                );
                            }
                        });
                    }
                    other => {
                        return Err(RelayError::Protocol {
                            line: format!("unexpected control command {other:?}"),
                        });
                    }
                }
            }
        }
    }
}

async fn open_data_conn(
    relay_addr: &str,
    session_id: &str,
    data_tx: &mpsc::Sender<TcpStream>,
) -> RelayResult<()> {
    let mut stream = TcpStream::connect(relay_addr)
        .await
        .map_err(RelayError::io("relay_client.data_connect"))?;
    write_command(
        &mut stream,
        &RelayCommand::Session {
            session_id: session_id.to_string(),
        },
    )
    .await?;
    match RelayCommand::parse(&read_line(&mut stream).await?)? {
        RelayCommand::Ok { .. } => {}
        RelayCommand::Error { reason } => return Err(RelayError::Rejected { reason }),
        other => {
            return Err(RelayError::Protocol {
                line: format!("unexpected session reply {other:?}"),
            });
        }
    }
    debug!(session_id = %session_id, "relay data connection bound");
    data_tx
        .send(stream)
        .await
        .map_err(|_err| RelayError::Io {
            operation: "relay_client.hand_off",
            source: std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "accept loop gone",
            ),
        })
}

/// Yields relayed inbound connections so they look like any other inbound
/// peer to the engine's accept path.
pub struct RelayListener {
    inbound: mpsc::Receiver<TcpStream>,
}

impl RelayListener {
    /// Next relayed connection; `None` once the control loop has stopped.
    pub async fn accept(&mut self) -> Option<TcpStream> {
        self.inbound.recv().await
    }
}

/// Fallback dialer registered with the engine: waits briefly so direct TCP
/// wins when it works, then opens the connection through the relay. The
/// engine's own-address set keeps it from dialing this node itself.
pub struct RelayDialer {
    relay_addr: String,
}

impl RelayDialer {
    /// Construct a dialer pointing at the hub relay.
    #[must_use]
    pub fn new(relay_addr: String) -> Self {
        Self { relay_addr }
    }
}

#[async_trait]
impl PeerDialer for RelayDialer {
    fn name(&self) -> &'static str {
        "relay"
    }

    async fn dial(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        tokio::time::sleep(DIAL_FALLBACK_DELAY).await;

        let connect = async {
            let mut stream = TcpStream::connect(&self.relay_addr).await?;
            write_command(
                &mut stream,
                &RelayCommand::Connect {
                    target: addr.to_string(),
                },
            )
            .await
            .map_err(relay_to_io)?;
            let reply = read_line(&mut stream).await.map_err(relay_to_io)?;
            match RelayCommand::parse(&reply).map_err(relay_to_io)? {
                RelayCommand::Ok { .. } => Ok(stream),
                RelayCommand::Error { reason } => Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("relay refused session: {reason}"),
                )),
                other => Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unexpected relay reply {other:?}"),
                )),
            }
        };
        tokio::time::timeout(RELAY_DIAL_TIMEOUT, connect)
            .await
            .map_err(|_elapsed| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "relay dial timed out")
            })?
    }
}

fn relay_to_io(err: RelayError) -> std::io::Error {
    std::io::Error::other(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{RelayServer, RelayServerConfig};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Full client/server path: a registered client receives a relayed
    /// inbound connection when a downloader dials through the relay.
    #[tokio::test]
    async fn dialer_reaches_registered_client_through_the_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = listener.local_addr().unwrap();
        let server = RelayServer::new(RelayServerConfig::default());
        tokio::spawn(Arc::clone(&server).run(listener, CancellationToken::new()));

        let cancel = CancellationToken::new();
        let adv_addr = "203.0.113.9:6881".to_string();
        let mut relayed = RelayClient::start(relay_addr.to_string(), adv_addr.clone(), cancel.clone());

        // Give the registration a moment to land.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while server.stats().registered == 0 {
            assert!(tokio::time::Instant::now() < deadline, "registration timed out");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let dialer = RelayDialer::new(relay_addr.to_string());
        let target: SocketAddr = adv_addr.parse().unwrap();
        let (dial_result, accepted) =
            tokio::join!(dialer.dial(target), async { relayed.accept().await });

        let mut downloader_side = dial_result.expect("dial through relay");
        let mut seeder_side = accepted.expect("relayed inbound connection");

        downloader_side.write_all(b"hello through the bridge").await.unwrap();
        downloader_side.shutdown().await.unwrap();
        let mut received = Vec::new();
        seeder_side.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello through the bridge");

        cancel.cancel();
    }

    #[tokio::test]
    async fn dialer_errors_for_unknown_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = listener.local_addr().unwrap();
        let server = RelayServer::new(RelayServerConfig {
            dial_timeout: Duration::from_millis(200),
            ..RelayServerConfig::default()
        });
        tokio::spawn(Arc::clone(&server).run(listener, CancellationToken::new()));

        let dialer = RelayDialer::new(relay_addr.to_string());
        let err = dialer
            .dial("203.0.113.254:1".parse().unwrap())
            .await
            .expect_err("must fail");
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
