//! The HTTP announce endpoint and tracker router.
//!
//! `info_hash` and `peer_id` arrive as percent-encoded raw bytes, so the
//! query string is parsed by hand; serde-style extraction would mangle the
//! non-UTF8 values.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Serialize;
use serde_bytes::ByteBuf;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use omnicloud_metainfo::InfoHash;

use crate::swarm::Tracker;

/// One row destined for the append-only announce attempt log.
#[derive(Debug, Clone)]
pub struct AnnounceRecord {
    /// Hex info-hash as received (possibly invalid).
    pub info_hash: String,
    /// Peer id, lossily decoded for display.
    pub peer_id: String,
    /// Resolved client IP.
    pub ip: String,
    /// Announced data port.
    pub port: u16,
    /// Event label.
    pub event: String,
    /// `ok` or `error`.
    pub status: String,
    /// Failure reason when status is `error`.
    pub reason: Option<String>,
}

/// Persistence seam for the announce attempt log.
#[async_trait]
pub trait AnnounceLog: Send + Sync {
    /// Append one attempt. Failures are logged by the caller, never fatal to
    /// the reply.
    async fn record(&self, record: AnnounceRecord) -> anyhow::Result<()>;
}

/// Discards attempts; used by tests.
pub struct NullAnnounceLog;

#[async_trait]
impl AnnounceLog for NullAnnounceLog {
    async fn record(&self, _record: AnnounceRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
struct TrackerState {
    tracker: Arc<Tracker>,
    log: Arc<dyn AnnounceLog>,
}

/// Build the tracker router.
#[must_use]
pub fn router(tracker: Arc<Tracker>, log: Arc<dyn AnnounceLog>) -> Router {
    Router::new()
        .route("/announce", get(announce))
        .route("/snapshot", get(snapshot))
        .with_state(TrackerState { tracker, log })
}

/// Serve the tracker until cancelled.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn serve(
    tracker: Arc<Tracker>,
    log: Arc<dyn AnnounceLog>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "tracker listening");
    let app = router(tracker, log).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

#[derive(Serialize)]
struct AnnounceReply {
    complete: u64,
    incomplete: u64,
    interval: u64,
    peers: ByteBuf,
    #[serde(rename = "relay host", skip_serializing_if = "Option::is_none")]
    relay_host: Option<String>,
    #[serde(rename = "relay port", skip_serializing_if = "Option::is_none")]
    relay_port: Option<u16>,
}

#[derive(Serialize)]
struct FailureReply {
    #[serde(rename = "failure reason")]
    failure_reason: String,
}

async fn snapshot(State(state): State<TrackerState>) -> impl IntoResponse {
    axum::Json(state.tracker.snapshot())
}

#[allow(clippy::too_many_lines)]
async fn announce(
    State(state): State<TrackerState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    let params = parse_query(query.as_deref().unwrap_or(""));

    let peer_id_raw = params.bytes("peer_id").unwrap_or_default();
    let peer_id_display = String::from_utf8_lossy(&peer_id_raw).to_string();
    let event = params.text("event").unwrap_or_default();
    let port = params
        .text("port")
        .and_then(|raw| raw.parse::<u16>().ok())
        .unwrap_or(0);
    let ip = resolve_client_ip(&headers, remote.ip(), params.text("ip"), &state.tracker);

    let info_hash_raw = params.bytes("info_hash").unwrap_or_default();
    let info_hash = match InfoHash::from_slice(&info_hash_raw) {
        Ok(hash) => hash,
        Err(_err) => {
            let record = AnnounceRecord {
                info_hash: hex::encode(&info_hash_raw),
                peer_id: peer_id_display,
                ip: ip.to_string(),
                port,
                event,
                status: "error".to_string(),
                reason: Some("Invalid info_hash".to_string()),
            };
            log_attempt(&state, record).await;
            return bencoded(&FailureReply {
                failure_reason: "Invalid info_hash".to_string(),
            });
        }
    };

    let peer_id: [u8; 20] = match peer_id_raw.as_slice().try_into() {
        Ok(peer_id) => peer_id,
        Err(_err) => {
            let record = AnnounceRecord {
                info_hash: info_hash.to_hex(),
                peer_id: peer_id_display,
                ip: ip.to_string(),
                port,
                event,
                status: "error".to_string(),
                reason: Some("Invalid peer_id".to_string()),
            };
            log_attempt(&state, record).await;
            return bencoded(&FailureReply {
                failure_reason: "Invalid peer_id".to_string(),
            });
        }
    };

    let left = params
        .text("left")
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(0);

    if event == "stopped" {
        state.tracker.remove_peer(info_hash, &peer_id);
    } else {
        state.tracker.upsert_peer(info_hash, peer_id, ip, port, left);
    }

    let (complete, incomplete, peers) = state.tracker.swarm_reply(info_hash, ip, port);
    let config = &state.tracker.config;
    let (relay_host, relay_port) = config
        .relay_hint
        .clone()
        .map_or((None, None), |(host, port)| (Some(host), Some(port)));

    debug!(
        info_hash = %info_hash,
        ip = %ip,
        port,
        event = %event,
        complete,
        incomplete,
        "announce"
    );
    let record = AnnounceRecord {
        info_hash: info_hash.to_hex(),
        peer_id: peer_id_display,
        ip: ip.to_string(),
        port,
        event,
        status: "ok".to_string(),
        reason: None,
    };
    log_attempt(&state, record).await;

    bencoded(&AnnounceReply {
        complete,
        incomplete,
        interval: config.interval.as_secs(),
        peers: ByteBuf::from(peers),
        relay_host,
        relay_port,
    })
}

async fn log_attempt(state: &TrackerState, record: AnnounceRecord) {
    if let Err(err) = state.log.record(record).await {
        warn!(error = %err, "announce attempt could not be logged");
    }
}

/// Resolve the client IP: `X-Forwarded-For` first entry, else `X-Real-IP`,
/// else the socket address. Loopback is substituted with the advertise host
/// when one is configured so loopback seeders appear reachable to external
/// peers.
fn resolve_client_ip(
    headers: &HeaderMap,
    remote: IpAddr,
    explicit: Option<String>,
    tracker: &Tracker,
) -> IpAddr {
    let derived = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<IpAddr>().ok())
        })
        .or_else(|| explicit.and_then(|value| value.parse::<IpAddr>().ok()))
        .unwrap_or(remote);

    if derived.is_loopback() {
        if let Some(advertise) = &tracker.config.advertise_host {
            if let Ok(substituted) = advertise.parse::<IpAddr>() {
                return substituted;
            }
        }
    }
    derived
}

fn bencoded<T: Serialize>(value: &T) -> axum::response::Response {
    match serde_bencode::to_bytes(value) {
        Ok(bytes) => (
            [(axum::http::header::CONTENT_TYPE, "text/plain")],
            bytes,
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "bencode serialization failed");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Hand-parsed query parameters preserving raw bytes.
struct QueryParams {
    pairs: HashMap<String, Vec<u8>>,
}

impl QueryParams {
    fn bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.pairs.get(key).cloned()
    }

    fn text(&self, key: &str) -> Option<String> {
        self.pairs
            .get(key)
            .map(|raw| String::from_utf8_lossy(raw).to_string())
    }
}

fn parse_query(query: &str) -> QueryParams {
    let mut pairs = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = percent_encoding::percent_decode_str(key)
            .decode_utf8_lossy()
            .to_string();
        // '+' means space in query strings; the clients here never send
        // either, but be strict about the raw byte decode.
        let value: Vec<u8> = percent_encoding::percent_decode_str(value).collect();
        pairs.insert(key, value);
    }
    QueryParams { pairs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::TrackerConfig;
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct MemoryLog {
        records: StdMutex<Vec<AnnounceRecord>>,
    }

    #[async_trait]
    impl AnnounceLog for MemoryLog {
        async fn record(&self, record: AnnounceRecord) -> anyhow::Result<()> {
            self.records.lock().unwrap().push(record);
            Ok(())
        }
    }

    fn state_with(config: TrackerConfig) -> (TrackerState, Arc<MemoryLog>) {
        let log = Arc::new(MemoryLog {
            records: StdMutex::new(Vec::new()),
        });
        (
            TrackerState {
                tracker: Arc::new(Tracker::new(config)),
                log: Arc::clone(&log) as Arc<dyn AnnounceLog>,
            },
            log,
        )
    }

    fn encode_bytes(bytes: &[u8]) -> String {
        percent_encoding::percent_encode(bytes, percent_encoding::NON_ALPHANUMERIC).to_string()
    }

    async fn call(
        state: &TrackerState,
        query: &str,
        remote: SocketAddr,
        headers: HeaderMap,
    ) -> Vec<u8> {
        let response = announce(
            State(state.clone()),
            ConnectInfo(remote),
            headers,
            RawQuery(Some(query.to_string())),
        )
        .await
        .into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        body.to_vec()
    }

    fn query_for(info_hash: &[u8], peer_id: &[u8], port: u16, left: u64, event: &str) -> String {
        format!(
            "info_hash={}&peer_id={}&port={port}&left={left}&uploaded=0&downloaded=0&compact=1&event={event}",
            encode_bytes(info_hash),
            encode_bytes(peer_id),
        )
    }

    #[tokio::test]
    async fn invalid_info_hash_fails_without_swarm_mutation() {
        let (state, log) = state_with(TrackerConfig::default());
        let body = call(
            &state,
            &query_for(&[0u8; 10], &[b'x'; 20], 6881, 0, "started"),
            "10.0.0.1:9999".parse().unwrap(),
            HeaderMap::new(),
        )
        .await;

        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("failure reason"));
        assert!(text.contains("Invalid info_hash"));
        assert!(state.tracker.snapshot().is_empty());

        let records = log.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, "error");
    }

    #[tokio::test]
    async fn announce_registers_and_excludes_caller() {
        let (state, log) = state_with(TrackerConfig::default());
        let hash = [7u8; 20];

        // First seeder.
        let _ = call(
            &state,
            &query_for(&hash, &[b'a'; 20], 6881, 0, "started"),
            "10.0.0.1:5000".parse().unwrap(),
            HeaderMap::new(),
        )
        .await;
        // Second peer announces and should see only the first.
        let body = call(
            &state,
            &query_for(&hash, &[b'b'; 20], 6882, 100, "started"),
            "10.0.0.2:5000".parse().unwrap(),
            HeaderMap::new(),
        )
        .await;

        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("8:completei1e"));
        assert!(text.contains("10:incompletei1e"));
        // One compact peer entry: 10.0.0.1:6881.
        let needle: &[u8] = &[10, 0, 0, 1, 0x1a, 0xe1];
        assert!(
            body.windows(needle.len()).any(|window| window == needle),
            "reply must carry the first peer"
        );
        let own: &[u8] = &[10, 0, 0, 2];
        let peers_section = &body[body.windows(5).position(|w| w == b"peers").unwrap()..];
        assert!(
            !peers_section.windows(own.len()).any(|window| window == own),
            "reply must exclude the announcing peer"
        );
        assert_eq!(log.records.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn forwarded_header_wins_and_loopback_is_substituted() {
        let config = TrackerConfig {
            advertise_host: Some("198.51.100.50".to_string()),
            ..TrackerConfig::default()
        };
        let (state, _log) = state_with(config);
        let hash = [9u8; 20];

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.77, 10.0.0.1".parse().unwrap());
        let _ = call(
            &state,
            &query_for(&hash, &[b'a'; 20], 6881, 0, "started"),
            "127.0.0.1:4000".parse().unwrap(),
            headers,
        )
        .await;

        // Loopback announcer (no forwarding headers) is rewritten to the
        // advertise host so external peers can reach it.
        let body = call(
            &state,
            &query_for(&hash, &[b'b'; 20], 6882, 100, "started"),
            "127.0.0.1:4001".parse().unwrap(),
            HeaderMap::new(),
        )
        .await;
        let forwarded: &[u8] = &[203, 0, 113, 77];
        assert!(
            body.windows(4).any(|window| window == forwarded),
            "x-forwarded-for peer visible"
        );

        let third = call(
            &state,
            &query_for(&hash, &[b'c'; 20], 6883, 100, "started"),
            "10.9.9.9:4002".parse().unwrap(),
            HeaderMap::new(),
        )
        .await;
        let substituted: &[u8] = &[198, 51, 100, 50];
        assert!(
            third.windows(4).any(|window| window == substituted),
            "loopback seeder appears under the advertise host"
        );
    }

    #[tokio::test]
    async fn relay_hint_is_injected_when_enabled() {
        let config = TrackerConfig {
            relay_hint: Some(("198.51.100.7".to_string(), 7070)),
            ..TrackerConfig::default()
        };
        let (state, _log) = state_with(config);
        let body = call(
            &state,
            &query_for(&[3u8; 20], &[b'a'; 20], 6881, 0, "started"),
            "10.0.0.1:4000".parse().unwrap(),
            HeaderMap::new(),
        )
        .await;
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("10:relay host12:198.51.100.7"));
        assert!(text.contains("10:relay porti7070e"));
    }

    #[tokio::test]
    async fn stopped_event_clears_membership() {
        let (state, _log) = state_with(TrackerConfig {
            interval: Duration::from_secs(60),
            ..TrackerConfig::default()
        });
        let hash = [5u8; 20];
        let remote: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 4000);
        let _ = call(
            &state,
            &query_for(&hash, &[b'a'; 20], 6881, 0, "started"),
            remote,
            HeaderMap::new(),
        )
        .await;
        assert_eq!(state.tracker.snapshot().len(), 1);

        let _ = call(
            &state,
            &query_for(&hash, &[b'a'; 20], 6881, 0, "stopped"),
            remote,
            HeaderMap::new(),
        )
        .await;
        assert!(state.tracker.snapshot().is_empty());
    }
}
