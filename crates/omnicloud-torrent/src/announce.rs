//! HTTP tracker announce client.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::Buf;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use reqwest::Client;
use serde::Deserialize;
use serde::de;
use url::Url;

use omnicloud_metainfo::InfoHash;

use crate::error::{EngineError, EngineResult};

/// Timeout applied to each announce request.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Percent-encode all non-alphanumeric bytes except `-._~`.
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Announce lifecycle events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// First announce for a torrent.
    Started,
    /// The torrent finished downloading.
    Completed,
    /// The torrent is leaving the swarm.
    Stopped,
    /// Periodic refresh; no event parameter on the wire.
    Interval,
}

impl AnnounceEvent {
    /// Wire value for the `event` query parameter, when any.
    #[must_use]
    pub const fn wire_value(self) -> Option<&'static str> {
        match self {
            Self::Started => Some("started"),
            Self::Completed => Some("completed"),
            Self::Stopped => Some("stopped"),
            Self::Interval => None,
        }
    }

    /// Label used in logs and the announce attempt log.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Interval => "",
        }
    }
}

/// Parameters for one announce.
#[derive(Clone, Debug)]
pub struct AnnounceRequest {
    /// Torrent being announced.
    pub info_hash: InfoHash,
    /// This node's peer id.
    pub peer_id: [u8; 20],
    /// Data port peers should connect to.
    pub port: u16,
    /// Bytes still needed; zero marks this peer a seeder.
    pub left: u64,
    /// Total bytes uploaded.
    pub uploaded: u64,
    /// Total bytes downloaded.
    pub downloaded: u64,
    /// Lifecycle event.
    pub event: AnnounceEvent,
}

/// A successful announce reply.
#[derive(Clone, Debug)]
pub struct AnnounceOutcome {
    /// Seconds until the next scheduled announce.
    pub interval: Duration,
    /// Seeder count reported by the tracker.
    pub complete: u64,
    /// Leecher count reported by the tracker.
    pub incomplete: u64,
    /// Peer addresses, excluding this announcer.
    pub peers: Vec<SocketAddr>,
    /// Relay endpoint injected by the tracker, when the relay is enabled.
    pub relay_hint: Option<SocketAddr>,
}

/// Raw bencoded tracker reply.
#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default)]
    complete: Option<u64>,
    #[serde(default)]
    incomplete: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_peers")]
    peers: Vec<SocketAddr>,
    #[serde(rename = "relay host")]
    relay_host: Option<String>,
    #[serde(rename = "relay port")]
    relay_port: Option<u16>,
}

/// HTTP tracker client.
pub struct AnnounceClient {
    client: Client,
    url: Url,
}

impl AnnounceClient {
    /// Construct a client pointing at an announce URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse.
    pub fn new(announce_url: &str) -> EngineResult<Self> {
        let url = Url::parse(announce_url).map_err(|err| EngineError::Announce {
            detail: format!("invalid announce url {announce_url}: {err}"),
        })?;
        let client = Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()
            .map_err(|err| EngineError::Announce {
                detail: format!("http client construction failed: {err}"),
            })?;
        Ok(Self { client, url })
    }

    /// Send one announce and parse the reply.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, bencode failure, or a tracker
    /// `failure reason`.
    pub async fn announce(&self, request: &AnnounceRequest) -> EngineResult<AnnounceOutcome> {
        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(
                "info_hash",
                &percent_encoding::percent_encode(request.info_hash.as_bytes(), URL_ENCODE_RESERVED)
                    .to_string(),
            );
            query.append_pair(
                "peer_id",
                &percent_encoding::percent_encode(&request.peer_id, URL_ENCODE_RESERVED)
                    .to_string(),
            );
            query.append_pair("port", &request.port.to_string());
            query.append_pair("left", &request.left.to_string());
            query.append_pair("uploaded", &request.uploaded.to_string());
            query.append_pair("downloaded", &request.downloaded.to_string());
            query.append_pair("compact", "1");
            if let Some(event) = request.event.wire_value() {
                query.append_pair("event", event);
            }
        }

        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| EngineError::Announce {
                detail: format!("announce transport failed: {err}"),
            })?
            .error_for_status()
            .map_err(|err| EngineError::Announce {
                detail: format!("announce status error: {err}"),
            })?
            .bytes()
            .await
            .map_err(|err| EngineError::Announce {
                detail: format!("announce body read failed: {err}"),
            })?;

        let raw: RawResponse =
            serde_bencode::from_bytes(&bytes).map_err(|err| EngineError::Announce {
                detail: format!("announce bencode decode failed: {err}"),
            })?;

        if let Some(reason) = raw.failure_reason {
            return Err(EngineError::Announce {
                detail: format!("tracker failure: {reason}"),
            });
        }

        let relay_hint = match (raw.relay_host, raw.relay_port) {
            (Some(host), Some(port)) => host
                .parse::<IpAddr>()
                .ok()
                .map(|ip| SocketAddr::new(ip, port)),
            _ => None,
        };

        Ok(AnnounceOutcome {
            interval: Duration::from_secs(raw.interval.unwrap_or(60)),
            complete: raw.complete.unwrap_or(0),
            incomplete: raw.incomplete.unwrap_or(0),
            peers: raw.peers,
            relay_hint,
        })
    }
}

impl fmt::Display for AnnounceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnnounceClient({})", self.url)
    }
}

fn deserialize_peers<'de, D>(deserializer: D) -> Result<Vec<SocketAddr>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Vec<SocketAddr>;

        fn expecting(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
            fmt.write_str("compact peer byte string")
        }

        fn visit_bytes<E>(self, mut bytes: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            const ENTRY: usize = 6;
            if bytes.len() % ENTRY != 0 {
                return Err(de::Error::custom(
                    "compact peers length must be a multiple of 6",
                ));
            }
            let mut peers = Vec::with_capacity(bytes.len() / ENTRY);
            while !bytes.is_empty() {
                let ip = Ipv4Addr::from(bytes.get_u32());
                let port = bytes.get_u16();
                peers.push(SocketAddr::new(IpAddr::V4(ip), port));
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(Visitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash([0x11; 20]),
            peer_id: *b"-OC0100-000000000001",
            port: 6881,
            left: 0,
            uploaded: 0,
            downloaded: 0,
            event: AnnounceEvent::Started,
        }
    }

    #[tokio::test]
    async fn announce_parses_peers_and_counts() {
        let mut server = mockito::Server::new_async().await;
        let body = {
            let mut body = Vec::new();
            body.extend_from_slice(b"d8:completei1e10:incompletei2e8:intervali60e5:peers6:");
            body.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1]);
            body.push(b'e');
            body
        };
        let mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let client = AnnounceClient::new(&server.url()).expect("client");
        let outcome = client.announce(&sample_request()).await.expect("announce");

        assert_eq!(outcome.interval, Duration::from_secs(60));
        assert_eq!(outcome.complete, 1);
        assert_eq!(outcome.incomplete, 2);
        assert_eq!(
            outcome.peers,
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 6881)]
        );
        assert!(outcome.relay_hint.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn announce_surfaces_relay_hint() {
        let mut server = mockito::Server::new_async().await;
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:completei0e10:incompletei0e8:intervali60e5:peers0:");
        body.extend_from_slice(b"10:relay host12:198.51.100.710:relay porti7070e");
        body.push(b'e');
        let _mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let client = AnnounceClient::new(&server.url()).expect("client");
        let outcome = client.announce(&sample_request()).await.expect("announce");
        assert_eq!(
            outcome.relay_hint,
            Some("198.51.100.7:7070".parse().expect("addr"))
        );
    }

    #[tokio::test]
    async fn failure_reason_becomes_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(b"d14:failure reason17:Invalid info_hashe".to_vec())
            .create_async()
            .await;

        let client = AnnounceClient::new(&server.url()).expect("client");
        let err = client
            .announce(&sample_request())
            .await
            .expect_err("must fail");
        match err {
            EngineError::Announce { detail } => assert!(detail.contains("Invalid info_hash")),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
