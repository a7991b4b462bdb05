//! In-memory swarm bookkeeping.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use omnicloud_metainfo::InfoHash;

/// Tracker tunables.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Interval advertised to announcers.
    pub interval: Duration,
    /// Host substituted for loopback announcers, when configured. This is
    /// the only case where IP rewriting is allowed.
    pub advertise_host: Option<String>,
    /// Relay endpoint injected into replies when the relay is enabled.
    pub relay_hint: Option<(String, u16)>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            advertise_host: None,
            relay_hint: None,
        }
    }
}

/// One peer's swarm membership.
#[derive(Debug, Clone)]
pub(crate) struct PeerEntry {
    pub(crate) ip: IpAddr,
    pub(crate) port: u16,
    pub(crate) left: u64,
    pub(crate) expires: Instant,
    pub(crate) last_announce: DateTime<Utc>,
}

/// Per-swarm counters exposed to the observability UI.
#[derive(Debug, Clone, Serialize)]
pub struct SwarmSnapshot {
    /// Hex info-hash of the swarm.
    pub info_hash: String,
    /// Peers with nothing left to download.
    pub seeders: u64,
    /// Peers still downloading.
    pub leechers: u64,
    /// Total live peers.
    pub peers_count: usize,
    /// Most recent announce in the swarm.
    pub last_announce: Option<DateTime<Utc>>,
}

/// The tracker's shared state.
pub struct Tracker {
    pub(crate) config: TrackerConfig,
    swarms: StdMutex<HashMap<InfoHash, HashMap<[u8; 20], PeerEntry>>>,
}

impl Tracker {
    /// Construct a tracker with the given tunables.
    #[must_use]
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            swarms: StdMutex::new(HashMap::new()),
        }
    }

    /// Upsert a peer's membership with a TTL of twice the interval.
    pub(crate) fn upsert_peer(
        &self,
        info_hash: InfoHash,
        peer_id: [u8; 20],
        ip: IpAddr,
        port: u16,
        left: u64,
    ) {
        let ttl = self.config.interval * 2;
        let mut swarms = self.lock();
        let swarm = swarms.entry(info_hash).or_default();
        swarm.insert(
            peer_id,
            PeerEntry {
                ip,
                port,
                left,
                expires: Instant::now() + ttl,
                last_announce: Utc::now(),
            },
        );
    }

    /// Remove a peer on `event=stopped`.
    pub(crate) fn remove_peer(&self, info_hash: InfoHash, peer_id: &[u8; 20]) {
        let mut swarms = self.lock();
        if let Some(swarm) = swarms.get_mut(&info_hash) {
            swarm.remove(peer_id);
            if swarm.is_empty() {
                swarms.remove(&info_hash);
            }
        }
    }

    /// Live peers of a swarm (expired entries swept), the compact reply
    /// list excluding the announcing `(ip, port)` pair, and the swarm
    /// counts.
    pub(crate) fn swarm_reply(
        &self,
        info_hash: InfoHash,
        exclude_ip: IpAddr,
        exclude_port: u16,
    ) -> (u64, u64, Vec<u8>) {
        let now = Instant::now();
        let mut swarms = self.lock();
        let Some(swarm) = swarms.get_mut(&info_hash) else {
            return (0, 0, Vec::new());
        };
        swarm.retain(|_, entry| entry.expires > now);

        let mut complete = 0u64;
        let mut incomplete = 0u64;
        let mut compact = Vec::new();
        for entry in swarm.values() {
            if entry.left == 0 {
                complete += 1;
            } else {
                incomplete += 1;
            }
            if entry.ip == exclude_ip && entry.port == exclude_port {
                continue;
            }
            if let IpAddr::V4(v4) = entry.ip {
                compact.extend_from_slice(&v4.octets());
                compact.extend_from_slice(&entry.port.to_be_bytes());
            }
        }
        (complete, incomplete, compact)
    }

    /// Copy out per-swarm counters; no locks held during serialization.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SwarmSnapshot> {
        let now = Instant::now();
        let copied: Vec<(InfoHash, Vec<PeerEntry>)> = {
            let mut swarms = self.lock();
            swarms.retain(|_, swarm| {
                swarm.retain(|_, entry| entry.expires > now);
                !swarm.is_empty()
            });
            swarms
                .iter()
                .map(|(hash, swarm)| (*hash, swarm.values().cloned().collect()))
                .collect()
        };

        copied
            .into_iter()
            .map(|(info_hash, peers)| {
                let seeders = peers.iter().filter(|entry| entry.left == 0).count() as u64;
                let leechers = peers.len() as u64 - seeders;
                SwarmSnapshot {
                    info_hash: info_hash.to_hex(),
                    seeders,
                    leechers,
                    peers_count: peers.len(),
                    last_announce: peers.iter().map(|entry| entry.last_announce).max(),
                }
            })
            .collect()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<InfoHash, HashMap<[u8; 20], PeerEntry>>> {
        self.swarms
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn tracker() -> Tracker {
        Tracker::new(TrackerConfig::default())
    }

    #[test]
    fn reply_excludes_the_announcing_peer() {
        let tracker = tracker();
        let hash = InfoHash([1u8; 20]);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        tracker.upsert_peer(hash, [1; 20], ip, 6881, 0);
        tracker.upsert_peer(hash, [2; 20], other, 6881, 100);

        let (complete, incomplete, compact) = tracker.swarm_reply(hash, ip, 6881);
        assert_eq!(complete, 1);
        assert_eq!(incomplete, 1);
        // Only the other peer is in the compact list.
        assert_eq!(compact.len(), 6);
        assert_eq!(&compact[..4], &[10, 0, 0, 2]);
    }

    #[test]
    fn stopped_event_removes_the_peer() {
        let tracker = tracker();
        let hash = InfoHash([1u8; 20]);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        tracker.upsert_peer(hash, [1; 20], ip, 6881, 0);
        tracker.remove_peer(hash, &[1; 20]);
        assert!(tracker.snapshot().is_empty());
    }

    #[test]
    fn snapshot_counts_seeders_and_leechers() {
        let tracker = tracker();
        let hash = InfoHash([1u8; 20]);
        tracker.upsert_peer(hash, [1; 20], IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 1, 0);
        tracker.upsert_peer(hash, [2; 20], IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 2, 9);
        tracker.upsert_peer(hash, [3; 20], IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)), 3, 0);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].seeders, 2);
        assert_eq!(snapshot[0].leechers, 1);
        assert_eq!(snapshot[0].peers_count, 3);
        assert!(snapshot[0].last_announce.is_some());
    }

    #[test]
    fn reannounce_replaces_the_entry() {
        let tracker = tracker();
        let hash = InfoHash([1u8; 20]);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        tracker.upsert_peer(hash, [1; 20], ip, 6881, 100);
        tracker.upsert_peer(hash, [1; 20], ip, 6881, 0);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot[0].peers_count, 1);
        assert_eq!(snapshot[0].seeders, 1);
    }
}
