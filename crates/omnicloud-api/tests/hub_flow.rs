//! End-to-end hub API flow over real HTTP: registration and authorization,
//! dedup resolution, the hash-claim handshake, torrent commit, and transfer
//! dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use omnicloud_api::state::{ActivityStore, ApiConfig};
use omnicloud_api::{ApiState, HubHandlerImpl};
use omnicloud_catalog::CatalogStore;
use omnicloud_control::ControlHub;
use omnicloud_telemetry::Metrics;
use omnicloud_tracker::{Tracker, TrackerConfig};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const REGISTRATION_KEY: &str = "fleet-secret";

struct TestHub {
    base: String,
    client: reqwest::Client,
    _cancel: CancellationToken,
}

impl TestHub {
    async fn start() -> Self {
        let catalog = CatalogStore::open_in_memory().await.expect("catalog");
        let metrics = Metrics::new().expect("metrics");
        let activity = Arc::new(ActivityStore::default());
        let control = ControlHub::new(Arc::new(HubHandlerImpl::new(
            catalog.clone(),
            Arc::clone(&activity),
            metrics.clone(),
        )));
        let state = ApiState {
            catalog,
            tracker: Arc::new(Tracker::new(TrackerConfig::default())),
            control,
            relay: None,
            metrics,
            config: ApiConfig {
                registration_key: REGISTRATION_KEY.to_string(),
                version: "test".to_string(),
            },
            activity,
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener");
        let addr: SocketAddr = listener.local_addr().expect("addr");
        let cancel = CancellationToken::new();
        tokio::spawn(omnicloud_api::serve(state, listener, cancel.clone()));
        // Give axum a beat to start accepting.
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            base: format!("http://{addr}/api/v1"),
            client: reqwest::Client::new(),
            _cancel: cancel,
        }
    }

    async fn register(&self, name: &str, mac: &str) -> (Uuid, bool) {
        let response = self
            .client
            .post(format!("{}/servers/register", self.base))
            .json(&json!({
                "name": name,
                "mac": mac,
                "registration_key": REGISTRATION_KEY,
            }))
            .send()
            .await
            .expect("register call");
        assert!(response.status().is_success(), "registration must succeed");
        let body: serde_json::Value = response.json().await.expect("register body");
        (
            body["node"]["id"].as_str().unwrap().parse().unwrap(),
            body["node"]["authorized"].as_bool().unwrap(),
        )
    }

    async fn authorize(&self, node_id: Uuid) {
        let response = self
            .client
            .post(format!("{}/servers/{node_id}/authorize", self.base))
            .send()
            .await
            .expect("authorize call");
        assert!(response.status().is_success());
    }

    async fn upload_inventory(
        &self,
        node_id: Uuid,
        mac: &str,
        outer_fp: &str,
        inner_fp: &str,
    ) -> serde_json::Value {
        let response = self
            .client
            .post(format!("{}/servers/{node_id}/inventory", self.base))
            .header("X-Server-ID", node_id.to_string())
            .header("X-MAC-Address", mac)
            .json(&json!({
                "items": [{
                    "outer_fp": outer_fp,
                    "inner_fp": inner_fp,
                    "title": "PkgA",
                    "kind": "feature",
                    "size_bytes": 2_097_202,
                    "file_count": 2,
                    "local_path": "/lib/PkgA",
                }]
            }))
            .send()
            .await
            .expect("inventory call");
        assert!(response.status().is_success(), "inventory must succeed");
        response.json().await.expect("inventory body")
    }

    async fn queue_check(&self, node_id: Uuid, mac: &str, package_id: Uuid) -> serde_json::Value {
        let response = self
            .client
            .get(format!(
                "{}/torrent-queue/check?package_id={package_id}",
                self.base
            ))
            .header("X-Server-ID", node_id.to_string())
            .header("X-MAC-Address", mac)
            .send()
            .await
            .expect("queue check call");
        assert!(response.status().is_success());
        response.json().await.expect("queue check body")
    }
}

#[tokio::test]
async fn registration_requires_the_shared_key() {
    let hub = TestHub::start().await;
    let response = hub
        .client
        .post(format!("{}/servers/register", hub.base))
        .json(&json!({
            "name": "rogue",
            "mac": "ff:ff:ff:ff:ff:ff",
            "registration_key": "wrong",
        }))
        .send()
        .await
        .expect("register call");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unauthorized_nodes_cannot_use_site_surfaces() {
    let hub = TestHub::start().await;
    let (node_id, authorized) = hub.register("site-01", "aa:bb:cc:00:00:01").await;
    assert!(!authorized, "fresh nodes start unauthorized");

    // Before authorization: 403.
    let response = hub
        .client
        .get(format!("{}/servers/{node_id}/pending-transfers", hub.base))
        .header("X-Server-ID", node_id.to_string())
        .header("X-MAC-Address", "aa:bb:cc:00:00:01")
        .send()
        .await
        .expect("pending call");
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

    hub.authorize(node_id).await;

    // Wrong MAC after authorization: 401.
    let response = hub
        .client
        .get(format!("{}/servers/{node_id}/pending-transfers", hub.base))
        .header("X-Server-ID", node_id.to_string())
        .header("X-MAC-Address", "00:00:00:00:00:00")
        .send()
        .await
        .expect("pending call");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    // Correct identity: empty assignment list.
    let response = hub
        .client
        .get(format!("{}/servers/{node_id}/pending-transfers", hub.base))
        .header("X-Server-ID", node_id.to_string())
        .header("X-MAC-Address", "aa:bb:cc:00:00:01")
        .send()
        .await
        .expect("pending call");
    assert!(response.status().is_success());
    let transfers: Vec<serde_json::Value> = response.json().await.expect("body");
    assert!(transfers.is_empty());
}

#[tokio::test]
async fn dedup_attaches_duplicate_deliveries_to_the_canonical_package() {
    let hub = TestHub::start().await;
    let (n1, _) = hub.register("site-01", "aa:bb:cc:00:00:01").await;
    let (n2, _) = hub.register("site-02", "aa:bb:cc:00:00:02").await;
    hub.authorize(n1).await;
    hub.authorize(n2).await;

    // N1 delivers the canonical copy.
    let first = hub
        .upload_inventory(n1, "aa:bb:cc:00:00:01", "U1", "C1")
        .await;
    let canonical: Uuid = first["resolutions"][0]["package_id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(first["resolutions"][0]["duplicate_of_canonical"], false);

    // N2 delivers the same composition under a different outer fingerprint.
    let second = hub
        .upload_inventory(n2, "aa:bb:cc:00:00:02", "U2", "C1")
        .await;
    assert_eq!(second["resolutions"][0]["duplicate_of_canonical"], true);
    let attached: Uuid = second["resolutions"][0]["package_id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(attached, canonical, "duplicate attaches to the canonical package");

    // Idempotence: a rescan changes nothing.
    let again = hub
        .upload_inventory(n2, "aa:bb:cc:00:00:02", "U2", "C1")
        .await;
    assert_eq!(again["resolutions"][0]["package_id"], second["resolutions"][0]["package_id"]);

    // Exactly one canonical package exists, with both nodes as holders.
    let detail: serde_json::Value = hub
        .client
        .get(format!("{}/packages/{canonical}", hub.base))
        .send()
        .await
        .expect("package call")
        .json()
        .await
        .expect("package body");
    let holders = detail["holders"].as_array().unwrap();
    assert_eq!(holders.len(), 2);
}

#[tokio::test]
async fn hash_claim_handshake_and_commit() {
    let hub = TestHub::start().await;
    let (n1, _) = hub.register("site-01", "aa:bb:cc:00:00:01").await;
    let (n2, _) = hub.register("site-02", "aa:bb:cc:00:00:02").await;
    hub.authorize(n1).await;
    hub.authorize(n2).await;

    let upload = hub
        .upload_inventory(n1, "aa:bb:cc:00:00:01", "U1", "C1")
        .await;
    assert!(upload["resolutions"][0]["torrent"].is_null());
    let package_id: Uuid = upload["resolutions"][0]["package_id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    // First asker wins the claim; the second is denied with the holder.
    let first = hub.queue_check(n1, "aa:bb:cc:00:00:01", package_id).await;
    assert_eq!(first["should_hash"], true);
    let second = hub.queue_check(n2, "aa:bb:cc:00:00:02", package_id).await;
    assert_eq!(second["should_hash"], false);
    assert_eq!(second["holder"].as_str().unwrap(), n1.to_string());

    // The winner commits its descriptor.
    let info_hash = "ab".repeat(20);
    let response = hub
        .client
        .post(format!("{}/torrents", hub.base))
        .header("X-Server-ID", n1.to_string())
        .header("X-MAC-Address", "aa:bb:cc:00:00:01")
        .json(&json!({
            "package_id": package_id,
            "info_hash": info_hash,
            "piece_size": 262_144,
            "pieces_count": 9,
            "file_count": 2,
            "total_bytes": 2_097_202,
            "meta_b64": BASE64.encode(b"d4:infod4:name4:PkgAee"),
            "local_path": "/lib/PkgA",
        }))
        .send()
        .await
        .expect("commit call");
    assert!(response.status().is_success(), "commit must succeed");

    // Any later probe sees the torrent instead of a free claim.
    let after = hub.queue_check(n2, "aa:bb:cc:00:00:02", package_id).await;
    assert_eq!(after["torrent_exists"], true);

    // The .torrent bytes round-trip through the file endpoint.
    let bytes = hub
        .client
        .get(format!("{}/torrents/{info_hash}/file", hub.base))
        .send()
        .await
        .expect("file call");
    assert_eq!(
        bytes.headers()["content-type"],
        "application/x-bittorrent"
    );
    assert_eq!(bytes.bytes().await.unwrap().as_ref(), b"d4:infod4:name4:PkgAee");
}

#[tokio::test]
async fn transfer_dispatch_and_completion_writes_inventory() {
    let hub = TestHub::start().await;
    let (n1, _) = hub.register("site-01", "aa:bb:cc:00:00:01").await;
    let (n3, _) = hub.register("site-03", "aa:bb:cc:00:00:03").await;
    hub.authorize(n1).await;
    hub.authorize(n3).await;

    let upload = hub
        .upload_inventory(n1, "aa:bb:cc:00:00:01", "U1", "C1")
        .await;
    let package_id: Uuid = upload["resolutions"][0]["package_id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    let _ = hub.queue_check(n1, "aa:bb:cc:00:00:01", package_id).await;
    let commit: serde_json::Value = hub
        .client
        .post(format!("{}/torrents", hub.base))
        .header("X-Server-ID", n1.to_string())
        .header("X-MAC-Address", "aa:bb:cc:00:00:01")
        .json(&json!({
            "package_id": package_id,
            "info_hash": "cd".repeat(20),
            "piece_size": 262_144,
            "pieces_count": 9,
            "file_count": 2,
            "total_bytes": 2_097_202,
            "meta_b64": BASE64.encode(b"meta"),
            "local_path": "/lib/PkgA",
        }))
        .send()
        .await
        .expect("commit call")
        .json()
        .await
        .expect("commit body");
    let torrent_id: Uuid = commit["id"].as_str().unwrap().parse().unwrap();

    // Operator assigns the torrent to N3.
    let transfer: serde_json::Value = hub
        .client
        .post(format!("{}/transfers", hub.base))
        .json(&json!({
            "torrent_id": torrent_id,
            "dest_node": n3,
            "priority": 1,
        }))
        .send()
        .await
        .expect("create call")
        .json()
        .await
        .expect("create body");
    let transfer_id: Uuid = transfer["id"].as_str().unwrap().parse().unwrap();

    // N3 sees the assignment with the info-hash resolved.
    let pending: Vec<serde_json::Value> = hub
        .client
        .get(format!("{}/servers/{n3}/pending-transfers", hub.base))
        .header("X-Server-ID", n3.to_string())
        .header("X-MAC-Address", "aa:bb:cc:00:00:03")
        .send()
        .await
        .expect("pending call")
        .json()
        .await
        .expect("pending body");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["info_hash"].as_str().unwrap(), "cd".repeat(20));

    // Progress flows through the guarded transitions.
    for body in [
        json!({"status": "downloading", "progress_pct": 40.0}),
        json!({"status": "completed", "progress_pct": 100.0, "local_path": "/tor/downloads/PkgA"}),
    ] {
        let response = hub
            .client
            .put(format!("{}/transfers/{transfer_id}", hub.base))
            .json(&body)
            .send()
            .await
            .expect("progress call");
        assert!(response.status().is_success(), "progress must apply");
    }

    // Completion wrote N3's inventory row.
    let detail: serde_json::Value = hub
        .client
        .get(format!("{}/packages/{package_id}", hub.base))
        .send()
        .await
        .expect("package call")
        .json()
        .await
        .expect("package body");
    let holders: Vec<String> = detail["holders"]
        .as_array()
        .unwrap()
        .iter()
        .map(|value| value.as_str().unwrap().to_string())
        .collect();
    assert!(holders.contains(&n3.to_string()));

    // Terminal protection: a late status change is rejected with 409.
    let response = hub
        .client
        .put(format!("{}/transfers/{transfer_id}", hub.base))
        .json(&json!({"status": "downloading"}))
        .send()
        .await
        .expect("late call");
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
}
