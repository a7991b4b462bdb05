//! End-to-end swarm exchange between two engines over loopback: one seeds
//! existing content, the other downloads it after learning the seeder's
//! address from a tracker reply.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use omnicloud_events::{EventBus, TorrentState};
use omnicloud_metainfo::{
    CheckpointStore, GenerationRequest, Metainfo, NullProgress, TorrentGenerator,
};
use omnicloud_torrent::{
    Engine, EngineConfig, MemoryPieceCache, NullReporter, StorageBinding, TorrentParams,
    generate_peer_id,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct NoCheckpoints;

#[async_trait::async_trait]
impl CheckpointStore for NoCheckpoints {
    async fn load_prefix(&self, _: Uuid, _: Uuid) -> anyhow::Result<Vec<[u8; 20]>> {
        Ok(Vec::new())
    }
    async fn record(&self, _: Uuid, _: Uuid, _: u32, _: [u8; 20]) -> anyhow::Result<()> {
        Ok(())
    }
    async fn clear(&self, _: Uuid, _: Uuid) -> anyhow::Result<()> {
        Ok(())
    }
}

async fn generate_meta(root: &Path, announce_url: &str) -> Metainfo {
    let outcome = TorrentGenerator::new(2)
        .generate(
            &GenerationRequest {
                package_id: Uuid::new_v4(),
                node_id: Uuid::new_v4(),
                root: root.to_path_buf(),
                piece_size: 64 * 1024,
                announce_url: announce_url.to_string(),
                created_by: "omnicloud test".to_string(),
            },
            Arc::new(NoCheckpoints),
            Arc::new(NullProgress),
            CancellationToken::new(),
        )
        .await
        .expect("generation");
    Metainfo::from_bytes(&outcome.descriptor.meta_bytes).expect("parse")
}

async fn spawn_engine(cancel: &CancellationToken) -> Engine {
    Engine::bind(
        EngineConfig {
            peer_id: generate_peer_id(),
            data_port: 0,
            own_addrs: HashSet::new(),
        },
        Arc::new(MemoryPieceCache::default()),
        Arc::new(NullReporter),
        EventBus::new(),
        cancel.clone(),
    )
    .await
    .expect("engine bind")
}

async fn wait_for_state(engine: &Engine, want: &TorrentState, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let snapshot = engine.snapshot();
        if snapshot.iter().any(|torrent| torrent.state == *want) {
            return;
        }
        if let Some(torrent) = snapshot.first() {
            if let TorrentState::Error { reason } = &torrent.state {
                panic!("torrent entered error state: {reason}");
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {want:?}; snapshot: {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn seed_then_download_across_two_engines() {
    let temp = tempfile::tempdir().unwrap();
    let lib_root = temp.path().join("lib");
    std::fs::create_dir_all(&lib_root).unwrap();
    let seed_root = omnicloud_test_support::fixtures::write_package(&lib_root, "PkgA", 512 * 1024).root;

    let cancel = CancellationToken::new();
    let seeder = spawn_engine(&cancel).await;
    let downloader = spawn_engine(&cancel).await;

    // The tracker hands the downloader exactly one peer: the seeder.
    let mut tracker = mockito::Server::new_async().await;
    let seeder_port = seeder.data_port();
    let reply = {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:completei1e10:incompletei0e8:intervali60e5:peers6:");
        body.extend_from_slice(&[127, 0, 0, 1]);
        body.extend_from_slice(&seeder_port.to_be_bytes());
        body.push(b'e');
        body
    };
    let _mock = tracker
        .mock("GET", mockito::Matcher::Any)
        .with_status(200)
        .with_body(reply)
        .expect_at_least(1)
        .create_async()
        .await;

    let metainfo = generate_meta(&seed_root, &tracker.url()).await;

    seeder
        .register(TorrentParams {
            metainfo: metainfo.clone(),
            binding: StorageBinding::Single {
                root: seed_root.clone(),
            },
            transfer_id: None,
            announce_url: tracker.url(),
        })
        .expect("seed registration");
    wait_for_state(&seeder, &TorrentState::Seeding, Duration::from_secs(10)).await;

    let download_root = temp.path().join("tor").join("downloads").join("PkgA");
    downloader
        .register(TorrentParams {
            metainfo: metainfo.clone(),
            binding: StorageBinding::Single {
                root: download_root.clone(),
            },
            transfer_id: Some(Uuid::new_v4()),
            announce_url: tracker.url(),
        })
        .expect("download registration");

    wait_for_state(&downloader, &TorrentState::Seeding, Duration::from_secs(30)).await;

    // The downloaded payload is byte-identical to the seeder's.
    for file in ["ASSETMAP", "CPL_feature.xml", "VIDEO.mxf"] {
        let original = std::fs::read(seed_root.join(file)).unwrap();
        let downloaded = std::fs::read(download_root.join(file)).unwrap();
        assert_eq!(original, downloaded, "{file} must round-trip");
    }

    // The downloader finished with every byte accounted for.
    let snapshot = downloader.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].bytes_done, snapshot[0].bytes_total);

    cancel.cancel();
}

#[tokio::test]
async fn seed_registration_with_missing_payload_enters_error() {
    let temp = tempfile::tempdir().unwrap();
    let lib_root = temp.path().join("lib");
    std::fs::create_dir_all(&lib_root).unwrap();
    let seed_root = omnicloud_test_support::fixtures::write_package(&lib_root, "PkgA", 512 * 1024).root;

    let cancel = CancellationToken::new();
    let engine = spawn_engine(&cancel).await;
    let metainfo = generate_meta(&seed_root, "http://127.0.0.1:1/announce").await;

    // Bind storage at a directory with no payload.
    engine
        .register(TorrentParams {
            metainfo,
            binding: StorageBinding::Single {
                root: temp.path().join("empty").join("PkgA"),
            },
            transfer_id: None,
            announce_url: "http://127.0.0.1:1/announce".to_string(),
        })
        .expect("registration");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = engine.snapshot();
        if snapshot
            .iter()
            .any(|torrent| matches!(torrent.state, TorrentState::Error { .. }))
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected error state, got {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cancel.cancel();
}
