//! Resumable multi-worker torrent generation.
//!
//! The package's files are enumerated in stable lexical order by relative
//! path and treated as one concatenated byte stream, partitioned into
//! `piece_size` slices. A bounded pool of hash workers consumes piece jobs; a
//! sequencer commits results in strict piece-index order so the persisted
//! checkpoints always form a contiguous prefix. A generator killed mid-run
//! resumes from the first missing checkpoint index and produces the same
//! info-hash as an uninterrupted run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{MetainfoError, MetainfoResult};
use crate::metainfo::{FileEntry, Info, Metainfo, TorrentDescriptor};

/// Read granularity while filling piece buffers.
const READ_CHUNK: usize = 64 * 1024;

/// Inputs for one generation run.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Package being hashed.
    pub package_id: Uuid,
    /// Node performing the hashing.
    pub node_id: Uuid,
    /// Absolute path of the package directory.
    pub root: PathBuf,
    /// Piece size in bytes.
    pub piece_size: u32,
    /// Tracker announce URL embedded in the descriptor.
    pub announce_url: String,
    /// Generator identification embedded in the descriptor.
    pub created_by: String,
}

/// Persistence seam for per-piece checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Longest contiguous checkpoint prefix for `(package, node)`, starting
    /// at piece zero, in index order.
    async fn load_prefix(&self, package_id: Uuid, node_id: Uuid)
    -> anyhow::Result<Vec<[u8; 20]>>;

    /// Record the hash of one completed piece.
    async fn record(
        &self,
        package_id: Uuid,
        node_id: Uuid,
        piece_index: u32,
        piece_hash: [u8; 20],
    ) -> anyhow::Result<()>;

    /// Delete every checkpoint for `(package, node)`.
    async fn clear(&self, package_id: Uuid, node_id: Uuid) -> anyhow::Result<()>;
}

/// Progress observation seam, consulted once per committed piece.
#[async_trait]
pub trait GenerationProgress: Send + Sync {
    /// Observe one committed piece.
    async fn on_piece(&self, update: ProgressUpdate);
}

/// Snapshot handed to the progress sink after each committed piece.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Package being hashed.
    pub package_id: Uuid,
    /// Index of the committed piece.
    pub piece_index: u32,
    /// Total pieces expected.
    pub pieces_count: u32,
    /// Completion percentage (0-100).
    pub percent: f64,
    /// Relative path of the file the piece was read from.
    pub current_file: String,
    /// Observed hashing throughput in bytes per second.
    pub speed_bps: u64,
}

/// No-op progress sink for callers that do not track progress.
pub struct NullProgress;

#[async_trait]
impl GenerationProgress for NullProgress {
    async fn on_piece(&self, _update: ProgressUpdate) {}
}

/// Result of a completed generation run.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    /// Descriptor ready for the catalog and the engine.
    pub descriptor: TorrentDescriptor,
    /// Number of pieces reused from checkpoints instead of rehashed.
    pub resumed_pieces: u32,
}

/// Multi-worker, checkpointed torrent generator.
pub struct TorrentGenerator {
    workers: usize,
}

struct PieceJob {
    index: u32,
    data: Vec<u8>,
    current_file: String,
}

struct PieceResult {
    index: u32,
    hash: [u8; 20],
    len: usize,
    current_file: String,
}

impl TorrentGenerator {
    /// Construct a generator with `workers` concurrent hash workers.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Run one generation to completion.
    ///
    /// # Errors
    ///
    /// Returns an error on IO failure (the checkpoint prefix written so far
    /// is preserved), on checkpoint-store failure, or when `cancel` fires.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        checkpoints: Arc<dyn CheckpointStore>,
        progress: Arc<dyn GenerationProgress>,
        cancel: CancellationToken,
    ) -> MetainfoResult<GenerationOutcome> {
        if request.piece_size == 0 {
            return Err(MetainfoError::InvalidPieceSize { value: 0 });
        }

        let files = enumerate_files(&request.root).await?;
        if files.is_empty() {
            return Err(MetainfoError::EmptyPackage {
                root: request.root.clone(),
            });
        }

        let total_bytes: u64 = files.iter().map(|file| file.length).sum();
        let piece_size = u64::from(request.piece_size);
        let pieces_count = u32::try_from(total_bytes.div_ceil(piece_size)).unwrap_or(u32::MAX);

        let mut prefix = checkpoints
            .load_prefix(request.package_id, request.node_id)
            .await
            .map_err(|err| MetainfoError::Checkpoint {
                operation: "checkpoints.load_prefix",
                detail: err.to_string(),
            })?;
        if prefix.len() > pieces_count as usize {
            warn!(
                package_id = %request.package_id,
                checkpoints = prefix.len(),
                pieces_count,
                "checkpoint prefix longer than piece count; discarding and rehashing"
            );
            checkpoints
                .clear(request.package_id, request.node_id)
                .await
                .map_err(|err| MetainfoError::Checkpoint {
                    operation: "checkpoints.clear",
                    detail: err.to_string(),
                })?;
            prefix.clear();
        }
        let resumed_pieces = u32::try_from(prefix.len()).unwrap_or(0);

        if resumed_pieces > 0 {
            info!(
                package_id = %request.package_id,
                resumed_pieces,
                pieces_count,
                "resuming generation from checkpoint prefix"
            );
        }

        let mut pieces = Vec::with_capacity(pieces_count as usize * 20);
        for hash in &prefix {
            pieces.extend_from_slice(hash);
        }

        if resumed_pieces < pieces_count {
            self.hash_remaining(
                request,
                &files,
                resumed_pieces,
                pieces_count,
                &mut pieces,
                Arc::clone(&checkpoints),
                progress,
                cancel,
            )
            .await?;
        }

        let name = package_name(&request.root)?;
        let info = Info {
            files,
            name: name.clone(),
            piece_length: request.piece_size,
            pieces: ByteBuf::from(pieces),
        };
        let info_hash = info.info_hash()?;
        let file_count = u32::try_from(info.files.len()).unwrap_or(u32::MAX);

        let meta = Metainfo {
            announce: request.announce_url.clone(),
            created_by: request.created_by.clone(),
            creation_date: Utc::now().timestamp(),
            info,
        };
        let meta_bytes = meta.to_bytes()?;

        checkpoints
            .clear(request.package_id, request.node_id)
            .await
            .map_err(|err| MetainfoError::Checkpoint {
                operation: "checkpoints.clear",
                detail: err.to_string(),
            })?;

        debug!(
            package_id = %request.package_id,
            info_hash = %info_hash,
            pieces_count,
            "generation complete"
        );

        Ok(GenerationOutcome {
            descriptor: TorrentDescriptor {
                info_hash,
                name,
                piece_size: request.piece_size,
                pieces_count,
                file_count,
                total_bytes,
                meta_bytes,
            },
            resumed_pieces,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn hash_remaining(
        &self,
        request: &GenerationRequest,
        files: &[FileEntry],
        first_index: u32,
        pieces_count: u32,
        pieces: &mut Vec<u8>,
        checkpoints: Arc<dyn CheckpointStore>,
        progress: Arc<dyn GenerationProgress>,
        cancel: CancellationToken,
    ) -> MetainfoResult<()> {
        let (job_tx, job_rx) = mpsc::channel::<PieceJob>(self.workers * 2);
        let (result_tx, mut result_rx) = mpsc::channel::<PieceResult>(self.workers * 2);

        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        let mut worker_handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            worker_handles.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = job_rx.lock().await;
                        guard.recv().await
                    };
                    let Some(job) = job else { break };
                    let digest: [u8; 20] = Sha1::digest(&job.data).into();
                    let result = PieceResult {
                        index: job.index,
                        hash: digest,
                        len: job.data.len(),
                        current_file: job.current_file,
                    };
                    if result_tx.send(result).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        let reader = {
            let root = request.root.clone();
            let files = files.to_vec();
            let piece_size = request.piece_size;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                read_pieces(&root, &files, piece_size, first_index, &job_tx, &cancel).await
            })
        };

        // Sequencer: commit results in strict index order so checkpoints stay
        // a contiguous prefix.
        let started = Instant::now();
        let mut reorder: BTreeMap<u32, PieceResult> = BTreeMap::new();
        let mut next_commit = first_index;
        let mut bytes_hashed: u64 = 0;
        let mut commit_error: Option<MetainfoError> = None;

        while let Some(result) = result_rx.recv().await {
            reorder.insert(result.index, result);
            while let Some(result) = reorder.remove(&next_commit) {
                if cancel.is_cancelled() {
                    commit_error = Some(MetainfoError::Cancelled {
                        piece_index: next_commit,
                    });
                    break;
                }
                if let Err(err) = checkpoints
                    .record(request.package_id, request.node_id, result.index, result.hash)
                    .await
                {
                    commit_error = Some(MetainfoError::Checkpoint {
                        operation: "checkpoints.record",
                        detail: err.to_string(),
                    });
                    break;
                }
                pieces.extend_from_slice(&result.hash);
                bytes_hashed += result.len as u64;
                let elapsed = started.elapsed().as_secs_f64();
                let speed_bps = if elapsed > 0.0 {
                    (bytes_hashed as f64 / elapsed) as u64
                } else {
                    0
                };
                let percent = f64::from(next_commit + 1) / f64::from(pieces_count) * 100.0;
                progress
                    .on_piece(ProgressUpdate {
                        package_id: request.package_id,
                        piece_index: next_commit,
                        pieces_count,
                        percent,
                        current_file: result.current_file.clone(),
                        speed_bps,
                    })
                    .await;
                next_commit += 1;
            }
            if commit_error.is_some() {
                break;
            }
        }

        // Stop the pipeline before inspecting outcomes.
        drop(result_rx);
        let read_outcome = reader
            .await
            .unwrap_or_else(|join| Err(join_to_io(&request.root, join)));
        for handle in worker_handles {
            let _ = handle.await;
        }

        if let Some(err) = commit_error {
            return Err(err);
        }
        read_outcome?;
        if next_commit < pieces_count {
            // The reader ended early without reporting an error; treat as IO.
            return Err(MetainfoError::Io {
                operation: "generator.read_pieces",
                path: request.root.clone(),
                piece_index: Some(next_commit),
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "payload ended before the expected piece count",
                ),
            });
        }
        Ok(())
    }
}

fn join_to_io(root: &Path, join: tokio::task::JoinError) -> MetainfoError {
    MetainfoError::Io {
        operation: "generator.reader_task",
        path: root.to_path_buf(),
        piece_index: None,
        source: std::io::Error::other(join.to_string()),
    }
}

async fn read_pieces(
    root: &Path,
    files: &[FileEntry],
    piece_size: u32,
    first_index: u32,
    jobs: &mpsc::Sender<PieceJob>,
    cancel: &CancellationToken,
) -> MetainfoResult<()> {
    let piece_size = piece_size as usize;
    let resume_offset = u64::from(first_index) * piece_size as u64;

    let mut index = first_index;
    let mut offset: u64 = 0;
    let mut piece_buf: Vec<u8> = Vec::with_capacity(piece_size);

    for entry in files {
        let file_len = entry.length;
        let file_start = offset;
        let file_end = offset + file_len;
        offset = file_end;
        if file_end <= resume_offset {
            continue;
        }

        let rel_path = entry.relative_path();
        let abs_path = root.join(&rel_path);
        let mut file = tokio::fs::File::open(&abs_path)
            .await
            .map_err(|source| MetainfoError::Io {
                operation: "generator.open",
                path: abs_path.clone(),
                piece_index: Some(index),
                source,
            })?;

        if file_start < resume_offset {
            let skip = resume_offset - file_start;
            file.seek(std::io::SeekFrom::Start(skip))
                .await
                .map_err(|source| MetainfoError::Io {
                    operation: "generator.seek",
                    path: abs_path.clone(),
                    piece_index: Some(index),
                    source,
                })?;
        }

        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if cancel.is_cancelled() {
                return Err(MetainfoError::Cancelled { piece_index: index });
            }
            let read = file
                .read(&mut chunk)
                .await
                .map_err(|source| MetainfoError::Io {
                    operation: "generator.read",
                    path: abs_path.clone(),
                    piece_index: Some(index),
                    source,
                })?;
            if read == 0 {
                break;
            }
            let mut consumed = 0;
            while consumed < read {
                let take = (piece_size - piece_buf.len()).min(read - consumed);
                piece_buf.extend_from_slice(&chunk[consumed..consumed + take]);
                consumed += take;
                if piece_buf.len() == piece_size {
                    let job = PieceJob {
                        index,
                        data: std::mem::replace(&mut piece_buf, Vec::with_capacity(piece_size)),
                        current_file: rel_path.clone(),
                    };
                    if jobs.send(job).await.is_err() {
                        return Ok(());
                    }
                    index += 1;
                }
            }
        }
    }

    if !piece_buf.is_empty() {
        let current_file = files
            .last()
            .map(FileEntry::relative_path)
            .unwrap_or_default();
        let job = PieceJob {
            index,
            data: piece_buf,
            current_file,
        };
        let _ = jobs.send(job).await;
    }
    Ok(())
}

/// Enumerate payload files under `root` in stable lexical order by relative
/// path.
async fn enumerate_files(root: &Path) -> MetainfoResult<Vec<FileEntry>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || enumerate_files_blocking(&root))
        .await
        .map_err(|join| MetainfoError::Io {
            operation: "generator.enumerate",
            path: PathBuf::new(),
            piece_index: None,
            source: std::io::Error::other(join.to_string()),
        })?
}

fn enumerate_files_blocking(root: &Path) -> MetainfoResult<Vec<FileEntry>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|source| MetainfoError::Io {
            operation: "generator.read_dir",
            path: dir.clone(),
            piece_index: None,
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| MetainfoError::Io {
                operation: "generator.read_dir_entry",
                path: dir.clone(),
                piece_index: None,
                source,
            })?;
            let path = entry.path();
            let metadata = entry.metadata().map_err(|source| MetainfoError::Io {
                operation: "generator.metadata",
                path: path.clone(),
                piece_index: None,
                source,
            })?;
            if metadata.is_dir() {
                stack.push(path);
            } else if metadata.is_file() {
                let rel = path
                    .strip_prefix(root)
                    .map_err(|_err| MetainfoError::PathNotUtf8 { path: path.clone() })?;
                let components: Vec<String> = rel
                    .components()
                    .map(|component| {
                        component
                            .as_os_str()
                            .to_str()
                            .map(str::to_string)
                            .ok_or_else(|| MetainfoError::PathNotUtf8 { path: path.clone() })
                    })
                    .collect::<MetainfoResult<_>>()?;
                out.push(FileEntry {
                    length: metadata.len(),
                    path: components,
                });
            }
        }
    }
    out.sort_by(|a, b| a.relative_path().cmp(&b.relative_path()));
    Ok(out)
}

fn package_name(root: &Path) -> MetainfoResult<String> {
    root.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| MetainfoError::PathNotUtf8 {
            path: root.to_path_buf(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory checkpoint store mirroring the catalog semantics.
    #[derive(Default)]
    struct MemoryCheckpoints {
        rows: Mutex<HashMap<(Uuid, Uuid), BTreeMap<u32, [u8; 20]>>>,
    }

    #[async_trait]
    impl CheckpointStore for MemoryCheckpoints {
        async fn load_prefix(
            &self,
            package_id: Uuid,
            node_id: Uuid,
        ) -> anyhow::Result<Vec<[u8; 20]>> {
            let rows = self.rows.lock().unwrap();
            let Some(map) = rows.get(&(package_id, node_id)) else {
                return Ok(Vec::new());
            };
            let mut prefix = Vec::new();
            for (expected, (index, hash)) in map.iter().enumerate() {
                if *index as usize != expected {
                    break;
                }
                prefix.push(*hash);
            }
            Ok(prefix)
        }

        async fn record(
            &self,
            package_id: Uuid,
            node_id: Uuid,
            piece_index: u32,
            piece_hash: [u8; 20],
        ) -> anyhow::Result<()> {
            let mut rows = self.rows.lock().unwrap();
            rows.entry((package_id, node_id))
                .or_default()
                .insert(piece_index, piece_hash);
            Ok(())
        }

        async fn clear(&self, package_id: Uuid, node_id: Uuid) -> anyhow::Result<()> {
            let mut rows = self.rows.lock().unwrap();
            rows.remove(&(package_id, node_id));
            Ok(())
        }
    }

    fn write_package(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("ASSETMAP"), vec![b'A'; 50]).unwrap();
        std::fs::write(dir.join("VIDEO.mxf"), vec![0u8; 2 * 1024 * 1024]).unwrap();
    }

    fn request(root: &Path) -> GenerationRequest {
        GenerationRequest {
            package_id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            root: root.to_path_buf(),
            piece_size: 256 * 1024,
            announce_url: "http://hub:6969/announce".to_string(),
            created_by: "omnicloud 0.1.0".to_string(),
        }
    }

    #[tokio::test]
    async fn single_site_generation_matches_expected_geometry() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("PkgA");
        write_package(&root);

        let generator = TorrentGenerator::new(4);
        let outcome = generator
            .generate(
                &request(&root),
                Arc::new(MemoryCheckpoints::default()),
                Arc::new(NullProgress),
                CancellationToken::new(),
            )
            .await
            .expect("generation");

        let descriptor = &outcome.descriptor;
        assert_eq!(descriptor.pieces_count, 9);
        assert_eq!(descriptor.file_count, 2);
        assert_eq!(descriptor.total_bytes, 50 + 2 * 1024 * 1024);
        assert_eq!(descriptor.name, "PkgA");
        assert_eq!(outcome.resumed_pieces, 0);

        let parsed = Metainfo::from_bytes(&descriptor.meta_bytes).expect("parse");
        assert_eq!(parsed.info.info_hash().unwrap(), descriptor.info_hash);
        // ASSETMAP sorts before VIDEO.mxf.
        assert_eq!(parsed.info.files[0].relative_path(), "ASSETMAP");
        assert_eq!(parsed.info.files[1].relative_path(), "VIDEO.mxf");
    }

    #[tokio::test]
    async fn concurrency_does_not_change_the_info_hash() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("PkgA");
        write_package(&root);

        let serial = TorrentGenerator::new(1)
            .generate(
                &request(&root),
                Arc::new(MemoryCheckpoints::default()),
                Arc::new(NullProgress),
                CancellationToken::new(),
            )
            .await
            .expect("serial generation");
        let parallel = TorrentGenerator::new(8)
            .generate(
                &request(&root),
                Arc::new(MemoryCheckpoints::default()),
                Arc::new(NullProgress),
                CancellationToken::new(),
            )
            .await
            .expect("parallel generation");

        assert_eq!(
            serial.descriptor.info_hash,
            parallel.descriptor.info_hash,
            "info-hash must be independent of worker count"
        );
    }

    #[tokio::test]
    async fn resumed_run_reuses_checkpoints_and_matches() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("PkgA");
        write_package(&root);

        let req = request(&root);
        let generator = TorrentGenerator::new(2);

        // Full run to learn the expected hash and per-piece checkpoints.
        let full_store = Arc::new(MemoryCheckpoints::default());
        let collected = Arc::new(Mutex::new(Vec::new()));

        struct Collector(Arc<Mutex<Vec<ProgressUpdate>>>);
        #[async_trait]
        impl GenerationProgress for Collector {
            async fn on_piece(&self, update: ProgressUpdate) {
                self.0.lock().unwrap().push(update);
            }
        }

        let expected = generator
            .generate(
                &req,
                Arc::clone(&full_store) as Arc<dyn CheckpointStore>,
                Arc::new(Collector(Arc::clone(&collected))),
                CancellationToken::new(),
            )
            .await
            .expect("full generation");

        let updates = collected.lock().unwrap().clone();
        assert_eq!(updates.len(), 9, "one progress update per piece");
        assert!(updates.iter().map(|u| u.piece_index).eq(0..9));

        // Simulate a kill after five checkpointed pieces by replaying the
        // full run with only the first five pieces pre-seeded.
        let resumed_store = MemoryCheckpoints::default();
        let full_pieces = Metainfo::from_bytes(&expected.descriptor.meta_bytes)
            .unwrap()
            .info;
        for index in 0..5u32 {
            resumed_store
                .record(req.package_id, req.node_id, index, full_pieces.piece_hash(index).unwrap())
                .await
                .unwrap();
        }

        let resumed = generator
            .generate(
                &req,
                Arc::new(resumed_store),
                Arc::new(NullProgress),
                CancellationToken::new(),
            )
            .await
            .expect("resumed generation");

        assert_eq!(resumed.resumed_pieces, 5);
        assert_eq!(resumed.descriptor.info_hash, expected.descriptor.info_hash);
    }

    #[tokio::test]
    async fn empty_package_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("Empty");
        std::fs::create_dir_all(&root).unwrap();

        let err = TorrentGenerator::new(2)
            .generate(
                &request(&root),
                Arc::new(MemoryCheckpoints::default()),
                Arc::new(NullProgress),
                CancellationToken::new(),
            )
            .await
            .expect_err("must fail");
        assert!(matches!(err, MetainfoError::EmptyPackage { .. }));
    }

    #[tokio::test]
    async fn reader_surfaces_open_failures_with_piece_index() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("PkgA");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("ASSETMAP"), vec![b'A'; 50]).unwrap();

        // A file that was enumerated but vanished before the reader reached it.
        let files = vec![
            FileEntry {
                length: 50,
                path: vec!["ASSETMAP".to_string()],
            },
            FileEntry {
                length: 1024,
                path: vec!["VIDEO.mxf".to_string()],
            },
        ];

        let (jobs, mut job_rx) = mpsc::channel(8);
        let drain = tokio::spawn(async move { while job_rx.recv().await.is_some() {} });

        let err = read_pieces(
            &root,
            &files,
            256 * 1024,
            0,
            &jobs,
            &CancellationToken::new(),
        )
        .await
        .expect_err("must fail on the missing file");
        drop(jobs);
        drain.await.unwrap();

        match err {
            MetainfoError::Io {
                operation,
                piece_index,
                ..
            } => {
                assert_eq!(operation, "generator.open");
                assert_eq!(piece_index, Some(0));
            }
            other => panic!("expected io failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_stops_the_run() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("PkgA");
        write_package(&root);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = TorrentGenerator::new(2)
            .generate(
                &request(&root),
                Arc::new(MemoryCheckpoints::default()),
                Arc::new(NullProgress),
                cancel,
            )
            .await
            .expect_err("must cancel");
        assert!(matches!(err, MetainfoError::Cancelled { .. }));
    }
}
