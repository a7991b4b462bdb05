//! Storage bindings and the piece-to-file map.
//!
//! A binding's root is the package directory itself: relative paths from the
//! info dictionary resolve directly beneath it, so a library directory whose
//! basename differs from the torrent name (a dedup co-seeder) still maps
//! correctly. Split bindings send an explicit include-list of files to a
//! shadow root; every other file resolves under the media root.

use std::io::SeekFrom;
use std::path::PathBuf;

use omnicloud_metainfo::Info;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{EngineError, EngineResult};

/// Include-list deciding which files a split binding reads from the shadow
/// root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShadowRules {
    /// Case-insensitive file extensions (without the dot), e.g. `xml`.
    pub extensions: Vec<String>,
    /// Case-sensitive file-name prefixes, e.g. `ASSETMAP`.
    pub name_prefixes: Vec<String>,
}

impl ShadowRules {
    /// Default rules for DCP metadata files.
    #[must_use]
    pub fn dcp_metadata() -> Self {
        Self {
            extensions: vec!["xml".to_string()],
            name_prefixes: vec!["ASSETMAP".to_string(), "VOLINDEX".to_string()],
        }
    }

    /// Whether `rel_path` belongs to the shadow root.
    #[must_use]
    pub fn matches(&self, rel_path: &str) -> bool {
        let file_name = rel_path.rsplit('/').next().unwrap_or(rel_path);
        if self
            .name_prefixes
            .iter()
            .any(|prefix| file_name.starts_with(prefix.as_str()))
        {
            return true;
        }
        file_name
            .rsplit_once('.')
            .is_some_and(|(_, ext)| self.extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
    }
}

/// Where a torrent's payload bytes live on disk.
#[derive(Debug, Clone)]
pub enum StorageBinding {
    /// Every file lives under one package directory.
    Single {
        /// The package directory.
        root: PathBuf,
    },
    /// Metadata files come from a shadow directory, media from the library.
    Split {
        /// Library package directory owned by the ingest system.
        media_root: PathBuf,
        /// Hub-canonical shadow directory owned by the dedup resolver.
        shadow_root: PathBuf,
        /// Include-list routing files to the shadow root.
        rules: ShadowRules,
    },
}

impl StorageBinding {
    /// Resolve a torrent-relative path to an absolute path.
    #[must_use]
    pub fn resolve(&self, rel_path: &str) -> PathBuf {
        match self {
            Self::Single { root } => root.join(rel_path),
            Self::Split {
                media_root,
                shadow_root,
                rules,
            } => {
                if rules.matches(rel_path) {
                    shadow_root.join(rel_path)
                } else {
                    media_root.join(rel_path)
                }
            }
        }
    }
}

struct MappedFile {
    abs_path: PathBuf,
    length: u64,
    global_offset: u64,
}

/// Byte-stream view over a torrent's file table.
pub(crate) struct FileMap {
    files: Vec<MappedFile>,
    total_bytes: u64,
    piece_size: u32,
    pieces_count: u32,
}

impl FileMap {
    pub(crate) fn new(info: &Info, binding: &StorageBinding) -> Self {
        let mut files = Vec::with_capacity(info.files.len());
        let mut offset = 0u64;
        for entry in &info.files {
            let rel = entry.relative_path();
            files.push(MappedFile {
                abs_path: binding.resolve(&rel),
                length: entry.length,
                global_offset: offset,
            });
            offset += entry.length;
        }
        Self {
            files,
            total_bytes: offset,
            piece_size: info.piece_length,
            pieces_count: info.pieces_count(),
        }
    }

    pub(crate) const fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub(crate) const fn pieces_count(&self) -> u32 {
        self.pieces_count
    }

    pub(crate) fn piece_len(&self, index: u32) -> u32 {
        let start = u64::from(index) * u64::from(self.piece_size);
        let remaining = self.total_bytes.saturating_sub(start);
        u32::try_from(remaining.min(u64::from(self.piece_size))).unwrap_or(self.piece_size)
    }

    pub(crate) fn piece_offset(&self, index: u32) -> u64 {
        u64::from(index) * u64::from(self.piece_size)
    }

    /// Read `len` bytes at stream `offset`, spanning file boundaries.
    ///
    /// Returns `Ok(None)` when any touched file is absent or too short; the
    /// caller decides whether that is an incomplete download or an integrity
    /// failure.
    pub(crate) async fn read_block(&self, offset: u64, len: u32) -> EngineResult<Option<Vec<u8>>> {
        let mut out = Vec::with_capacity(len as usize);
        let mut cursor = offset;
        let mut remaining = u64::from(len);

        while remaining > 0 {
            let Some(file) = self.file_at(cursor) else {
                return Ok(None);
            };
            let within = cursor - file.global_offset;
            let take = remaining.min(file.length - within);

            let mut handle = match tokio::fs::File::open(&file.abs_path).await {
                Ok(handle) => handle,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(source) => {
                    return Err(EngineError::Io {
                        operation: "storage.open",
                        path: file.abs_path.clone(),
                        source,
                    });
                }
            };
            handle
                .seek(SeekFrom::Start(within))
                .await
                .map_err(|source| EngineError::Io {
                    operation: "storage.seek",
                    path: file.abs_path.clone(),
                    source,
                })?;
            let mut chunk = vec![0u8; usize::try_from(take).unwrap_or(usize::MAX)];
            let mut filled = 0usize;
            while filled < chunk.len() {
                let read = handle
                    .read(&mut chunk[filled..])
                    .await
                    .map_err(|source| EngineError::Io {
                        operation: "storage.read",
                        path: file.abs_path.clone(),
                        source,
                    })?;
                if read == 0 {
                    // Shorter on disk than the metainfo claims.
                    return Ok(None);
                }
                filled += read;
            }
            out.extend_from_slice(&chunk);
            cursor += take;
            remaining -= take;
        }
        Ok(Some(out))
    }

    /// Write `data` at stream `offset`, creating files and directories as
    /// needed.
    pub(crate) async fn write_block(&self, offset: u64, data: &[u8]) -> EngineResult<()> {
        let mut cursor = offset;
        let mut written = 0usize;

        while written < data.len() {
            let file = self
                .file_at(cursor)
                .ok_or_else(|| EngineError::Storage {
                    detail: format!("write beyond payload at offset {cursor}"),
                })?;
            let within = cursor - file.global_offset;
            let take = ((data.len() - written) as u64).min(file.length - within) as usize;

            if let Some(parent) = file.abs_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| EngineError::Io {
                        operation: "storage.mkdir",
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
            let mut handle = tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&file.abs_path)
                .await
                .map_err(|source| EngineError::Io {
                    operation: "storage.create",
                    path: file.abs_path.clone(),
                    source,
                })?;
            handle
                .seek(SeekFrom::Start(within))
                .await
                .map_err(|source| EngineError::Io {
                    operation: "storage.seek",
                    path: file.abs_path.clone(),
                    source,
                })?;
            handle
                .write_all(&data[written..written + take])
                .await
                .map_err(|source| EngineError::Io {
                    operation: "storage.write",
                    path: file.abs_path.clone(),
                    source,
                })?;
            handle.flush().await.map_err(|source| EngineError::Io {
                operation: "storage.flush",
                path: file.abs_path.clone(),
                source,
            })?;

            cursor += take as u64;
            written += take;
        }
        Ok(())
    }

    /// Verify that every payload file exists and is at least its expected
    /// size. Used by the integrity watcher.
    pub(crate) async fn check_files(&self) -> Result<(), FileCheckFailure> {
        for file in &self.files {
            match tokio::fs::metadata(&file.abs_path).await {
                Ok(metadata) if metadata.len() >= file.length => {}
                Ok(metadata) => {
                    return Err(FileCheckFailure {
                        path: file.abs_path.clone(),
                        expected: file.length,
                        actual: Some(metadata.len()),
                    });
                }
                Err(_) => {
                    return Err(FileCheckFailure {
                        path: file.abs_path.clone(),
                        expected: file.length,
                        actual: None,
                    });
                }
            }
        }
        Ok(())
    }

    fn file_at(&self, offset: u64) -> Option<&MappedFile> {
        if offset >= self.total_bytes {
            return None;
        }
        let index = self
            .files
            .partition_point(|file| file.global_offset + file.length <= offset);
        self.files.get(index)
    }
}

/// A payload file missing or smaller than the metainfo requires.
pub(crate) struct FileCheckFailure {
    pub(crate) path: PathBuf,
    pub(crate) expected: u64,
    pub(crate) actual: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnicloud_metainfo::FileEntry;
    use serde_bytes::ByteBuf;

    fn sample_info() -> Info {
        Info {
            files: vec![
                FileEntry {
                    length: 50,
                    path: vec!["ASSETMAP".to_string()],
                },
                FileEntry {
                    length: 100,
                    path: vec!["VIDEO.mxf".to_string()],
                },
            ],
            name: "PkgA".to_string(),
            piece_length: 64,
            pieces: ByteBuf::from(vec![0u8; 3 * 20]),
        }
    }

    #[test]
    fn shadow_rules_route_metadata() {
        let rules = ShadowRules::dcp_metadata();
        assert!(rules.matches("ASSETMAP"));
        assert!(rules.matches("CPL_abc.xml"));
        assert!(rules.matches("sub/PKL.XML"));
        assert!(!rules.matches("VIDEO.mxf"));
        assert!(!rules.matches("AUDIO.mxf"));
    }

    #[test]
    fn split_binding_resolves_by_rules() {
        let binding = StorageBinding::Split {
            media_root: PathBuf::from("/lib/PkgA-v2"),
            shadow_root: PathBuf::from("/tor/canonical-xml/p1"),
            rules: ShadowRules::dcp_metadata(),
        };
        assert_eq!(
            binding.resolve("ASSETMAP"),
            PathBuf::from("/tor/canonical-xml/p1/ASSETMAP")
        );
        assert_eq!(
            binding.resolve("VIDEO.mxf"),
            PathBuf::from("/lib/PkgA-v2/VIDEO.mxf")
        );
    }

    #[tokio::test]
    async fn read_block_spans_file_boundaries() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("PkgA");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("ASSETMAP"), vec![1u8; 50]).unwrap();
        std::fs::write(root.join("VIDEO.mxf"), vec![2u8; 100]).unwrap();

        let map = FileMap::new(&sample_info(), &StorageBinding::Single { root });
        let block = map
            .read_block(40, 20)
            .await
            .expect("read")
            .expect("available");
        assert_eq!(&block[..10], &[1u8; 10]);
        assert_eq!(&block[10..], &[2u8; 10]);
    }

    #[tokio::test]
    async fn read_block_reports_missing_bytes_as_none() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("PkgA");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("ASSETMAP"), vec![1u8; 50]).unwrap();
        // VIDEO.mxf missing entirely.

        let map = FileMap::new(&sample_info(), &StorageBinding::Single { root });
        assert!(map.read_block(40, 20).await.expect("read").is_none());
        // Reads past the payload are also unavailable.
        assert!(map.read_block(149, 2).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("downloads").join("PkgA");

        let map = FileMap::new(&sample_info(), &StorageBinding::Single { root });
        let payload: Vec<u8> = (0..150u8).collect();
        map.write_block(0, &payload).await.expect("write");

        let block = map
            .read_block(0, 150)
            .await
            .expect("read")
            .expect("available");
        assert_eq!(block, payload);
    }

    #[tokio::test]
    async fn check_files_flags_truncation() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("PkgA");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("ASSETMAP"), vec![1u8; 50]).unwrap();
        std::fs::write(root.join("VIDEO.mxf"), vec![2u8; 10]).unwrap();

        let map = FileMap::new(&sample_info(), &StorageBinding::Single { root });
        let failure = map.check_files().await.expect_err("must flag short file");
        assert_eq!(failure.expected, 100);
        assert_eq!(failure.actual, Some(10));
        assert!(failure.path.ends_with("VIDEO.mxf"));
    }

    #[test]
    fn piece_geometry() {
        let temp_root = PathBuf::from("/nonexistent");
        let map = FileMap::new(&sample_info(), &StorageBinding::Single { root: temp_root });
        assert_eq!(map.total_bytes(), 150);
        assert_eq!(map.pieces_count(), 3);
        assert_eq!(map.piece_len(0), 64);
        assert_eq!(map.piece_len(2), 22);
        assert_eq!(map.piece_offset(2), 128);
    }
}
