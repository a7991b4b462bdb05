//! Bencoded torrent descriptor model.
//!
//! Struct fields are declared in lexicographic order of their serialized
//! names because bencode dictionaries are canonical only when keys are
//! sorted; `serde_bencode` emits struct fields in declaration order.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::error::{MetainfoError, MetainfoResult};
use crate::info_hash::InfoHash;

/// One file inside the torrent payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// File size in bytes.
    pub length: u64,
    /// Path components relative to the torrent name directory.
    pub path: Vec<String>,
}

impl FileEntry {
    /// Relative path with `/` separators.
    #[must_use]
    pub fn relative_path(&self) -> String {
        self.path.join("/")
    }
}

/// The info dictionary. Its bencoded bytes define the info-hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    /// Payload files in stable lexical order by relative path.
    pub files: Vec<FileEntry>,
    /// Base name of the package directory.
    pub name: String,
    /// Piece size in bytes.
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    /// Concatenated 20-byte SHA-1 piece hashes.
    pub pieces: ByteBuf,
}

impl Info {
    /// Compute the SHA-1 info-hash over the canonical bencoding.
    ///
    /// # Errors
    ///
    /// Returns an error if bencoding fails.
    pub fn info_hash(&self) -> MetainfoResult<InfoHash> {
        let encoded = serde_bencode::to_bytes(self).map_err(|source| MetainfoError::Bencode {
            operation: "info.encode",
            source,
        })?;
        let digest = Sha1::digest(&encoded);
        Ok(InfoHash(digest.into()))
    }

    /// Total payload size in bytes across every file.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|file| file.length).sum()
    }

    /// Number of pieces encoded in the `pieces` string.
    #[must_use]
    pub fn pieces_count(&self) -> u32 {
        u32::try_from(self.pieces.len() / 20).unwrap_or(u32::MAX)
    }

    /// SHA-1 hash of piece `index`, when in range.
    #[must_use]
    pub fn piece_hash(&self, index: u32) -> Option<[u8; 20]> {
        let start = index as usize * 20;
        let end = start + 20;
        if end > self.pieces.len() {
            return None;
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&self.pieces[start..end]);
        Some(hash)
    }

    /// Length of piece `index`, accounting for the short last piece.
    #[must_use]
    pub fn piece_len(&self, index: u32) -> u32 {
        let total = self.total_bytes();
        let start = u64::from(index) * u64::from(self.piece_length);
        let remaining = total.saturating_sub(start);
        u32::try_from(remaining.min(u64::from(self.piece_length))).unwrap_or(self.piece_length)
    }
}

/// A complete torrent descriptor as stored on disk and served over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metainfo {
    /// Tracker announce URL.
    pub announce: String,
    /// Generator identification string.
    #[serde(rename = "created by")]
    pub created_by: String,
    /// Unix timestamp of generation.
    #[serde(rename = "creation date")]
    pub creation_date: i64,
    /// The info dictionary.
    pub info: Info,
}

impl Metainfo {
    /// Serialize the descriptor to its bencoded wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if bencoding fails.
    pub fn to_bytes(&self) -> MetainfoResult<Vec<u8>> {
        serde_bencode::to_bytes(self).map_err(|source| MetainfoError::Bencode {
            operation: "metainfo.encode",
            source,
        })
    }

    /// Parse a descriptor from bencoded bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid descriptor.
    pub fn from_bytes(bytes: &[u8]) -> MetainfoResult<Self> {
        serde_bencode::from_bytes(bytes).map_err(|source| MetainfoError::Bencode {
            operation: "metainfo.decode",
            source,
        })
    }
}

/// Summary of a generated torrent, ready for the catalog and the engine.
#[derive(Debug, Clone)]
pub struct TorrentDescriptor {
    /// Info-hash of the generated torrent.
    pub info_hash: InfoHash,
    /// Display name (package directory basename).
    pub name: String,
    /// Piece size used for hashing.
    pub piece_size: u32,
    /// Number of pieces produced.
    pub pieces_count: u32,
    /// Number of payload files.
    pub file_count: u32,
    /// Total payload bytes.
    pub total_bytes: u64,
    /// Full bencoded `.torrent` bytes.
    pub meta_bytes: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> Info {
        Info {
            files: vec![
                FileEntry {
                    length: 50,
                    path: vec!["ASSETMAP".to_string()],
                },
                FileEntry {
                    length: 2 * 1024 * 1024,
                    path: vec!["VIDEO.mxf".to_string()],
                },
            ],
            name: "PkgA".to_string(),
            piece_length: 256 * 1024,
            pieces: ByteBuf::from(vec![0u8; 9 * 20]),
        }
    }

    #[test]
    fn round_trip_preserves_info_hash() {
        let meta = Metainfo {
            announce: "http://hub:6969/announce".to_string(),
            created_by: "omnicloud 0.1.0".to_string(),
            creation_date: 1_722_470_400,
            info: sample_info(),
        };
        let expected = meta.info.info_hash().expect("hash");

        let bytes = meta.to_bytes().expect("encode");
        let parsed = Metainfo::from_bytes(&bytes).expect("decode");
        let actual = parsed.info.info_hash().expect("hash");

        assert_eq!(actual, expected);
        assert_eq!(parsed, meta);
    }

    #[test]
    fn info_dict_keys_are_canonical() {
        let bytes = serde_bencode::to_bytes(&sample_info()).expect("encode");
        let files = bytes
            .windows(7)
            .position(|window| window == b"5:files")
            .expect("files key");
        let name = bytes
            .windows(6)
            .position(|window| window == b"4:name")
            .expect("name key");
        let piece_length = bytes
            .windows(15)
            .position(|window| window == b"12:piece length")
            .expect("piece length key");
        let pieces = bytes
            .windows(8)
            .position(|window| window == b"6:pieces")
            .expect("pieces key");
        assert!(files < name && name < piece_length && piece_length < pieces);
    }

    #[test]
    fn piece_geometry_matches_payload() {
        let info = sample_info();
        assert_eq!(info.total_bytes(), 50 + 2 * 1024 * 1024);
        assert_eq!(info.pieces_count(), 9);
        assert_eq!(info.piece_len(0), 256 * 1024);
        // Last piece carries the 50-byte remainder.
        assert_eq!(info.piece_len(8), 50);
        assert!(info.piece_hash(8).is_some());
        assert!(info.piece_hash(9).is_none());
    }

    #[test]
    fn relative_path_joins_components() {
        let entry = FileEntry {
            length: 1,
            path: vec!["sub".to_string(), "CPL.xml".to_string()],
        };
        assert_eq!(entry.relative_path(), "sub/CPL.xml");
    }
}
