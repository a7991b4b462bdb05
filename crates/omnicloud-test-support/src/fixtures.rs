//! Deterministic on-disk package fixtures.

use std::path::{Path, PathBuf};

/// A DCP-shaped package written under a temp root: a small ASSETMAP, a CPL,
/// and a deterministic media file.
pub struct PackageFixture {
    /// The package directory.
    pub root: PathBuf,
    /// Total payload bytes across every file.
    pub total_bytes: u64,
}

/// Write a package fixture with `media_len` bytes of deterministic media.
///
/// The ASSETMAP is 50 bytes of `A`, the CPL is a short XML stub, and the
/// media file repeats a modular byte pattern so two fixtures with the same
/// `media_len` are byte-identical: the property the dedup paths rely on.
///
/// # Panics
///
/// Panics if the fixture cannot be written.
#[must_use]
pub fn write_package(parent: &Path, dir_name: &str, media_len: usize) -> PackageFixture {
    let root = parent.join(dir_name);
    std::fs::create_dir_all(&root).expect("fixture directory");
    std::fs::write(root.join("ASSETMAP"), vec![b'A'; 50]).expect("assetmap");
    let cpl = b"<CompositionPlaylist/>".to_vec();
    std::fs::write(root.join("CPL_feature.xml"), &cpl).expect("cpl");
    let media: Vec<u8> = (0..media_len).map(|index| (index % 251) as u8).collect();
    std::fs::write(root.join("VIDEO.mxf"), &media).expect("media");
    PackageFixture {
        root,
        total_bytes: 50 + cpl.len() as u64 + media_len as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixtures_with_equal_lengths_are_byte_identical() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = write_package(temp.path(), "PkgA", 4096);
        let second = write_package(temp.path(), "PkgA-v2", 4096);
        assert_eq!(first.total_bytes, second.total_bytes);
        for file in ["ASSETMAP", "CPL_feature.xml", "VIDEO.mxf"] {
            let a = std::fs::read(first.root.join(file)).expect("read");
            let b = std::fs::read(second.root.join(file)).expect("read");
            assert_eq!(a, b, "{file} must match across fixtures");
        }
    }
}
