//! The dedup resolver: co-seeding a canonical torrent through the shadow
//! directory.
//!
//! The library path stays untouched: the ingest system owns it exclusively
//!: and nothing but this resolver ever writes the shadow directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use omnicloud_torrent::{ShadowRules, StorageBinding};
use tracing::{debug, info};
use uuid::Uuid;

use crate::site::{LocalPackage, SiteContext};

/// Register the canonical torrent with split-path storage: XML from the
/// hub-written shadow directory, media from the library path.
pub(crate) async fn co_seed(
    context: &Arc<SiteContext>,
    package: &LocalPackage,
    canonical_package_id: Uuid,
    info_hash_hex: &str,
) -> Result<()> {
    let already = context
        .engine
        .snapshot()
        .iter()
        .any(|torrent| torrent.info_hash.to_hex() == info_hash_hex);
    if already {
        return Ok(());
    }

    let shadow_dir = write_shadow_directory(context, canonical_package_id).await?;
    let meta_bytes = context
        .hub
        .torrent_file(info_hash_hex)
        .await
        .context("canonical torrent fetch failed")?;
    context
        .engine
        .register_bytes(
            &meta_bytes,
            StorageBinding::Split {
                media_root: package.local_path.clone(),
                shadow_root: shadow_dir,
                rules: ShadowRules::dcp_metadata(),
            },
            None,
            Some(context.announce_url.clone()),
        )
        .context("co-seed registration failed")?;
    info!(
        info_hash = %info_hash_hex,
        canonical_package = %canonical_package_id,
        library_path = %package.local_path.display(),
        "co-seeding canonical torrent through shadow storage"
    );
    Ok(())
}

/// Fetch the canonical XML payload and write it byte-identically under
/// `<torrent_root>/canonical-xml/<package_id>/`. Idempotent: existing
/// identical files are left alone.
pub(crate) async fn write_shadow_directory(
    context: &Arc<SiteContext>,
    canonical_package_id: Uuid,
) -> Result<PathBuf> {
    let payload = context
        .hub
        .canonical_xml(canonical_package_id)
        .await
        .context("canonical xml fetch failed")?;
    let shadow_dir = context
        .config
        .shadow_root()
        .join(canonical_package_id.to_string());

    for file in &payload.files {
        let content = BASE64
            .decode(&file.content_b64)
            .context("canonical xml payload was not valid base64")?;
        let target = shadow_dir.join(&file.rel_path);
        if let Ok(existing) = tokio::fs::read(&target).await {
            if existing == content {
                continue;
            }
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("shadow directory creation failed")?;
        }
        tokio::fs::write(&target, &content)
            .await
            .context("shadow file write failed")?;
        debug!(path = %target.display(), bytes = content.len(), "shadow file written");
    }
    Ok(shadow_dir)
}

/// Collect the metadata files a canonical holder uploads to the hub: the
/// package's XML/manifest files by the same include-list split storage
/// uses.
pub(crate) async fn collect_metadata_files(root: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let rules = ShadowRules::dcp_metadata();
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .context("metadata directory read failed")?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("metadata directory entry failed")?
        {
            let path = entry.path();
            let file_type = entry.file_type().await.context("metadata file type failed")?;
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            let rel = rel.to_string_lossy().replace('\\', "/");
            if rules.matches(&rel) {
                let content = tokio::fs::read(&path)
                    .await
                    .context("metadata file read failed")?;
                out.push((rel, content));
            }
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn metadata_collection_picks_xml_and_manifests_only() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("PkgA");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("ASSETMAP"), b"assetmap").unwrap();
        std::fs::write(root.join("CPL_abc.xml"), b"<Cpl/>").unwrap();
        std::fs::write(root.join("VIDEO.mxf"), vec![0u8; 64]).unwrap();

        let files = collect_metadata_files(&root).await.expect("collect");
        let names: Vec<&str> = files.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["ASSETMAP", "CPL_abc.xml"]);
    }
}
