//! Packages, per-node inventory, and canonical XML custody.

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::error::{CatalogError, CatalogResult};
use crate::model::{InventoryEntry, InventoryStatus, PackageRecord};
use crate::store::{CatalogStore, uuid_column};

const UPSERT_PACKAGE_SQL: &str = r"
    INSERT INTO packages (
        id, outer_fp, inner_fp, title, kind, size_bytes, file_count, discovered_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT (outer_fp) DO UPDATE
    SET title = EXCLUDED.title,
        kind = EXCLUDED.kind,
        size_bytes = EXCLUDED.size_bytes,
        file_count = EXCLUDED.file_count
";

const SELECT_PACKAGE_SQL: &str = r"SELECT * FROM packages WHERE id = $1";
const SELECT_PACKAGE_BY_OUTER_SQL: &str = r"SELECT * FROM packages WHERE outer_fp = $1";
const SELECT_PACKAGE_BY_INNER_SQL: &str = r"SELECT * FROM packages WHERE inner_fp = $1 LIMIT 2";
const SELECT_PACKAGES_SQL: &str = r"
    SELECT * FROM packages
    WHERE ($1 IS NULL OR title LIKE '%' || $1 || '%')
    ORDER BY discovered_at DESC
    LIMIT $2
";
const TOUCH_PACKAGE_SQL: &str = r"UPDATE packages SET last_verified = $2 WHERE id = $1";

const UPSERT_INVENTORY_SQL: &str = r"
    INSERT INTO inventory (node_id, package_id, local_path, status, last_verified)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (node_id, package_id) DO UPDATE
    SET local_path = EXCLUDED.local_path,
        status = EXCLUDED.status,
        last_verified = COALESCE(EXCLUDED.last_verified, inventory.last_verified)
";
const DELETE_INVENTORY_SQL: &str =
    r"DELETE FROM inventory WHERE node_id = $1 AND package_id = $2";
const SELECT_INVENTORY_FOR_NODE_SQL: &str =
    r"SELECT * FROM inventory WHERE node_id = $1 ORDER BY package_id";
const SELECT_HOLDERS_SQL: &str =
    r"SELECT * FROM inventory WHERE package_id = $1 AND status = 'present'";

const DELETE_CANONICAL_XML_SQL: &str = r"DELETE FROM canonical_xml WHERE package_id = $1";
const INSERT_CANONICAL_XML_SQL: &str =
    r"INSERT INTO canonical_xml (package_id, rel_path, content) VALUES ($1, $2, $3)";
const SELECT_CANONICAL_XML_SQL: &str =
    r"SELECT rel_path, content FROM canonical_xml WHERE package_id = $1 ORDER BY rel_path";

impl CatalogStore {
    /// Idempotently upsert a package keyed on its delivery fingerprint.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or the follow-up read fails.
    pub async fn upsert_package(
        &self,
        outer_fp: &str,
        inner_fp: &str,
        title: &str,
        kind: &str,
        size_bytes: i64,
        file_count: i64,
    ) -> CatalogResult<PackageRecord> {
        sqlx::query(UPSERT_PACKAGE_SQL)
            .bind(Uuid::new_v4().to_string())
            .bind(outer_fp)
            .bind(inner_fp)
            .bind(title)
            .bind(kind)
            .bind(size_bytes)
            .bind(file_count)
            .bind(Utc::now())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("packages.upsert"))?;
        self.package_by_outer_fp(outer_fp)
            .await?
            .ok_or_else(|| CatalogError::NotFound {
                entity: "package",
                id: outer_fp.to_string(),
            })
    }

    /// Fetch a package by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn package(&self, id: Uuid) -> CatalogResult<Option<PackageRecord>> {
        let row = sqlx::query(SELECT_PACKAGE_SQL)
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(CatalogError::db("packages.get"))?;
        row.as_ref().map(map_package_row).transpose()
    }

    /// Fetch a package by delivery fingerprint.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn package_by_outer_fp(
        &self,
        outer_fp: &str,
    ) -> CatalogResult<Option<PackageRecord>> {
        let row = sqlx::query(SELECT_PACKAGE_BY_OUTER_SQL)
            .bind(outer_fp)
            .fetch_optional(self.pool())
            .await
            .map_err(CatalogError::db("packages.by_outer_fp"))?;
        row.as_ref().map(map_package_row).transpose()
    }

    /// Canonical lookup by composition fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::AmbiguousCanonical`] if more than one package
    /// carries the fingerprint; the dedup invariant requires at most one.
    pub async fn package_by_inner_fp(
        &self,
        inner_fp: &str,
    ) -> CatalogResult<Option<PackageRecord>> {
        let rows = sqlx::query(SELECT_PACKAGE_BY_INNER_SQL)
            .bind(inner_fp)
            .fetch_all(self.pool())
            .await
            .map_err(CatalogError::db("packages.by_inner_fp"))?;
        if rows.len() > 1 {
            return Err(CatalogError::AmbiguousCanonical {
                inner_fp: inner_fp.to_string(),
            });
        }
        rows.first().map(map_package_row).transpose()
    }

    /// List packages, optionally filtered by title substring.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_packages(
        &self,
        title: Option<&str>,
        limit: i64,
    ) -> CatalogResult<Vec<PackageRecord>> {
        let rows = sqlx::query(SELECT_PACKAGES_SQL)
            .bind(title)
            .bind(limit)
            .fetch_all(self.pool())
            .await
            .map_err(CatalogError::db("packages.list"))?;
        rows.iter().map(map_package_row).collect()
    }

    /// Record a successful verification pass over a package's payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn touch_package_verified(&self, id: Uuid) -> CatalogResult<()> {
        sqlx::query(TOUCH_PACKAGE_SQL)
            .bind(id.to_string())
            .bind(Utc::now())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("packages.touch"))?;
        Ok(())
    }

    /// Idempotently upsert one node's inventory row for a package.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn upsert_inventory(&self, entry: &InventoryEntry) -> CatalogResult<()> {
        sqlx::query(UPSERT_INVENTORY_SQL)
            .bind(entry.node_id.to_string())
            .bind(entry.package_id.to_string())
            .bind(&entry.local_path)
            .bind(entry.status.as_str())
            .bind(entry.last_verified)
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("inventory.upsert"))?;
        Ok(())
    }

    /// Delete one node's inventory row for a package. The package row itself
    /// is never deleted here.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_inventory(&self, node_id: Uuid, package_id: Uuid) -> CatalogResult<()> {
        sqlx::query(DELETE_INVENTORY_SQL)
            .bind(node_id.to_string())
            .bind(package_id.to_string())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("inventory.delete"))?;
        Ok(())
    }

    /// Every inventory row held by a node.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn inventory_for_node(&self, node_id: Uuid) -> CatalogResult<Vec<InventoryEntry>> {
        let rows = sqlx::query(SELECT_INVENTORY_FOR_NODE_SQL)
            .bind(node_id.to_string())
            .fetch_all(self.pool())
            .await
            .map_err(CatalogError::db("inventory.for_node"))?;
        rows.iter().map(map_inventory_row).collect()
    }

    /// Nodes currently holding a package's payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn holders_of_package(&self, package_id: Uuid) -> CatalogResult<Vec<InventoryEntry>> {
        let rows = sqlx::query(SELECT_HOLDERS_SQL)
            .bind(package_id.to_string())
            .fetch_all(self.pool())
            .await
            .map_err(CatalogError::db("inventory.holders"))?;
        rows.iter().map(map_inventory_row).collect()
    }

    /// Replace the canonical XML payload for a package.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn put_canonical_xml(
        &self,
        package_id: Uuid,
        files: &[(String, Vec<u8>)],
    ) -> CatalogResult<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(CatalogError::db("canonical_xml.begin"))?;
        sqlx::query(DELETE_CANONICAL_XML_SQL)
            .bind(package_id.to_string())
            .execute(tx.as_mut())
            .await
            .map_err(CatalogError::db("canonical_xml.clear"))?;
        for (rel_path, content) in files {
            sqlx::query(INSERT_CANONICAL_XML_SQL)
                .bind(package_id.to_string())
                .bind(rel_path)
                .bind(content.as_slice())
                .execute(tx.as_mut())
                .await
                .map_err(CatalogError::db("canonical_xml.insert"))?;
        }
        tx.commit()
            .await
            .map_err(CatalogError::db("canonical_xml.commit"))?;
        Ok(())
    }

    /// Fetch the canonical XML payload for a package, ordered by path.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn canonical_xml(&self, package_id: Uuid) -> CatalogResult<Vec<(String, Vec<u8>)>> {
        let rows = sqlx::query(SELECT_CANONICAL_XML_SQL)
            .bind(package_id.to_string())
            .fetch_all(self.pool())
            .await
            .map_err(CatalogError::db("canonical_xml.get"))?;
        rows.iter()
            .map(|row| {
                let rel_path: String = row
                    .try_get("rel_path")
                    .map_err(CatalogError::db("canonical_xml.rel_path"))?;
                let content: Vec<u8> = row
                    .try_get("content")
                    .map_err(CatalogError::db("canonical_xml.content"))?;
                Ok((rel_path, content))
            })
            .collect()
    }
}

fn map_package_row(row: &SqliteRow) -> CatalogResult<PackageRecord> {
    const OP: &str = "packages.map_row";
    Ok(PackageRecord {
        id: uuid_column(row, OP, "id")?,
        outer_fp: row.try_get("outer_fp").map_err(CatalogError::db(OP))?,
        inner_fp: row.try_get("inner_fp").map_err(CatalogError::db(OP))?,
        title: row.try_get("title").map_err(CatalogError::db(OP))?,
        kind: row.try_get("kind").map_err(CatalogError::db(OP))?,
        size_bytes: row.try_get("size_bytes").map_err(CatalogError::db(OP))?,
        file_count: row.try_get("file_count").map_err(CatalogError::db(OP))?,
        discovered_at: row.try_get("discovered_at").map_err(CatalogError::db(OP))?,
        last_verified: row.try_get("last_verified").map_err(CatalogError::db(OP))?,
    })
}

fn map_inventory_row(row: &SqliteRow) -> CatalogResult<InventoryEntry> {
    const OP: &str = "inventory.map_row";
    let status_raw: String = row.try_get("status").map_err(CatalogError::db(OP))?;
    Ok(InventoryEntry {
        node_id: uuid_column(row, OP, "node_id")?,
        package_id: uuid_column(row, OP, "package_id")?,
        local_path: row.try_get("local_path").map_err(CatalogError::db(OP))?,
        status: InventoryStatus::parse(&status_raw),
        last_verified: row.try_get("last_verified").map_err(CatalogError::db(OP))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> CatalogStore {
        CatalogStore::open_in_memory().await.expect("open")
    }

    #[tokio::test]
    async fn upsert_package_is_idempotent_on_outer_fp() {
        let store = store().await;
        let first = store
            .upsert_package("U1", "C1", "PkgA", "feature", 100, 2)
            .await
            .expect("insert");
        let second = store
            .upsert_package("U1", "C1", "PkgA v2", "feature", 120, 2)
            .await
            .expect("update");
        assert_eq!(first.id, second.id, "outer_fp is the natural key");
        assert_eq!(second.title, "PkgA v2");
        assert_eq!(second.size_bytes, 120);
    }

    #[tokio::test]
    async fn canonical_lookup_finds_at_most_one() {
        let store = store().await;
        let package = store
            .upsert_package("U1", "C1", "PkgA", "feature", 100, 2)
            .await
            .expect("insert");
        let found = store
            .package_by_inner_fp("C1")
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(found.id, package.id);
        assert!(store.package_by_inner_fp("C2").await.expect("lookup").is_none());

        // A second row with the same inner fingerprint violates the dedup
        // invariant and must surface, not silently pick one.
        let _ = store
            .upsert_package("U2", "C1", "PkgA dup", "feature", 100, 2)
            .await
            .expect("insert duplicate delivery");
        let err = store.package_by_inner_fp("C1").await.expect_err("ambiguous");
        assert!(matches!(err, CatalogError::AmbiguousCanonical { .. }));
    }

    #[tokio::test]
    async fn inventory_deletion_keeps_the_package() {
        let store = store().await;
        let package = store
            .upsert_package("U1", "C1", "PkgA", "feature", 100, 2)
            .await
            .expect("insert");
        let node_id = Uuid::new_v4();
        store
            .upsert_inventory(&InventoryEntry {
                node_id,
                package_id: package.id,
                local_path: "/lib/PkgA".to_string(),
                status: InventoryStatus::Present,
                last_verified: None,
            })
            .await
            .expect("upsert inventory");

        assert_eq!(
            store.holders_of_package(package.id).await.expect("holders").len(),
            1
        );

        store
            .delete_inventory(node_id, package.id)
            .await
            .expect("delete");
        assert!(store.holders_of_package(package.id).await.expect("holders").is_empty());
        assert!(
            store.package(package.id).await.expect("get").is_some(),
            "deleting inventory must not delete the package"
        );
    }

    #[tokio::test]
    async fn inventory_upsert_is_idempotent() {
        let store = store().await;
        let package = store
            .upsert_package("U1", "C1", "PkgA", "feature", 100, 2)
            .await
            .expect("insert");
        let node_id = Uuid::new_v4();
        let entry = InventoryEntry {
            node_id,
            package_id: package.id,
            local_path: "/lib/PkgA".to_string(),
            status: InventoryStatus::Present,
            last_verified: None,
        };
        store.upsert_inventory(&entry).await.expect("first");
        store.upsert_inventory(&entry).await.expect("second");
        assert_eq!(
            store.inventory_for_node(node_id).await.expect("list").len(),
            1,
            "a node has at most one inventory row per package"
        );
    }

    #[tokio::test]
    async fn canonical_xml_round_trip_is_byte_identical() {
        let store = store().await;
        let package_id = Uuid::new_v4();
        let files = vec![
            ("ASSETMAP".to_string(), vec![b'A'; 50]),
            ("CPL.xml".to_string(), b"<Cpl/>".to_vec()),
        ];
        store
            .put_canonical_xml(package_id, &files)
            .await
            .expect("put");
        let loaded = store.canonical_xml(package_id).await.expect("get");
        assert_eq!(loaded, files);

        // Replacement swaps the whole set.
        let replacement = vec![("ASSETMAP".to_string(), vec![b'B'; 10])];
        store
            .put_canonical_xml(package_id, &replacement)
            .await
            .expect("replace");
        assert_eq!(store.canonical_xml(package_id).await.expect("get"), replacement);
    }
}
