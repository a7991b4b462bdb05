//! Pool construction and schema bootstrap.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::error::{CatalogError, CatalogResult};

/// Idempotent schema, applied at connect time. Migration tooling is an
/// out-of-scope collaborator; the DDL here only ever adds.
const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS nodes (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        display_name TEXT,
        mac TEXT NOT NULL,
        public_endpoint TEXT,
        last_seen TEXT,
        authorized INTEGER NOT NULL DEFAULT 0,
        role TEXT NOT NULL,
        version TEXT,
        behind_nat INTEGER NOT NULL DEFAULT 0,
        relay_registered INTEGER NOT NULL DEFAULT 0,
        registration_key_hash TEXT NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_name_mac ON nodes (name, mac);

    CREATE TABLE IF NOT EXISTS packages (
        id TEXT PRIMARY KEY,
        outer_fp TEXT NOT NULL UNIQUE,
        inner_fp TEXT NOT NULL,
        title TEXT NOT NULL,
        kind TEXT NOT NULL,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        file_count INTEGER NOT NULL DEFAULT 0,
        discovered_at TEXT NOT NULL,
        last_verified TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_packages_inner_fp ON packages (inner_fp);

    CREATE TABLE IF NOT EXISTS inventory (
        node_id TEXT NOT NULL,
        package_id TEXT NOT NULL,
        local_path TEXT NOT NULL,
        status TEXT NOT NULL,
        last_verified TEXT,
        PRIMARY KEY (node_id, package_id)
    );

    CREATE TABLE IF NOT EXISTS torrents (
        id TEXT PRIMARY KEY,
        package_id TEXT NOT NULL UNIQUE,
        info_hash TEXT NOT NULL UNIQUE,
        piece_size INTEGER NOT NULL,
        pieces_count INTEGER NOT NULL,
        file_count INTEGER NOT NULL,
        total_bytes INTEGER NOT NULL,
        meta_bytes BLOB NOT NULL,
        created_by_node TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS seeders (
        torrent_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        local_path TEXT NOT NULL,
        status TEXT NOT NULL,
        uploaded_bytes INTEGER NOT NULL DEFAULT 0,
        last_announce TEXT,
        PRIMARY KEY (torrent_id, node_id)
    );

    CREATE TABLE IF NOT EXISTS queue_items (
        package_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        status TEXT NOT NULL,
        progress_pct REAL NOT NULL DEFAULT 0,
        current_file TEXT,
        total_bytes INTEGER NOT NULL DEFAULT 0,
        speed_bps INTEGER NOT NULL DEFAULT 0,
        synced_at TEXT,
        started_at TEXT,
        completed_at TEXT,
        error TEXT,
        cancelled_by TEXT,
        PRIMARY KEY (package_id, node_id)
    );

    CREATE TABLE IF NOT EXISTS generation_checkpoints (
        package_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        piece_index INTEGER NOT NULL,
        piece_hash BLOB NOT NULL,
        PRIMARY KEY (package_id, node_id, piece_index)
    );

    CREATE TABLE IF NOT EXISTS hash_claims (
        package_id TEXT PRIMARY KEY,
        node_id TEXT NOT NULL,
        claimed_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS piece_completion (
        info_hash TEXT NOT NULL,
        piece_index INTEGER NOT NULL,
        completed INTEGER NOT NULL,
        verified_at TEXT NOT NULL,
        PRIMARY KEY (info_hash, piece_index)
    );

    CREATE TABLE IF NOT EXISTS transfers (
        id TEXT PRIMARY KEY,
        torrent_id TEXT NOT NULL,
        source_node TEXT,
        dest_node TEXT NOT NULL,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 5,
        progress_pct REAL NOT NULL DEFAULT 0,
        bytes_done INTEGER NOT NULL DEFAULT 0,
        dl_bps INTEGER NOT NULL DEFAULT 0,
        ul_bps INTEGER NOT NULL DEFAULT 0,
        peers INTEGER NOT NULL DEFAULT 0,
        eta_s INTEGER,
        error TEXT,
        delete_data INTEGER NOT NULL DEFAULT 0,
        pending_cmd TEXT NOT NULL DEFAULT '',
        command_ack INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_transfers_dest_status ON transfers (dest_node, status);

    CREATE TABLE IF NOT EXISTS announce_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        info_hash TEXT NOT NULL,
        peer_id TEXT NOT NULL,
        ip TEXT NOT NULL,
        port INTEGER NOT NULL,
        event TEXT NOT NULL,
        status TEXT NOT NULL,
        reason TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_announce_log_hash ON announce_log (info_hash, id);

    CREATE TABLE IF NOT EXISTS ingestion_status (
        node_id TEXT NOT NULL,
        package_id TEXT NOT NULL,
        info_hash TEXT NOT NULL,
        download_path TEXT NOT NULL,
        ingest_path TEXT,
        status TEXT NOT NULL,
        verified_at TEXT,
        switched_at TEXT,
        cleaned_at TEXT,
        error TEXT,
        PRIMARY KEY (node_id, package_id)
    );

    CREATE TABLE IF NOT EXISTS commands (
        id TEXT PRIMARY KEY,
        target_node TEXT NOT NULL,
        kind TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        status TEXT NOT NULL,
        result_msg TEXT,
        created_at TEXT NOT NULL,
        acknowledged_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_commands_target_status ON commands (target_node, status);

    CREATE TABLE IF NOT EXISTS node_settings (
        node_id TEXT PRIMARY KEY,
        api_url TEXT,
        storage_capacity_bytes INTEGER,
        library_locations TEXT NOT NULL DEFAULT '[]'
    );

    CREATE TABLE IF NOT EXISTS canonical_xml (
        package_id TEXT NOT NULL,
        rel_path TEXT NOT NULL,
        content BLOB NOT NULL,
        PRIMARY KEY (package_id, rel_path)
    );
";

/// Database-backed catalog store.
#[derive(Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
}

impl CatalogStore {
    /// Open (creating if missing) the catalog at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema DDL
    /// fails.
    pub async fn open(path: &Path) -> CatalogResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(CatalogError::db("catalog.open.parse_url"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(CatalogError::db("catalog.open.connect"))?;
        let store = Self { pool };
        store.apply_schema().await?;
        info!(path = %path.display(), "catalog opened");
        Ok(store)
    }

    /// Open an in-memory catalog, used by tests and ephemeral tooling.
    ///
    /// The pool is pinned to one connection because every SQLite `:memory:`
    /// connection is a distinct database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema DDL fails.
    pub async fn open_in_memory() -> CatalogResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(CatalogError::db("catalog.memory.parse_url"))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(CatalogError::db("catalog.memory.connect"))?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    /// Access the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Liveness probe used by the health endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot execute a trivial query.
    pub async fn ping(&self) -> CatalogResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(CatalogError::db("catalog.ping"))?;
        Ok(())
    }

    async fn apply_schema(&self) -> CatalogResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(CatalogError::db("catalog.schema.begin"))?;
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(tx.as_mut())
                .await
                .map_err(CatalogError::db("catalog.schema.apply"))?;
        }
        tx.commit()
            .await
            .map_err(CatalogError::db("catalog.schema.commit"))?;
        Ok(())
    }
}

/// Decode a UUID column stored as hyphenated text.
pub(crate) fn parse_uuid(
    operation: &'static str,
    column: &'static str,
    value: &str,
) -> CatalogResult<Uuid> {
    Uuid::parse_str(value).map_err(|_err| CatalogError::Decode {
        operation,
        column,
        value: value.to_string(),
    })
}

/// Decode an optional UUID column stored as hyphenated text.
pub(crate) fn parse_uuid_opt(
    operation: &'static str,
    column: &'static str,
    value: Option<String>,
) -> CatalogResult<Option<Uuid>> {
    value
        .map(|raw| parse_uuid(operation, column, &raw))
        .transpose()
}

/// Fetch a UUID column out of a row and decode it.
pub(crate) fn uuid_column(
    row: &sqlx::sqlite::SqliteRow,
    operation: &'static str,
    column: &'static str,
) -> CatalogResult<Uuid> {
    let raw: String = row
        .try_get(column)
        .map_err(CatalogError::db(operation))?;
    parse_uuid(operation, column, &raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_applies_and_pings() {
        let store = CatalogStore::open_in_memory().await.expect("open");
        store.ping().await.expect("ping");
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let store = CatalogStore::open_in_memory().await.expect("open");
        store.apply_schema().await.expect("second application");
    }

    #[tokio::test]
    async fn file_backed_catalog_opens() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("catalog.db");
        let store = CatalogStore::open(&path).await.expect("open");
        store.ping().await.expect("ping");
        assert!(path.exists());
    }

    #[test]
    fn uuid_parse_errors_carry_context() {
        let err = parse_uuid("test.op", "id", "not-a-uuid").expect_err("must fail");
        match err {
            CatalogError::Decode { column, .. } => assert_eq!(column, "id"),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
