//! Torrents, seeders, the announce attempt log, and the piece-completion
//! cache.

use chrono::{DateTime, Utc};
use omnicloud_metainfo::InfoHash;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::info;
use uuid::Uuid;

use crate::error::{CatalogError, CatalogResult};
use crate::model::{AnnounceAttempt, SeederRecord, SeederStatus, TorrentRecord};
use crate::store::{CatalogStore, uuid_column};

pub(crate) const INSERT_TORRENT_SQL: &str = r"
    INSERT INTO torrents (
        id, package_id, info_hash, piece_size, pieces_count, file_count,
        total_bytes, meta_bytes, created_by_node, created_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
";

const SELECT_TORRENT_SQL: &str = r"SELECT * FROM torrents WHERE id = $1";
const SELECT_TORRENT_BY_HASH_SQL: &str = r"SELECT * FROM torrents WHERE info_hash = $1";
const SELECT_TORRENT_BY_PACKAGE_SQL: &str = r"SELECT * FROM torrents WHERE package_id = $1";
const SELECT_TORRENTS_SQL: &str = r"SELECT * FROM torrents ORDER BY created_at DESC";
const UPDATE_TORRENT_STATS_SQL: &str = r"
    UPDATE torrents SET file_count = $2, total_bytes = $3 WHERE id = $1
";
const DELETE_TORRENT_SQL: &str = r"DELETE FROM torrents WHERE package_id = $1";

const UPSERT_SEEDER_SQL: &str = r"
    INSERT INTO seeders (torrent_id, node_id, local_path, status, uploaded_bytes, last_announce)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (torrent_id, node_id) DO UPDATE
    SET local_path = EXCLUDED.local_path,
        status = EXCLUDED.status,
        uploaded_bytes = EXCLUDED.uploaded_bytes,
        last_announce = COALESCE(EXCLUDED.last_announce, seeders.last_announce)
";
const DELETE_SEEDER_SQL: &str = r"DELETE FROM seeders WHERE torrent_id = $1 AND node_id = $2";
const SELECT_SEEDERS_SQL: &str = r"SELECT * FROM seeders WHERE torrent_id = $1 ORDER BY node_id";

const INSERT_ANNOUNCE_SQL: &str = r"
    INSERT INTO announce_log (info_hash, peer_id, ip, port, event, status, reason, created_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
";
const SELECT_ANNOUNCES_SQL: &str = r"
    SELECT * FROM announce_log WHERE info_hash = $1 ORDER BY id DESC LIMIT $2
";
const COUNT_ANNOUNCE_ERRORS_SQL: &str = r"
    SELECT COUNT(*) AS errors FROM announce_log
    WHERE info_hash = $1 AND status = 'error' AND created_at >= $2
";

const UPSERT_PIECE_SQL: &str = r"
    INSERT INTO piece_completion (info_hash, piece_index, completed, verified_at)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (info_hash, piece_index) DO UPDATE
    SET completed = EXCLUDED.completed,
        verified_at = EXCLUDED.verified_at
";
const SELECT_PIECES_SQL: &str = r"
    SELECT piece_index, completed FROM piece_completion WHERE info_hash = $1
";
const DELETE_INCOMPLETE_PIECES_SQL: &str = r"DELETE FROM piece_completion WHERE completed = 0";
const DELETE_PIECES_FOR_SQL: &str = r"DELETE FROM piece_completion WHERE info_hash = $1";

impl CatalogStore {
    /// Insert a torrent row. At most one torrent exists per package; the
    /// unique constraints reject duplicates.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_torrent(&self, record: &TorrentRecord) -> CatalogResult<()> {
        sqlx::query(INSERT_TORRENT_SQL)
            .bind(record.id.to_string())
            .bind(record.package_id.to_string())
            .bind(record.info_hash.to_hex())
            .bind(record.piece_size)
            .bind(record.pieces_count)
            .bind(record.file_count)
            .bind(record.total_bytes)
            .bind(record.meta_bytes.as_slice())
            .bind(record.created_by_node.to_string())
            .bind(record.created_at)
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("torrents.insert"))?;
        info!(info_hash = %record.info_hash, package_id = %record.package_id, "torrent recorded");
        Ok(())
    }

    /// Fetch a torrent by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn torrent(&self, id: Uuid) -> CatalogResult<Option<TorrentRecord>> {
        let row = sqlx::query(SELECT_TORRENT_SQL)
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(CatalogError::db("torrents.get"))?;
        row.as_ref().map(map_torrent_row).transpose()
    }

    /// Fetch a torrent by info-hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn torrent_by_info_hash(
        &self,
        info_hash: &InfoHash,
    ) -> CatalogResult<Option<TorrentRecord>> {
        let row = sqlx::query(SELECT_TORRENT_BY_HASH_SQL)
            .bind(info_hash.to_hex())
            .fetch_optional(self.pool())
            .await
            .map_err(CatalogError::db("torrents.by_hash"))?;
        row.as_ref().map(map_torrent_row).transpose()
    }

    /// Fetch the torrent for a package.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn torrent_by_package(
        &self,
        package_id: Uuid,
    ) -> CatalogResult<Option<TorrentRecord>> {
        let row = sqlx::query(SELECT_TORRENT_BY_PACKAGE_SQL)
            .bind(package_id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(CatalogError::db("torrents.by_package"))?;
        row.as_ref().map(map_torrent_row).transpose()
    }

    /// List every torrent, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_torrents(&self) -> CatalogResult<Vec<TorrentRecord>> {
        let rows = sqlx::query(SELECT_TORRENTS_SQL)
            .fetch_all(self.pool())
            .await
            .map_err(CatalogError::db("torrents.list"))?;
        rows.iter().map(map_torrent_row).collect()
    }

    /// Correct a torrent's file count and total bytes. The only permitted
    /// update to a torrent row.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_torrent_stats(
        &self,
        id: Uuid,
        file_count: i64,
        total_bytes: i64,
    ) -> CatalogResult<()> {
        sqlx::query(UPDATE_TORRENT_STATS_SQL)
            .bind(id.to_string())
            .bind(file_count)
            .bind(total_bytes)
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("torrents.update_stats"))?;
        Ok(())
    }

    /// Delete the torrent for a package; only called when the package is
    /// gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_torrent_for_package(&self, package_id: Uuid) -> CatalogResult<()> {
        sqlx::query(DELETE_TORRENT_SQL)
            .bind(package_id.to_string())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("torrents.delete"))?;
        Ok(())
    }

    /// Idempotently upsert a seeder row.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn upsert_seeder(&self, record: &SeederRecord) -> CatalogResult<()> {
        sqlx::query(UPSERT_SEEDER_SQL)
            .bind(record.torrent_id.to_string())
            .bind(record.node_id.to_string())
            .bind(&record.local_path)
            .bind(record.status.as_str())
            .bind(record.uploaded_bytes)
            .bind(record.last_announce)
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("seeders.upsert"))?;
        Ok(())
    }

    /// Remove a seeder row.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_seeder(&self, torrent_id: Uuid, node_id: Uuid) -> CatalogResult<()> {
        sqlx::query(DELETE_SEEDER_SQL)
            .bind(torrent_id.to_string())
            .bind(node_id.to_string())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("seeders.delete"))?;
        Ok(())
    }

    /// Seeders registered for a torrent.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn seeders_for_torrent(&self, torrent_id: Uuid) -> CatalogResult<Vec<SeederRecord>> {
        let rows = sqlx::query(SELECT_SEEDERS_SQL)
            .bind(torrent_id.to_string())
            .fetch_all(self.pool())
            .await
            .map_err(CatalogError::db("seeders.list"))?;
        rows.iter().map(map_seeder_row).collect()
    }

    /// Append one row to the announce attempt log.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn record_announce_attempt(&self, attempt: &AnnounceAttempt) -> CatalogResult<()> {
        sqlx::query(INSERT_ANNOUNCE_SQL)
            .bind(&attempt.info_hash)
            .bind(&attempt.peer_id)
            .bind(&attempt.ip)
            .bind(i64::from(attempt.port))
            .bind(&attempt.event)
            .bind(&attempt.status)
            .bind(attempt.reason.as_deref())
            .bind(attempt.created_at)
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("announce_log.insert"))?;
        Ok(())
    }

    /// Recent announce attempts for an info-hash, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn recent_announce_attempts(
        &self,
        info_hash: &str,
        limit: i64,
    ) -> CatalogResult<Vec<AnnounceAttempt>> {
        let rows = sqlx::query(SELECT_ANNOUNCES_SQL)
            .bind(info_hash)
            .bind(limit)
            .fetch_all(self.pool())
            .await
            .map_err(CatalogError::db("announce_log.recent"))?;
        rows.iter().map(map_announce_row).collect()
    }

    /// Count of error announces for an info-hash since `since`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn recent_announce_error_count(
        &self,
        info_hash: &str,
        since: DateTime<Utc>,
    ) -> CatalogResult<i64> {
        let row = sqlx::query(COUNT_ANNOUNCE_ERRORS_SQL)
            .bind(info_hash)
            .bind(since)
            .fetch_one(self.pool())
            .await
            .map_err(CatalogError::db("announce_log.error_count"))?;
        row.try_get("errors")
            .map_err(CatalogError::db("announce_log.error_count.column"))
    }

    /// Record one piece's verification outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn set_piece_complete(
        &self,
        info_hash: &InfoHash,
        piece_index: u32,
        completed: bool,
    ) -> CatalogResult<()> {
        sqlx::query(UPSERT_PIECE_SQL)
            .bind(info_hash.to_hex())
            .bind(i64::from(piece_index))
            .bind(completed)
            .bind(Utc::now())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("pieces.upsert"))?;
        Ok(())
    }

    /// Load the piece-completion map for an info-hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn piece_completion_map(
        &self,
        info_hash: &InfoHash,
    ) -> CatalogResult<Vec<(u32, bool)>> {
        let rows = sqlx::query(SELECT_PIECES_SQL)
            .bind(info_hash.to_hex())
            .fetch_all(self.pool())
            .await
            .map_err(CatalogError::db("pieces.load"))?;
        rows.iter()
            .map(|row| {
                let index: i64 = row
                    .try_get("piece_index")
                    .map_err(CatalogError::db("pieces.load.index"))?;
                let completed: bool = row
                    .try_get("completed")
                    .map_err(CatalogError::db("pieces.load.completed"))?;
                let index = u32::try_from(index).map_err(|_err| CatalogError::Decode {
                    operation: "pieces.load",
                    column: "piece_index",
                    value: index.to_string(),
                })?;
                Ok((index, completed))
            })
            .collect()
    }

    /// Startup repair: drop rows written as incomplete by a previous process
    /// so the engine re-verifies those pieces from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_incomplete_piece_records(&self) -> CatalogResult<u64> {
        let result = sqlx::query(DELETE_INCOMPLETE_PIECES_SQL)
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("pieces.repair"))?;
        Ok(result.rows_affected())
    }

    /// Drop every completion row for an info-hash (torrent removed).
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn clear_piece_records(&self, info_hash: &InfoHash) -> CatalogResult<()> {
        sqlx::query(DELETE_PIECES_FOR_SQL)
            .bind(info_hash.to_hex())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("pieces.clear"))?;
        Ok(())
    }
}

pub(crate) fn map_torrent_row(row: &SqliteRow) -> CatalogResult<TorrentRecord> {
    const OP: &str = "torrents.map_row";
    let hash_raw: String = row.try_get("info_hash").map_err(CatalogError::db(OP))?;
    let info_hash: InfoHash = hash_raw.parse().map_err(|_err| CatalogError::Decode {
        operation: OP,
        column: "info_hash",
        value: hash_raw,
    })?;
    Ok(TorrentRecord {
        id: uuid_column(row, OP, "id")?,
        package_id: uuid_column(row, OP, "package_id")?,
        info_hash,
        piece_size: row.try_get("piece_size").map_err(CatalogError::db(OP))?,
        pieces_count: row.try_get("pieces_count").map_err(CatalogError::db(OP))?,
        file_count: row.try_get("file_count").map_err(CatalogError::db(OP))?,
        total_bytes: row.try_get("total_bytes").map_err(CatalogError::db(OP))?,
        meta_bytes: row.try_get("meta_bytes").map_err(CatalogError::db(OP))?,
        created_by_node: uuid_column(row, OP, "created_by_node")?,
        created_at: row.try_get("created_at").map_err(CatalogError::db(OP))?,
    })
}

fn map_seeder_row(row: &SqliteRow) -> CatalogResult<SeederRecord> {
    const OP: &str = "seeders.map_row";
    let status_raw: String = row.try_get("status").map_err(CatalogError::db(OP))?;
    Ok(SeederRecord {
        torrent_id: uuid_column(row, OP, "torrent_id")?,
        node_id: uuid_column(row, OP, "node_id")?,
        local_path: row.try_get("local_path").map_err(CatalogError::db(OP))?,
        status: SeederStatus::parse(&status_raw),
        uploaded_bytes: row.try_get("uploaded_bytes").map_err(CatalogError::db(OP))?,
        last_announce: row.try_get("last_announce").map_err(CatalogError::db(OP))?,
    })
}

fn map_announce_row(row: &SqliteRow) -> CatalogResult<AnnounceAttempt> {
    const OP: &str = "announce_log.map_row";
    let port: i64 = row.try_get("port").map_err(CatalogError::db(OP))?;
    Ok(AnnounceAttempt {
        info_hash: row.try_get("info_hash").map_err(CatalogError::db(OP))?,
        peer_id: row.try_get("peer_id").map_err(CatalogError::db(OP))?,
        ip: row.try_get("ip").map_err(CatalogError::db(OP))?,
        port: u16::try_from(port).unwrap_or_default(),
        event: row.try_get("event").map_err(CatalogError::db(OP))?,
        status: row.try_get("status").map_err(CatalogError::db(OP))?,
        reason: row.try_get("reason").map_err(CatalogError::db(OP))?,
        created_at: row.try_get("created_at").map_err(CatalogError::db(OP))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> CatalogStore {
        CatalogStore::open_in_memory().await.expect("open")
    }

    fn sample_torrent(package_id: Uuid) -> TorrentRecord {
        TorrentRecord {
            id: Uuid::new_v4(),
            package_id,
            info_hash: InfoHash([0x42; 20]),
            piece_size: 262_144,
            pieces_count: 9,
            file_count: 2,
            total_bytes: 2_097_202,
            meta_bytes: vec![1, 2, 3],
            created_by_node: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn torrent_round_trip_by_both_keys() {
        let store = store().await;
        let record = sample_torrent(Uuid::new_v4());
        store.insert_torrent(&record).await.expect("insert");

        let by_hash = store
            .torrent_by_info_hash(&record.info_hash)
            .await
            .expect("query")
            .expect("exists");
        assert_eq!(by_hash.id, record.id);
        assert_eq!(by_hash.meta_bytes, vec![1, 2, 3]);

        let by_package = store
            .torrent_by_package(record.package_id)
            .await
            .expect("query")
            .expect("exists");
        assert_eq!(by_package.id, record.id);
    }

    #[tokio::test]
    async fn second_torrent_per_package_is_rejected() {
        let store = store().await;
        let package_id = Uuid::new_v4();
        store
            .insert_torrent(&sample_torrent(package_id))
            .await
            .expect("first");
        let mut duplicate = sample_torrent(package_id);
        duplicate.info_hash = InfoHash([0x43; 20]);
        assert!(
            store.insert_torrent(&duplicate).await.is_err(),
            "package_id is unique across torrents"
        );
    }

    #[tokio::test]
    async fn seeder_upsert_and_delete() {
        let store = store().await;
        let torrent_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();
        let record = SeederRecord {
            torrent_id,
            node_id,
            local_path: "/lib/PkgA".to_string(),
            status: SeederStatus::Seeding,
            uploaded_bytes: 0,
            last_announce: Some(Utc::now()),
        };
        store.upsert_seeder(&record).await.expect("upsert");
        store.upsert_seeder(&record).await.expect("idempotent");
        assert_eq!(store.seeders_for_torrent(torrent_id).await.expect("list").len(), 1);

        store.delete_seeder(torrent_id, node_id).await.expect("delete");
        assert!(store.seeders_for_torrent(torrent_id).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn announce_log_is_append_only_and_ordered() {
        let store = store().await;
        let hash = "00".repeat(20);
        for (status, reason) in [("ok", None), ("error", Some("Invalid info_hash"))] {
            store
                .record_announce_attempt(&AnnounceAttempt {
                    info_hash: hash.clone(),
                    peer_id: "peer".to_string(),
                    ip: "198.51.100.9".to_string(),
                    port: 6881,
                    event: "started".to_string(),
                    status: status.to_string(),
                    reason: reason.map(str::to_string),
                    created_at: Utc::now(),
                })
                .await
                .expect("insert");
        }
        let attempts = store
            .recent_announce_attempts(&hash, 10)
            .await
            .expect("recent");
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].status, "error", "newest first");

        let errors = store
            .recent_announce_error_count(&hash, Utc::now() - chrono::Duration::minutes(5))
            .await
            .expect("count");
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn piece_repair_drops_only_incomplete_rows() {
        let store = store().await;
        let hash = InfoHash([0x11; 20]);
        store.set_piece_complete(&hash, 0, true).await.expect("set");
        store.set_piece_complete(&hash, 1, false).await.expect("set");
        store.set_piece_complete(&hash, 2, true).await.expect("set");

        let dropped = store
            .delete_incomplete_piece_records()
            .await
            .expect("repair");
        assert_eq!(dropped, 1);

        let map = store.piece_completion_map(&hash).await.expect("load");
        assert_eq!(map.len(), 2);
        assert!(map.iter().all(|(_, completed)| *completed));

        store.clear_piece_records(&hash).await.expect("clear");
        assert!(store.piece_completion_map(&hash).await.expect("load").is_empty());
    }
}
