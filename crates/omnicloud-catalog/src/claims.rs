//! Hashing queue, generation checkpoints, and single-writer hash claims.
//!
//! The claim table keeps at most one expensive hash in flight per package
//! across the fleet. A claim older than three hours whose queue item has not
//! synced progress for ten minutes is stale and may be stolen; success
//! releases the claim and inserts the torrent row in the same transaction.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use omnicloud_metainfo::CheckpointStore;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CatalogError, CatalogResult};
use crate::model::{QueueItem, QueueStatus, TorrentRecord};
use crate::store::{CatalogStore, uuid_column};
use crate::swarm::INSERT_TORRENT_SQL;

/// Age after which a claim is eligible for stealing.
const CLAIM_TTL_HOURS: i64 = 3;

/// Progress-sync freshness window protecting an old claim from the sweep.
const SYNC_FRESH_MINUTES: i64 = 10;

const UPSERT_QUEUE_SQL: &str = r"
    INSERT INTO queue_items (package_id, node_id, status, total_bytes, started_at)
    VALUES ($1, $2, 'queued', $3, NULL)
    ON CONFLICT (package_id, node_id) DO UPDATE
    SET status = CASE
            WHEN queue_items.status IN ('completed', 'generating') THEN queue_items.status
            ELSE 'queued'
        END,
        total_bytes = EXCLUDED.total_bytes,
        error = NULL,
        cancelled_by = NULL
";
const SELECT_QUEUE_ITEM_SQL: &str =
    r"SELECT * FROM queue_items WHERE package_id = $1 AND node_id = $2";
const SELECT_QUEUE_SQL: &str = r"
    SELECT * FROM queue_items
    WHERE status IN ('queued', 'generating')
    ORDER BY started_at IS NOT NULL, package_id
";
const SELECT_QUEUE_ALL_SQL: &str = r"SELECT * FROM queue_items ORDER BY package_id";
const UPDATE_QUEUE_STATUS_SQL: &str = r"
    UPDATE queue_items
    SET status = $3,
        error = $4,
        cancelled_by = $5,
        started_at = CASE WHEN $3 = 'generating' THEN $6 ELSE started_at END,
        completed_at = CASE WHEN $3 IN ('completed', 'failed', 'cancelled') THEN $6 ELSE completed_at END,
        synced_at = $6
    WHERE package_id = $1 AND node_id = $2
";
const UPDATE_QUEUE_PROGRESS_SQL: &str = r"
    UPDATE queue_items
    SET progress_pct = $3,
        current_file = $4,
        speed_bps = $5,
        synced_at = $6
    WHERE package_id = $1 AND node_id = $2
";

const SELECT_CHECKPOINTS_SQL: &str = r"
    SELECT piece_index, piece_hash FROM generation_checkpoints
    WHERE package_id = $1 AND node_id = $2
    ORDER BY piece_index
";
const INSERT_CHECKPOINT_SQL: &str = r"
    INSERT INTO generation_checkpoints (package_id, node_id, piece_index, piece_hash)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (package_id, node_id, piece_index) DO UPDATE
    SET piece_hash = EXCLUDED.piece_hash
";
const DELETE_CHECKPOINTS_SQL: &str =
    r"DELETE FROM generation_checkpoints WHERE package_id = $1 AND node_id = $2";

const SELECT_CLAIM_SQL: &str = r"SELECT * FROM hash_claims WHERE package_id = $1";
const INSERT_CLAIM_SQL: &str =
    r"INSERT INTO hash_claims (package_id, node_id, claimed_at) VALUES ($1, $2, $3)";
const DELETE_CLAIM_SQL: &str = r"DELETE FROM hash_claims WHERE package_id = $1";
const DELETE_CLAIM_FOR_NODE_SQL: &str =
    r"DELETE FROM hash_claims WHERE package_id = $1 AND node_id = $2";
const SELECT_TORRENT_EXISTS_SQL: &str =
    r"SELECT COUNT(*) AS hits FROM torrents WHERE package_id = $1";
const SELECT_STALE_CLAIMS_SQL: &str = r"
    SELECT c.package_id, c.node_id FROM hash_claims c
    LEFT JOIN queue_items q ON q.package_id = c.package_id AND q.node_id = c.node_id
    WHERE c.claimed_at < $1 AND (q.synced_at IS NULL OR q.synced_at < $2)
";
const UPDATE_QUEUE_COMPLETED_SQL: &str = r"
    UPDATE queue_items
    SET status = 'completed', progress_pct = 100, completed_at = $3, synced_at = $3
    WHERE package_id = $1 AND node_id = $2
";

/// Outcome of a site's request to hash a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimDecision {
    /// The package already has a torrent; nothing to hash.
    TorrentExists,
    /// The requester holds the claim and should hash.
    Granted,
    /// Another node holds a fresh claim.
    Denied {
        /// Node currently holding the claim.
        holder: Uuid,
    },
}

impl CatalogStore {
    /// Enqueue (or re-enqueue after failure) a hashing item for a node.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn upsert_queue_item(
        &self,
        package_id: Uuid,
        node_id: Uuid,
        total_bytes: i64,
    ) -> CatalogResult<()> {
        sqlx::query(UPSERT_QUEUE_SQL)
            .bind(package_id.to_string())
            .bind(node_id.to_string())
            .bind(total_bytes)
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("queue.upsert"))?;
        Ok(())
    }

    /// Fetch one queue item.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn queue_item(
        &self,
        package_id: Uuid,
        node_id: Uuid,
    ) -> CatalogResult<Option<QueueItem>> {
        let row = sqlx::query(SELECT_QUEUE_ITEM_SQL)
            .bind(package_id.to_string())
            .bind(node_id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(CatalogError::db("queue.get"))?;
        row.as_ref().map(map_queue_row).transpose()
    }

    /// Items waiting for or undergoing generation.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn active_queue(&self) -> CatalogResult<Vec<QueueItem>> {
        let rows = sqlx::query(SELECT_QUEUE_SQL)
            .fetch_all(self.pool())
            .await
            .map_err(CatalogError::db("queue.active"))?;
        rows.iter().map(map_queue_row).collect()
    }

    /// Every queue item, for the observability listing.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_queue(&self) -> CatalogResult<Vec<QueueItem>> {
        let rows = sqlx::query(SELECT_QUEUE_ALL_SQL)
            .fetch_all(self.pool())
            .await
            .map_err(CatalogError::db("queue.list"))?;
        rows.iter().map(map_queue_row).collect()
    }

    /// Move a queue item to a new status, stamping start/completion times.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_queue_status(
        &self,
        package_id: Uuid,
        node_id: Uuid,
        status: QueueStatus,
        error: Option<&str>,
        cancelled_by: Option<&str>,
    ) -> CatalogResult<()> {
        sqlx::query(UPDATE_QUEUE_STATUS_SQL)
            .bind(package_id.to_string())
            .bind(node_id.to_string())
            .bind(status.as_str())
            .bind(error)
            .bind(cancelled_by)
            .bind(Utc::now())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("queue.set_status"))?;
        Ok(())
    }

    /// Sync hashing progress; refreshes the claim-protecting `synced_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_queue_progress(
        &self,
        package_id: Uuid,
        node_id: Uuid,
        progress_pct: f64,
        current_file: &str,
        speed_bps: i64,
    ) -> CatalogResult<()> {
        sqlx::query(UPDATE_QUEUE_PROGRESS_SQL)
            .bind(package_id.to_string())
            .bind(node_id.to_string())
            .bind(progress_pct)
            .bind(current_file)
            .bind(speed_bps)
            .bind(Utc::now())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("queue.progress"))?;
        Ok(())
    }

    /// Decide whether `node_id` should hash `package_id`, in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn claim_decision(
        &self,
        package_id: Uuid,
        node_id: Uuid,
    ) -> CatalogResult<ClaimDecision> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(CatalogError::db("claims.begin"))?;

        let hits: i64 = sqlx::query(SELECT_TORRENT_EXISTS_SQL)
            .bind(package_id.to_string())
            .fetch_one(tx.as_mut())
            .await
            .map_err(CatalogError::db("claims.torrent_exists"))?
            .try_get("hits")
            .map_err(CatalogError::db("claims.torrent_exists.column"))?;
        if hits > 0 {
            tx.rollback()
                .await
                .map_err(CatalogError::db("claims.rollback"))?;
            return Ok(ClaimDecision::TorrentExists);
        }

        let existing = sqlx::query(SELECT_CLAIM_SQL)
            .bind(package_id.to_string())
            .fetch_optional(tx.as_mut())
            .await
            .map_err(CatalogError::db("claims.get"))?;

        let now = Utc::now();
        if let Some(row) = existing {
            let holder = uuid_column(&row, "claims.get", "node_id")?;
            let claimed_at: DateTime<Utc> = row
                .try_get("claimed_at")
                .map_err(CatalogError::db("claims.get.claimed_at"))?;

            if holder == node_id {
                // Same node resuming after a restart; refresh the claim.
                sqlx::query(DELETE_CLAIM_SQL)
                    .bind(package_id.to_string())
                    .execute(tx.as_mut())
                    .await
                    .map_err(CatalogError::db("claims.refresh.delete"))?;
            } else if self
                .claim_is_stale(tx.as_mut(), package_id, holder, claimed_at, now)
                .await?
            {
                warn!(
                    package_id = %package_id,
                    stale_holder = %holder,
                    new_holder = %node_id,
                    "stealing stale hash claim"
                );
                sqlx::query(DELETE_CLAIM_SQL)
                    .bind(package_id.to_string())
                    .execute(tx.as_mut())
                    .await
                    .map_err(CatalogError::db("claims.steal.delete"))?;
            } else {
                tx.rollback()
                    .await
                    .map_err(CatalogError::db("claims.rollback"))?;
                return Ok(ClaimDecision::Denied { holder });
            }
        }

        sqlx::query(INSERT_CLAIM_SQL)
            .bind(package_id.to_string())
            .bind(node_id.to_string())
            .bind(now)
            .execute(tx.as_mut())
            .await
            .map_err(CatalogError::db("claims.insert"))?;
        tx.commit()
            .await
            .map_err(CatalogError::db("claims.commit"))?;
        Ok(ClaimDecision::Granted)
    }

    async fn claim_is_stale(
        &self,
        conn: &mut sqlx::SqliteConnection,
        package_id: Uuid,
        holder: Uuid,
        claimed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CatalogResult<bool> {
        if claimed_at > now - Duration::hours(CLAIM_TTL_HOURS) {
            return Ok(false);
        }
        let row = sqlx::query(SELECT_QUEUE_ITEM_SQL)
            .bind(package_id.to_string())
            .bind(holder.to_string())
            .fetch_optional(conn)
            .await
            .map_err(CatalogError::db("claims.stale_check"))?;
        let synced_at: Option<DateTime<Utc>> = match row {
            Some(row) => row
                .try_get("synced_at")
                .map_err(CatalogError::db("claims.stale_check.synced_at"))?,
            None => None,
        };
        Ok(synced_at.is_none_or(|at| at < now - Duration::minutes(SYNC_FRESH_MINUTES)))
    }

    /// Release a claim without a torrent (generation failed or cancelled).
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn release_claim(&self, package_id: Uuid, node_id: Uuid) -> CatalogResult<()> {
        sqlx::query(DELETE_CLAIM_FOR_NODE_SQL)
            .bind(package_id.to_string())
            .bind(node_id.to_string())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("claims.release"))?;
        Ok(())
    }

    /// Generation success: insert the torrent row, complete the queue item,
    /// and delete the claim, all in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement in the transaction fails.
    pub async fn commit_generated_torrent(&self, record: &TorrentRecord) -> CatalogResult<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(CatalogError::db("claims.commit_torrent.begin"))?;
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
            .execute(tx.as_mut())
            .await
            .map_err(CatalogError::db("claims.commit_torrent.insert"))?;
        sqlx::query(UPDATE_QUEUE_COMPLETED_SQL)
            .bind(record.package_id.to_string())
            .bind(record.created_by_node.to_string())
            .bind(Utc::now())
            .execute(tx.as_mut())
            .await
            .map_err(CatalogError::db("claims.commit_torrent.queue"))?;
        sqlx::query(DELETE_CLAIM_SQL)
            .bind(record.package_id.to_string())
            .execute(tx.as_mut())
            .await
            .map_err(CatalogError::db("claims.commit_torrent.claim"))?;
        tx.commit()
            .await
            .map_err(CatalogError::db("claims.commit_torrent.commit"))?;
        info!(package_id = %record.package_id, info_hash = %record.info_hash, "generated torrent committed");
        Ok(())
    }

    /// Periodic sweep deleting stale claims. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the sweep query fails.
    pub async fn sweep_stale_claims(&self) -> CatalogResult<u64> {
        let now = Utc::now();
        let claim_cutoff = now - Duration::hours(CLAIM_TTL_HOURS);
        let sync_cutoff = now - Duration::minutes(SYNC_FRESH_MINUTES);
        let rows = sqlx::query(SELECT_STALE_CLAIMS_SQL)
            .bind(claim_cutoff)
            .bind(sync_cutoff)
            .fetch_all(self.pool())
            .await
            .map_err(CatalogError::db("claims.sweep.select"))?;
        let mut removed = 0u64;
        for row in rows {
            let package_id = uuid_column(&row, "claims.sweep", "package_id")?;
            let node_id = uuid_column(&row, "claims.sweep", "node_id")?;
            self.release_claim(package_id, node_id).await?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "stale hash claims swept");
        }
        Ok(removed)
    }
}

#[async_trait]
impl CheckpointStore for CatalogStore {
    async fn load_prefix(
        &self,
        package_id: Uuid,
        node_id: Uuid,
    ) -> anyhow::Result<Vec<[u8; 20]>> {
        let rows = sqlx::query(SELECT_CHECKPOINTS_SQL)
            .bind(package_id.to_string())
            .bind(node_id.to_string())
            .fetch_all(self.pool())
            .await
            .map_err(CatalogError::db("checkpoints.load"))?;
        let mut prefix = Vec::new();
        for (expected, row) in rows.iter().enumerate() {
            let index: i64 = row
                .try_get("piece_index")
                .map_err(CatalogError::db("checkpoints.load.index"))?;
            if index != i64::try_from(expected).unwrap_or(i64::MAX) {
                break;
            }
            let hash: Vec<u8> = row
                .try_get("piece_hash")
                .map_err(CatalogError::db("checkpoints.load.hash"))?;
            let hash: [u8; 20] = hash.try_into().map_err(|_err| CatalogError::Decode {
                operation: "checkpoints.load",
                column: "piece_hash",
                value: "unexpected length".to_string(),
            })?;
            prefix.push(hash);
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
        sqlx::query(INSERT_CHECKPOINT_SQL)
            .bind(package_id.to_string())
            .bind(node_id.to_string())
            .bind(i64::from(piece_index))
            .bind(piece_hash.to_vec())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("checkpoints.record"))?;
        Ok(())
    }

    async fn clear(&self, package_id: Uuid, node_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(DELETE_CHECKPOINTS_SQL)
            .bind(package_id.to_string())
            .bind(node_id.to_string())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("checkpoints.clear"))?;
        Ok(())
    }
}

fn map_queue_row(row: &SqliteRow) -> CatalogResult<QueueItem> {
    const OP: &str = "queue.map_row";
    let status_raw: String = row.try_get("status").map_err(CatalogError::db(OP))?;
    Ok(QueueItem {
        package_id: uuid_column(row, OP, "package_id")?,
        node_id: uuid_column(row, OP, "node_id")?,
        status: QueueStatus::parse(&status_raw),
        progress_pct: row.try_get("progress_pct").map_err(CatalogError::db(OP))?,
        current_file: row.try_get("current_file").map_err(CatalogError::db(OP))?,
        total_bytes: row.try_get("total_bytes").map_err(CatalogError::db(OP))?,
        speed_bps: row.try_get("speed_bps").map_err(CatalogError::db(OP))?,
        synced_at: row.try_get("synced_at").map_err(CatalogError::db(OP))?,
        started_at: row.try_get("started_at").map_err(CatalogError::db(OP))?,
        completed_at: row.try_get("completed_at").map_err(CatalogError::db(OP))?,
        error: row.try_get("error").map_err(CatalogError::db(OP))?,
        cancelled_by: row.try_get("cancelled_by").map_err(CatalogError::db(OP))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnicloud_metainfo::InfoHash;

    async fn store() -> CatalogStore {
        CatalogStore::open_in_memory().await.expect("open")
    }

    fn sample_torrent(package_id: Uuid, node_id: Uuid) -> TorrentRecord {
        TorrentRecord {
            id: Uuid::new_v4(),
            package_id,
            info_hash: InfoHash([0x42; 20]),
            piece_size: 262_144,
            pieces_count: 9,
            file_count: 2,
            total_bytes: 2_097_202,
            meta_bytes: vec![1, 2, 3],
            created_by_node: node_id,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn first_claim_is_granted_second_denied() {
        let store = store().await;
        let package_id = Uuid::new_v4();
        let winner = Uuid::new_v4();
        let loser = Uuid::new_v4();

        assert_eq!(
            store.claim_decision(package_id, winner).await.expect("first"),
            ClaimDecision::Granted
        );
        assert_eq!(
            store.claim_decision(package_id, loser).await.expect("second"),
            ClaimDecision::Denied { holder: winner }
        );
        // The holder itself may re-request after a crash.
        assert_eq!(
            store.claim_decision(package_id, winner).await.expect("resume"),
            ClaimDecision::Granted
        );
    }

    #[tokio::test]
    async fn claim_after_torrent_exists_reports_torrent() {
        let store = store().await;
        let package_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();
        store
            .commit_generated_torrent(&sample_torrent(package_id, node_id))
            .await
            .expect("commit");
        assert_eq!(
            store
                .claim_decision(package_id, Uuid::new_v4())
                .await
                .expect("decision"),
            ClaimDecision::TorrentExists
        );
    }

    #[tokio::test]
    async fn commit_releases_claim_and_completes_queue() {
        let store = store().await;
        let package_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();

        store
            .upsert_queue_item(package_id, node_id, 2_097_202)
            .await
            .expect("enqueue");
        assert_eq!(
            store.claim_decision(package_id, node_id).await.expect("claim"),
            ClaimDecision::Granted
        );
        store
            .set_queue_status(package_id, node_id, QueueStatus::Generating, None, None)
            .await
            .expect("generating");

        store
            .commit_generated_torrent(&sample_torrent(package_id, node_id))
            .await
            .expect("commit");

        let item = store
            .queue_item(package_id, node_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(item.status, QueueStatus::Completed);
        assert!((item.progress_pct - 100.0).abs() < f64::EPSILON);

        // Another node asking now sees the torrent, not a free claim.
        assert_eq!(
            store
                .claim_decision(package_id, Uuid::new_v4())
                .await
                .expect("decision"),
            ClaimDecision::TorrentExists
        );
    }

    #[tokio::test]
    async fn failure_releases_the_claim() {
        let store = store().await;
        let package_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();
        let other = Uuid::new_v4();

        assert_eq!(
            store.claim_decision(package_id, node_id).await.expect("claim"),
            ClaimDecision::Granted
        );
        store
            .release_claim(package_id, node_id)
            .await
            .expect("release");
        assert_eq!(
            store.claim_decision(package_id, other).await.expect("claim"),
            ClaimDecision::Granted,
            "released claims are immediately available"
        );
    }

    #[tokio::test]
    async fn checkpoint_prefix_is_contiguous() {
        let store = store().await;
        let package_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();

        store.record(package_id, node_id, 0, [0u8; 20]).await.expect("record");
        store.record(package_id, node_id, 1, [1u8; 20]).await.expect("record");
        // A gap: piece 3 without piece 2.
        store.record(package_id, node_id, 3, [3u8; 20]).await.expect("record");

        let prefix = store.load_prefix(package_id, node_id).await.expect("load");
        assert_eq!(prefix.len(), 2, "the prefix stops at the first gap");
        assert_eq!(prefix[1], [1u8; 20]);

        store.clear(package_id, node_id).await.expect("clear");
        assert!(store.load_prefix(package_id, node_id).await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn queue_progress_refreshes_sync_time() {
        let store = store().await;
        let package_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();
        store
            .upsert_queue_item(package_id, node_id, 100)
            .await
            .expect("enqueue");
        store
            .update_queue_progress(package_id, node_id, 55.5, "VIDEO.mxf", 1_000_000)
            .await
            .expect("progress");
        let item = store
            .queue_item(package_id, node_id)
            .await
            .expect("get")
            .expect("exists");
        assert!(item.synced_at.is_some());
        assert_eq!(item.current_file.as_deref(), Some("VIDEO.mxf"));
        assert!((item.progress_pct - 55.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn sweep_ignores_fresh_claims() {
        let store = store().await;
        let package_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();
        assert_eq!(
            store.claim_decision(package_id, node_id).await.expect("claim"),
            ClaimDecision::Granted
        );
        assert_eq!(store.sweep_stale_claims().await.expect("sweep"), 0);
    }
}
