//! Transfer assignments: creation, dispatcher queries, guarded progress
//! reporting, and operator commands.

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CatalogError, CatalogResult};
use crate::model::{NewTransfer, PendingCommand, TransferPatch, TransferRecord, TransferStatus};
use crate::store::{CatalogStore, parse_uuid_opt, uuid_column};

const INSERT_TRANSFER_SQL: &str = r"
    INSERT INTO transfers (
        id, torrent_id, source_node, dest_node, status, priority, delete_data, created_at
    )
    VALUES ($1, $2, $3, $4, 'queued', $5, $6, $7)
";
const SELECT_TRANSFER_SQL: &str = r"SELECT * FROM transfers WHERE id = $1";
const SELECT_PENDING_SQL: &str = r"
    SELECT * FROM transfers
    WHERE dest_node = $1 AND status IN ('queued', 'downloading')
    ORDER BY priority ASC, created_at ASC
";
const SELECT_TRANSFERS_SQL: &str = r"
    SELECT * FROM transfers
    WHERE ($1 IS NULL OR status = $1) AND ($2 IS NULL OR dest_node = $2)
    ORDER BY created_at DESC
";
const UPDATE_PROGRESS_SQL: &str = r"
    UPDATE transfers
    SET status = $2,
        progress_pct = COALESCE($3, progress_pct),
        bytes_done = COALESCE($4, bytes_done),
        dl_bps = COALESCE($5, dl_bps),
        ul_bps = COALESCE($6, ul_bps),
        peers = COALESCE($7, peers),
        eta_s = COALESCE($8, eta_s),
        error = COALESCE($9, error),
        command_ack = COALESCE($10, command_ack),
        started_at = COALESCE(started_at, $11),
        completed_at = COALESCE(completed_at, $12)
    WHERE id = $1
";
const SET_COMMAND_SQL: &str = r"
    UPDATE transfers SET pending_cmd = $2, command_ack = 0 WHERE id = $1
";
const SET_DELETE_DATA_SQL: &str = r"UPDATE transfers SET delete_data = 1 WHERE id = $1";

impl CatalogStore {
    /// Create a transfer assignment in `queued` state.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert or read-back fails.
    pub async fn create_transfer(&self, new: &NewTransfer) -> CatalogResult<TransferRecord> {
        let id = Uuid::new_v4();
        sqlx::query(INSERT_TRANSFER_SQL)
            .bind(id.to_string())
            .bind(new.torrent_id.to_string())
            .bind(new.source_node.map(|node| node.to_string()))
            .bind(new.dest_node.to_string())
            .bind(new.priority.clamp(0, 9))
            .bind(new.delete_data)
            .bind(Utc::now())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("transfers.create"))?;
        info!(transfer_id = %id, dest_node = %new.dest_node, "transfer created");
        self.transfer(id).await?.ok_or(CatalogError::NotFound {
            entity: "transfer",
            id: id.to_string(),
        })
    }

    /// Fetch a transfer by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn transfer(&self, id: Uuid) -> CatalogResult<Option<TransferRecord>> {
        let row = sqlx::query(SELECT_TRANSFER_SQL)
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(CatalogError::db("transfers.get"))?;
        row.as_ref().map(map_transfer_row).transpose()
    }

    /// Transfers a destination node should be working on, most urgent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn pending_transfers_for(&self, dest_node: Uuid) -> CatalogResult<Vec<TransferRecord>> {
        let rows = sqlx::query(SELECT_PENDING_SQL)
            .bind(dest_node.to_string())
            .fetch_all(self.pool())
            .await
            .map_err(CatalogError::db("transfers.pending"))?;
        rows.iter().map(map_transfer_row).collect()
    }

    /// List transfers with optional status and destination filters.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_transfers(
        &self,
        status: Option<TransferStatus>,
        dest_node: Option<Uuid>,
    ) -> CatalogResult<Vec<TransferRecord>> {
        let rows = sqlx::query(SELECT_TRANSFERS_SQL)
            .bind(status.map(TransferStatus::as_str))
            .bind(dest_node.map(|node| node.to_string()))
            .fetch_all(self.pool())
            .await
            .map_err(CatalogError::db("transfers.list"))?;
        rows.iter().map(map_transfer_row).collect()
    }

    /// Apply a per-field progress report.
    ///
    /// Status changes are validated against the transition table; a report
    /// that only carries metrics against a terminal transfer is dropped
    /// silently (a late message from a finished attempt), never an error.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidTransition`] when the requested status
    /// change violates the table, [`CatalogError::NotFound`] for an unknown
    /// transfer, or a database error.
    pub async fn report_transfer_progress(
        &self,
        id: Uuid,
        patch: &TransferPatch,
    ) -> CatalogResult<TransferRecord> {
        let current = self.transfer(id).await?.ok_or(CatalogError::NotFound {
            entity: "transfer",
            id: id.to_string(),
        })?;

        let next_status = match patch.status {
            Some(next) if next != current.status => {
                if !current.status.can_transition_to(next) {
                    return Err(CatalogError::InvalidTransition {
                        transfer_id: id,
                        from: current.status.as_str(),
                        to: next.as_str(),
                    });
                }
                next
            }
            _ => {
                if current.status.is_terminal() && patch.status.is_none() {
                    debug!(transfer_id = %id, "dropping late progress for terminal transfer");
                    return Ok(current);
                }
                current.status
            }
        };

        let now = Utc::now();
        let started_at = (next_status == TransferStatus::Downloading).then_some(now);
        let completed_at = matches!(
            next_status,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
        .then_some(now);

        sqlx::query(UPDATE_PROGRESS_SQL)
            .bind(id.to_string())
            .bind(next_status.as_str())
            .bind(patch.progress_pct)
            .bind(patch.bytes_done)
            .bind(patch.dl_bps)
            .bind(patch.ul_bps)
            .bind(patch.peers)
            .bind(patch.eta_s)
            .bind(patch.error.as_deref())
            .bind(patch.command_ack)
            .bind(started_at)
            .bind(completed_at)
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("transfers.progress"))?;

        self.transfer(id).await?.ok_or(CatalogError::NotFound {
            entity: "transfer",
            id: id.to_string(),
        })
    }

    /// Record an operator command for the destination site to act on. The
    /// command is considered delivered once the site toggles `command_ack`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails or the transfer does not exist.
    pub async fn set_pending_command(
        &self,
        id: Uuid,
        command: PendingCommand,
    ) -> CatalogResult<()> {
        let result = sqlx::query(SET_COMMAND_SQL)
            .bind(id.to_string())
            .bind(command.as_str())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("transfers.set_command"))?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound {
                entity: "transfer",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Flag a transfer so its downloaded data is removed on cancellation.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn mark_transfer_delete_data(&self, id: Uuid) -> CatalogResult<()> {
        sqlx::query(SET_DELETE_DATA_SQL)
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("transfers.delete_data"))?;
        Ok(())
    }
}

fn map_transfer_row(row: &SqliteRow) -> CatalogResult<TransferRecord> {
    const OP: &str = "transfers.map_row";
    let status_raw: String = row.try_get("status").map_err(CatalogError::db(OP))?;
    let pending_raw: String = row.try_get("pending_cmd").map_err(CatalogError::db(OP))?;
    let source_raw: Option<String> = row.try_get("source_node").map_err(CatalogError::db(OP))?;
    Ok(TransferRecord {
        id: uuid_column(row, OP, "id")?,
        torrent_id: uuid_column(row, OP, "torrent_id")?,
        source_node: parse_uuid_opt(OP, "source_node", source_raw)?,
        dest_node: uuid_column(row, OP, "dest_node")?,
        status: TransferStatus::parse(&status_raw),
        priority: row.try_get("priority").map_err(CatalogError::db(OP))?,
        progress_pct: row.try_get("progress_pct").map_err(CatalogError::db(OP))?,
        bytes_done: row.try_get("bytes_done").map_err(CatalogError::db(OP))?,
        dl_bps: row.try_get("dl_bps").map_err(CatalogError::db(OP))?,
        ul_bps: row.try_get("ul_bps").map_err(CatalogError::db(OP))?,
        peers: row.try_get("peers").map_err(CatalogError::db(OP))?,
        eta_s: row.try_get("eta_s").map_err(CatalogError::db(OP))?,
        error: row.try_get("error").map_err(CatalogError::db(OP))?,
        delete_data: row.try_get("delete_data").map_err(CatalogError::db(OP))?,
        pending_cmd: PendingCommand::parse(&pending_raw),
        command_ack: row.try_get("command_ack").map_err(CatalogError::db(OP))?,
        created_at: row.try_get("created_at").map_err(CatalogError::db(OP))?,
        started_at: row.try_get("started_at").map_err(CatalogError::db(OP))?,
        completed_at: row.try_get("completed_at").map_err(CatalogError::db(OP))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> CatalogStore {
        CatalogStore::open_in_memory().await.expect("open")
    }

    async fn create(store: &CatalogStore, dest: Uuid) -> TransferRecord {
        store
            .create_transfer(&NewTransfer {
                torrent_id: Uuid::new_v4(),
                source_node: None,
                dest_node: dest,
                priority: 5,
                delete_data: false,
            })
            .await
            .expect("create")
    }

    #[tokio::test]
    async fn pending_transfers_order_by_priority_then_age() {
        let store = store().await;
        let dest = Uuid::new_v4();

        let low = store
            .create_transfer(&NewTransfer {
                torrent_id: Uuid::new_v4(),
                source_node: None,
                dest_node: dest,
                priority: 7,
                delete_data: false,
            })
            .await
            .expect("create");
        let urgent = store
            .create_transfer(&NewTransfer {
                torrent_id: Uuid::new_v4(),
                source_node: None,
                dest_node: dest,
                priority: 1,
                delete_data: false,
            })
            .await
            .expect("create");

        let pending = store.pending_transfers_for(dest).await.expect("pending");
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, urgent.id, "lower priority integer first");
        assert_eq!(pending[1].id, low.id);

        // Transfers for another destination do not leak in.
        assert!(
            store
                .pending_transfers_for(Uuid::new_v4())
                .await
                .expect("pending")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn progress_walks_the_status_machine() {
        let store = store().await;
        let transfer = create(&store, Uuid::new_v4()).await;

        let downloading = store
            .report_transfer_progress(
                transfer.id,
                &TransferPatch {
                    status: Some(TransferStatus::Downloading),
                    progress_pct: Some(40.0),
                    bytes_done: Some(838_881),
                    peers: Some(2),
                    ..TransferPatch::default()
                },
            )
            .await
            .expect("downloading");
        assert_eq!(downloading.status, TransferStatus::Downloading);
        assert!(downloading.started_at.is_some());
        assert!((downloading.progress_pct - 40.0).abs() < f64::EPSILON);

        let completed = store
            .report_transfer_progress(
                transfer.id,
                &TransferPatch {
                    status: Some(TransferStatus::Completed),
                    progress_pct: Some(100.0),
                    ..TransferPatch::default()
                },
            )
            .await
            .expect("completed");
        assert_eq!(completed.status, TransferStatus::Completed);
        assert!(completed.completed_at.is_some());
    }

    #[tokio::test]
    async fn terminal_states_are_sticky() {
        let store = store().await;
        let transfer = create(&store, Uuid::new_v4()).await;

        store
            .report_transfer_progress(
                transfer.id,
                &TransferPatch {
                    status: Some(TransferStatus::Cancelled),
                    ..TransferPatch::default()
                },
            )
            .await
            .expect("cancel");

        // A status change out of terminal is rejected.
        let err = store
            .report_transfer_progress(
                transfer.id,
                &TransferPatch {
                    status: Some(TransferStatus::Downloading),
                    ..TransferPatch::default()
                },
            )
            .await
            .expect_err("must reject");
        assert!(matches!(err, CatalogError::InvalidTransition { .. }));

        // A late metrics-only report is dropped without touching the row.
        let unchanged = store
            .report_transfer_progress(
                transfer.id,
                &TransferPatch {
                    progress_pct: Some(99.0),
                    ..TransferPatch::default()
                },
            )
            .await
            .expect("late report");
        assert_eq!(unchanged.status, TransferStatus::Cancelled);
        assert!((unchanged.progress_pct - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn failed_transfers_can_be_requeued() {
        let store = store().await;
        let transfer = create(&store, Uuid::new_v4()).await;

        store
            .report_transfer_progress(
                transfer.id,
                &TransferPatch {
                    status: Some(TransferStatus::Downloading),
                    ..TransferPatch::default()
                },
            )
            .await
            .expect("downloading");
        store
            .report_transfer_progress(
                transfer.id,
                &TransferPatch {
                    status: Some(TransferStatus::Failed),
                    error: Some("peer disconnected".to_string()),
                    ..TransferPatch::default()
                },
            )
            .await
            .expect("failed");

        let requeued = store
            .report_transfer_progress(
                transfer.id,
                &TransferPatch {
                    status: Some(TransferStatus::Queued),
                    ..TransferPatch::default()
                },
            )
            .await
            .expect("requeue");
        assert_eq!(requeued.status, TransferStatus::Queued);
    }

    #[tokio::test]
    async fn pending_command_clears_ack() {
        let store = store().await;
        let transfer = create(&store, Uuid::new_v4()).await;
        assert!(transfer.command_ack, "no command pending initially");

        store
            .set_pending_command(transfer.id, PendingCommand::Cancel)
            .await
            .expect("set command");
        let loaded = store.transfer(transfer.id).await.expect("get").expect("exists");
        assert_eq!(loaded.pending_cmd, PendingCommand::Cancel);
        assert!(!loaded.command_ack);

        store
            .report_transfer_progress(
                transfer.id,
                &TransferPatch {
                    status: Some(TransferStatus::Cancelled),
                    command_ack: Some(true),
                    ..TransferPatch::default()
                },
            )
            .await
            .expect("ack");
        let acked = store.transfer(transfer.id).await.expect("get").expect("exists");
        assert!(acked.command_ack);
    }

    #[tokio::test]
    async fn unknown_transfer_is_not_found() {
        let store = store().await;
        let err = store
            .report_transfer_progress(Uuid::new_v4(), &TransferPatch::default())
            .await
            .expect_err("must fail");
        assert!(matches!(err, CatalogError::NotFound { .. }));
    }
}
