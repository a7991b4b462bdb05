//! Node identity, authorization, heartbeats, commands, ingestion tracking,
//! and per-node settings.

use chrono::Utc;
use omnicloud_metainfo::InfoHash;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::info;
use uuid::Uuid;

use crate::error::{CatalogError, CatalogResult};
use crate::model::{
    CommandRecord, CommandStatus, IngestionRecord, IngestionStatus, NodeRecord, NodeSettings,
};
use crate::store::{CatalogStore, uuid_column};

const UPSERT_NODE_SQL: &str = r"
    INSERT INTO nodes (
        id, name, display_name, mac, public_endpoint, last_seen, authorized,
        role, version, behind_nat, relay_registered, registration_key_hash
    )
    VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8, 0, 0, $9)
    ON CONFLICT (name, mac) DO UPDATE
    SET last_seen = EXCLUDED.last_seen,
        version = EXCLUDED.version,
        public_endpoint = COALESCE(EXCLUDED.public_endpoint, nodes.public_endpoint)
";

const SELECT_NODE_SQL: &str = r"SELECT * FROM nodes WHERE id = $1";
const SELECT_NODE_BY_NAME_MAC_SQL: &str = r"SELECT * FROM nodes WHERE name = $1 AND mac = $2";
const SELECT_NODES_SQL: &str = r"SELECT * FROM nodes ORDER BY name";
const SELECT_KEY_HASH_SQL: &str = r"SELECT registration_key_hash FROM nodes WHERE id = $1 AND mac = $2";
const AUTHORIZE_NODE_SQL: &str = r"UPDATE nodes SET authorized = 1 WHERE id = $1";
const TOUCH_NODE_SQL: &str = r"
    UPDATE nodes
    SET last_seen = $2,
        version = COALESCE($3, version),
        public_endpoint = COALESCE($4, public_endpoint)
    WHERE id = $1
";
const SET_NAT_SQL: &str = r"UPDATE nodes SET behind_nat = $2 WHERE id = $1";
const SET_RELAY_SQL: &str = r"UPDATE nodes SET relay_registered = $2 WHERE id = $1";

const UPSERT_SETTINGS_SQL: &str = r"
    INSERT INTO node_settings (node_id, api_url, storage_capacity_bytes, library_locations)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (node_id) DO UPDATE
    SET api_url = COALESCE(EXCLUDED.api_url, node_settings.api_url),
        storage_capacity_bytes = COALESCE(EXCLUDED.storage_capacity_bytes, node_settings.storage_capacity_bytes),
        library_locations = EXCLUDED.library_locations
";
const SELECT_SETTINGS_SQL: &str = r"SELECT * FROM node_settings WHERE node_id = $1";

const INSERT_COMMAND_SQL: &str = r"
    INSERT INTO commands (id, target_node, kind, payload_json, status, created_at)
    VALUES ($1, $2, $3, $4, 'pending', $5)
";
const SELECT_PENDING_COMMANDS_SQL: &str = r"
    SELECT * FROM commands
    WHERE target_node = $1 AND status = 'pending'
    ORDER BY created_at
";
const MARK_COMMAND_SQL: &str = r"
    UPDATE commands
    SET status = $2,
        result_msg = COALESCE($3, result_msg),
        acknowledged_at = $4
    WHERE id = $1
";

const UPSERT_INGESTION_SQL: &str = r"
    INSERT INTO ingestion_status (
        node_id, package_id, info_hash, download_path, ingest_path, status,
        verified_at, switched_at, cleaned_at, error
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    ON CONFLICT (node_id, package_id) DO UPDATE
    SET info_hash = EXCLUDED.info_hash,
        download_path = EXCLUDED.download_path,
        ingest_path = COALESCE(EXCLUDED.ingest_path, ingestion_status.ingest_path),
        status = EXCLUDED.status,
        verified_at = COALESCE(EXCLUDED.verified_at, ingestion_status.verified_at),
        switched_at = COALESCE(EXCLUDED.switched_at, ingestion_status.switched_at),
        cleaned_at = COALESCE(EXCLUDED.cleaned_at, ingestion_status.cleaned_at),
        error = EXCLUDED.error
";
const SELECT_INGESTION_SQL: &str =
    r"SELECT * FROM ingestion_status WHERE node_id = $1 AND package_id = $2";
const DELETE_INGESTION_SQL: &str =
    r"DELETE FROM ingestion_status WHERE node_id = $1 AND package_id = $2";

impl CatalogStore {
    /// Register a node, or refresh an existing registration with the same
    /// `(name, mac)` identity. New nodes start unauthorized.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or the follow-up read fails.
    pub async fn register_node(
        &self,
        name: &str,
        mac: &str,
        role: &str,
        version: Option<&str>,
        public_endpoint: Option<&str>,
        registration_key_hash: &str,
    ) -> CatalogResult<NodeRecord> {
        let id = Uuid::new_v4();
        sqlx::query(UPSERT_NODE_SQL)
            .bind(id.to_string())
            .bind(name)
            .bind(Option::<String>::None)
            .bind(mac)
            .bind(public_endpoint)
            .bind(Utc::now())
            .bind(role)
            .bind(version)
            .bind(registration_key_hash)
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("nodes.register"))?;

        let row = sqlx::query(SELECT_NODE_BY_NAME_MAC_SQL)
            .bind(name)
            .bind(mac)
            .fetch_one(self.pool())
            .await
            .map_err(CatalogError::db("nodes.register.readback"))?;
        map_node_row(&row)
    }

    /// Fetch a node by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn node(&self, id: Uuid) -> CatalogResult<Option<NodeRecord>> {
        let row = sqlx::query(SELECT_NODE_SQL)
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(CatalogError::db("nodes.get"))?;
        row.as_ref().map(map_node_row).transpose()
    }

    /// List every registered node, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_nodes(&self) -> CatalogResult<Vec<NodeRecord>> {
        let rows = sqlx::query(SELECT_NODES_SQL)
            .fetch_all(self.pool())
            .await
            .map_err(CatalogError::db("nodes.list"))?;
        rows.iter().map(map_node_row).collect()
    }

    /// Fetch the stored registration-key hash for `(id, mac)`, when the pair
    /// exists. Used by the API and control-plane authenticators.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn registration_key_hash(
        &self,
        id: Uuid,
        mac: &str,
    ) -> CatalogResult<Option<String>> {
        let row = sqlx::query(SELECT_KEY_HASH_SQL)
            .bind(id.to_string())
            .bind(mac)
            .fetch_optional(self.pool())
            .await
            .map_err(CatalogError::db("nodes.key_hash"))?;
        row.map(|row| {
            row.try_get::<String, _>("registration_key_hash")
                .map_err(CatalogError::db("nodes.key_hash.column"))
        })
        .transpose()
    }

    /// Mark a node authorized.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails or the node does not exist.
    pub async fn authorize_node(&self, id: Uuid) -> CatalogResult<()> {
        let result = sqlx::query(AUTHORIZE_NODE_SQL)
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("nodes.authorize"))?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound {
                entity: "node",
                id: id.to_string(),
            });
        }
        info!(node_id = %id, "node authorized");
        Ok(())
    }

    /// Refresh `last_seen`, and optionally version and endpoint, for a node.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn touch_node(
        &self,
        id: Uuid,
        version: Option<&str>,
        public_endpoint: Option<&str>,
    ) -> CatalogResult<()> {
        sqlx::query(TOUCH_NODE_SQL)
            .bind(id.to_string())
            .bind(Utc::now())
            .bind(version)
            .bind(public_endpoint)
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("nodes.touch"))?;
        Ok(())
    }

    /// Record the outcome of a NAT probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_behind_nat(&self, id: Uuid, behind_nat: bool) -> CatalogResult<()> {
        sqlx::query(SET_NAT_SQL)
            .bind(id.to_string())
            .bind(behind_nat)
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("nodes.set_nat"))?;
        Ok(())
    }

    /// Record whether the node holds a relay registration.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_relay_registered(&self, id: Uuid, registered: bool) -> CatalogResult<()> {
        sqlx::query(SET_RELAY_SQL)
            .bind(id.to_string())
            .bind(registered)
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("nodes.set_relay"))?;
        Ok(())
    }

    /// Upsert the node settings shared with the scanner collaborator.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn upsert_node_settings(&self, settings: &NodeSettings) -> CatalogResult<()> {
        sqlx::query(UPSERT_SETTINGS_SQL)
            .bind(settings.node_id.to_string())
            .bind(settings.api_url.as_deref())
            .bind(settings.storage_capacity_bytes)
            .bind(settings.library_locations.to_string())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("nodes.settings.upsert"))?;
        Ok(())
    }

    /// Fetch the settings for a node.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the stored JSON is invalid.
    pub async fn node_settings(&self, node_id: Uuid) -> CatalogResult<Option<NodeSettings>> {
        let row = sqlx::query(SELECT_SETTINGS_SQL)
            .bind(node_id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(CatalogError::db("nodes.settings.get"))?;
        let Some(row) = row else { return Ok(None) };
        let locations_raw: String = row
            .try_get("library_locations")
            .map_err(CatalogError::db("nodes.settings.locations"))?;
        let library_locations =
            serde_json::from_str(&locations_raw).map_err(|_err| CatalogError::Decode {
                operation: "nodes.settings.locations",
                column: "library_locations",
                value: locations_raw,
            })?;
        Ok(Some(NodeSettings {
            node_id,
            api_url: row
                .try_get("api_url")
                .map_err(CatalogError::db("nodes.settings.api_url"))?,
            storage_capacity_bytes: row
                .try_get("storage_capacity_bytes")
                .map_err(CatalogError::db("nodes.settings.capacity"))?,
            library_locations,
        }))
    }

    /// Create a hub-to-site command record in `pending` state.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn create_command(
        &self,
        id: Uuid,
        target_node: Uuid,
        kind: &str,
        payload: &serde_json::Value,
    ) -> CatalogResult<()> {
        sqlx::query(INSERT_COMMAND_SQL)
            .bind(id.to_string())
            .bind(target_node.to_string())
            .bind(kind)
            .bind(payload.to_string())
            .bind(Utc::now())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("commands.create"))?;
        Ok(())
    }

    /// Commands still pending for a node; the legacy poll path consumes
    /// these, while the control channel marks them delivered at send time so
    /// a command is never applied twice.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn pending_commands(&self, target_node: Uuid) -> CatalogResult<Vec<CommandRecord>> {
        let rows = sqlx::query(SELECT_PENDING_COMMANDS_SQL)
            .bind(target_node.to_string())
            .fetch_all(self.pool())
            .await
            .map_err(CatalogError::db("commands.pending"))?;
        rows.iter().map(map_command_row).collect()
    }

    /// Move a command to a new delivery status.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn mark_command(
        &self,
        id: Uuid,
        status: CommandStatus,
        result_msg: Option<&str>,
    ) -> CatalogResult<()> {
        let acknowledged_at = match status {
            CommandStatus::Acknowledged | CommandStatus::Failed => Some(Utc::now()),
            CommandStatus::Pending | CommandStatus::Delivered => None,
        };
        sqlx::query(MARK_COMMAND_SQL)
            .bind(id.to_string())
            .bind(status.as_str())
            .bind(result_msg)
            .bind(acknowledged_at)
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("commands.mark"))?;
        Ok(())
    }

    /// Upsert the ingestion record for a completed download.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn upsert_ingestion(&self, record: &IngestionRecord) -> CatalogResult<()> {
        sqlx::query(UPSERT_INGESTION_SQL)
            .bind(record.node_id.to_string())
            .bind(record.package_id.to_string())
            .bind(record.info_hash.to_hex())
            .bind(&record.download_path)
            .bind(record.ingest_path.as_deref())
            .bind(record.status.as_str())
            .bind(record.verified_at)
            .bind(record.switched_at)
            .bind(record.cleaned_at)
            .bind(record.error.as_deref())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("ingestion.upsert"))?;
        Ok(())
    }

    /// Fetch the ingestion record for `(node, package)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn ingestion(
        &self,
        node_id: Uuid,
        package_id: Uuid,
    ) -> CatalogResult<Option<IngestionRecord>> {
        let row = sqlx::query(SELECT_INGESTION_SQL)
            .bind(node_id.to_string())
            .bind(package_id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(CatalogError::db("ingestion.get"))?;
        row.as_ref().map(map_ingestion_row).transpose()
    }

    /// Delete the ingestion record for `(node, package)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_ingestion(&self, node_id: Uuid, package_id: Uuid) -> CatalogResult<()> {
        sqlx::query(DELETE_INGESTION_SQL)
            .bind(node_id.to_string())
            .bind(package_id.to_string())
            .execute(self.pool())
            .await
            .map_err(CatalogError::db("ingestion.delete"))?;
        Ok(())
    }
}

fn map_node_row(row: &SqliteRow) -> CatalogResult<NodeRecord> {
    const OP: &str = "nodes.map_row";
    Ok(NodeRecord {
        id: uuid_column(row, OP, "id")?,
        name: row.try_get("name").map_err(CatalogError::db(OP))?,
        display_name: row.try_get("display_name").map_err(CatalogError::db(OP))?,
        mac: row.try_get("mac").map_err(CatalogError::db(OP))?,
        public_endpoint: row
            .try_get("public_endpoint")
            .map_err(CatalogError::db(OP))?,
        last_seen: row.try_get("last_seen").map_err(CatalogError::db(OP))?,
        authorized: row.try_get("authorized").map_err(CatalogError::db(OP))?,
        role: row.try_get("role").map_err(CatalogError::db(OP))?,
        version: row.try_get("version").map_err(CatalogError::db(OP))?,
        behind_nat: row.try_get("behind_nat").map_err(CatalogError::db(OP))?,
        relay_registered: row
            .try_get("relay_registered")
            .map_err(CatalogError::db(OP))?,
    })
}

fn map_command_row(row: &SqliteRow) -> CatalogResult<CommandRecord> {
    const OP: &str = "commands.map_row";
    let payload_raw: String = row.try_get("payload_json").map_err(CatalogError::db(OP))?;
    let payload_json = serde_json::from_str(&payload_raw).map_err(|_err| CatalogError::Decode {
        operation: OP,
        column: "payload_json",
        value: payload_raw,
    })?;
    let status_raw: String = row.try_get("status").map_err(CatalogError::db(OP))?;
    Ok(CommandRecord {
        id: uuid_column(row, OP, "id")?,
        target_node: uuid_column(row, OP, "target_node")?,
        kind: row.try_get("kind").map_err(CatalogError::db(OP))?,
        payload_json,
        status: CommandStatus::parse(&status_raw),
        result_msg: row.try_get("result_msg").map_err(CatalogError::db(OP))?,
        created_at: row.try_get("created_at").map_err(CatalogError::db(OP))?,
        acknowledged_at: row
            .try_get("acknowledged_at")
            .map_err(CatalogError::db(OP))?,
    })
}

fn map_ingestion_row(row: &SqliteRow) -> CatalogResult<IngestionRecord> {
    const OP: &str = "ingestion.map_row";
    let hash_raw: String = row.try_get("info_hash").map_err(CatalogError::db(OP))?;
    let info_hash: InfoHash = hash_raw.parse().map_err(|_err| CatalogError::Decode {
        operation: OP,
        column: "info_hash",
        value: hash_raw,
    })?;
    let status_raw: String = row.try_get("status").map_err(CatalogError::db(OP))?;
    Ok(IngestionRecord {
        node_id: uuid_column(row, OP, "node_id")?,
        package_id: uuid_column(row, OP, "package_id")?,
        info_hash,
        download_path: row.try_get("download_path").map_err(CatalogError::db(OP))?,
        ingest_path: row.try_get("ingest_path").map_err(CatalogError::db(OP))?,
        status: IngestionStatus::parse(&status_raw),
        verified_at: row.try_get("verified_at").map_err(CatalogError::db(OP))?,
        switched_at: row.try_get("switched_at").map_err(CatalogError::db(OP))?,
        cleaned_at: row.try_get("cleaned_at").map_err(CatalogError::db(OP))?,
        error: row.try_get("error").map_err(CatalogError::db(OP))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> CatalogStore {
        CatalogStore::open_in_memory().await.expect("open")
    }

    #[tokio::test]
    async fn register_and_authorize_node() {
        let store = store().await;
        let node = store
            .register_node("site-01", "aa:bb:cc:dd:ee:ff", "site", Some("0.1.0"), None, "hash")
            .await
            .expect("register");
        assert!(!node.authorized);

        store.authorize_node(node.id).await.expect("authorize");
        let reloaded = store.node(node.id).await.expect("get").expect("exists");
        assert!(reloaded.authorized);
        assert_eq!(reloaded.mac, "aa:bb:cc:dd:ee:ff");
    }

    #[tokio::test]
    async fn re_registration_keeps_identity() {
        let store = store().await;
        let first = store
            .register_node("site-01", "aa:bb:cc:dd:ee:ff", "site", Some("0.1.0"), None, "hash")
            .await
            .expect("register");
        let second = store
            .register_node(
                "site-01",
                "aa:bb:cc:dd:ee:ff",
                "site",
                Some("0.2.0"),
                Some("198.51.100.7:8080"),
                "hash",
            )
            .await
            .expect("re-register");
        assert_eq!(first.id, second.id, "identity key is (name, mac)");
        assert_eq!(second.version.as_deref(), Some("0.2.0"));
    }

    #[tokio::test]
    async fn key_hash_requires_matching_mac() {
        let store = store().await;
        let node = store
            .register_node("site-01", "aa:bb:cc:dd:ee:ff", "site", None, None, "hash")
            .await
            .expect("register");
        let hit = store
            .registration_key_hash(node.id, "aa:bb:cc:dd:ee:ff")
            .await
            .expect("query");
        assert_eq!(hit.as_deref(), Some("hash"));
        let miss = store
            .registration_key_hash(node.id, "00:00:00:00:00:00")
            .await
            .expect("query");
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn command_lifecycle_moves_through_states() {
        let store = store().await;
        let node = store
            .register_node("site-01", "aa:bb:cc:dd:ee:ff", "site", None, None, "hash")
            .await
            .expect("register");

        let command_id = Uuid::new_v4();
        store
            .create_command(command_id, node.id, "rescan", &json!({}))
            .await
            .expect("create");

        let pending = store.pending_commands(node.id).await.expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, "rescan");

        store
            .mark_command(command_id, CommandStatus::Delivered, None)
            .await
            .expect("delivered");
        assert!(
            store
                .pending_commands(node.id)
                .await
                .expect("pending")
                .is_empty(),
            "delivered commands leave the pending set"
        );

        store
            .mark_command(command_id, CommandStatus::Acknowledged, Some("done"))
            .await
            .expect("acknowledged");
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let store = store().await;
        let node_id = Uuid::new_v4();
        store
            .upsert_node_settings(&NodeSettings {
                node_id,
                api_url: Some("http://site-01:8080".to_string()),
                storage_capacity_bytes: Some(10_000_000_000),
                library_locations: json!([{"path": "/lib", "watch": true}]),
            })
            .await
            .expect("upsert");
        let settings = store
            .node_settings(node_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(settings.api_url.as_deref(), Some("http://site-01:8080"));
        assert_eq!(settings.library_locations[0]["path"], "/lib");
    }

    #[tokio::test]
    async fn ingestion_round_trip() {
        let store = store().await;
        let record = IngestionRecord {
            node_id: Uuid::new_v4(),
            package_id: Uuid::new_v4(),
            info_hash: InfoHash([7u8; 20]),
            download_path: "/tor/downloads/PkgA".to_string(),
            ingest_path: None,
            status: IngestionStatus::Downloaded,
            verified_at: None,
            switched_at: None,
            cleaned_at: None,
            error: None,
        };
        store.upsert_ingestion(&record).await.expect("upsert");
        let loaded = store
            .ingestion(record.node_id, record.package_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.status, IngestionStatus::Downloaded);
        assert_eq!(loaded.info_hash, record.info_hash);

        store
            .delete_ingestion(record.node_id, record.package_id)
            .await
            .expect("delete");
        assert!(
            store
                .ingestion(record.node_id, record.package_id)
                .await
                .expect("get")
                .is_none()
        );
    }
}
