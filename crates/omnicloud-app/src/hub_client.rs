//! The site's HTTP client for every hub call.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use thiserror::Error;
use uuid::Uuid;

use omnicloud_api_models::{
    ActionDoneRequest, CanonicalXmlPayload, HeartbeatRequest, InventoryUploadRequest,
    InventoryUploadResponse, NatCheckResponse, PendingActionResponse, QueueCheckResponse,
    RegisterRequest, RegisterResponse, SeederRegisterRequest, TorrentCommitRequest,
    TorrentStatusUpload, TransferProgressRequest, TransferView,
};

/// Default request timeout for hub calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Result alias for hub calls.
pub type HubResult<T> = Result<T, HubClientError>;

/// Hub-call error type.
#[derive(Debug, Error)]
pub enum HubClientError {
    /// Transport-level failure; retried by the calling loop with backoff.
    #[error("hub request failed")]
    Transport {
        /// Operation identifier.
        operation: &'static str,
        /// Source reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// The hub answered with a non-success status.
    #[error("hub returned an error status")]
    Status {
        /// Operation identifier.
        operation: &'static str,
        /// The HTTP status.
        status: StatusCode,
        /// Response body, for diagnostics.
        body: String,
    },
}

/// Identity presented on every authenticated call.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    /// Assigned node id.
    pub node_id: Uuid,
    /// MAC address half of the identity key.
    pub mac: String,
    /// Shared registration key (for the control-plane URL).
    pub registration_key: String,
}

/// HTTP client for the hub API.
#[derive(Clone)]
pub struct HubClient {
    client: reqwest::Client,
    base_url: String,
}

impl HubClient {
    /// Construct a client for `base_url` (no trailing slash).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str) -> HubResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|source| HubClientError::Transport {
                operation: "hub.client_build",
                source,
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// The WebSocket control-plane URL for an identity.
    #[must_use]
    pub fn control_ws_url(&self, identity: &NodeIdentity) -> String {
        let ws_base = self
            .base_url
            .replacen("http://", "ws://", 1)
            .replacen("https://", "wss://", 1);
        format!(
            "{ws_base}/ws?server_id={}&mac_address={}&registration_key={}",
            identity.node_id, identity.mac, identity.registration_key
        )
    }

    /// `POST /servers/register`: unauthenticated; carries the shared key.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or rejection.
    pub async fn register(&self, request: &RegisterRequest) -> HubResult<RegisterResponse> {
        self.post_json("hub.register", "/api/v1/servers/register", None, request)
            .await
    }

    /// `POST /servers/{id}/heartbeat`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or rejection.
    pub async fn heartbeat(
        &self,
        identity: &NodeIdentity,
        request: &HeartbeatRequest,
    ) -> HubResult<serde_json::Value> {
        let path = format!("/api/v1/servers/{}/heartbeat", identity.node_id);
        self.post_json("hub.heartbeat", &path, Some(identity), request)
            .await
    }

    /// `GET /servers/{id}/pending-transfers`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or rejection.
    pub async fn pending_transfers(
        &self,
        identity: &NodeIdentity,
    ) -> HubResult<Vec<TransferView>> {
        let path = format!("/api/v1/servers/{}/pending-transfers", identity.node_id);
        self.get_json("hub.pending_transfers", &path, Some(identity))
            .await
    }

    /// `PUT /transfers/{id}`: progress report.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or rejection.
    pub async fn report_progress(
        &self,
        transfer_id: Uuid,
        request: &TransferProgressRequest,
    ) -> HubResult<TransferView> {
        let path = format!("/api/v1/transfers/{transfer_id}");
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .put(url)
            .json(request)
            .send()
            .await
            .map_err(|source| HubClientError::Transport {
                operation: "hub.report_progress",
                source,
            })?;
        Self::decode("hub.report_progress", response).await
    }

    /// `GET /torrents/{info_hash}/file`: the `.torrent` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or rejection.
    pub async fn torrent_file(&self, info_hash: &str) -> HubResult<Vec<u8>> {
        let url = format!("{}/api/v1/torrents/{info_hash}/file", self.base_url);
        let response = self.client.get(url).send().await.map_err(|source| {
            HubClientError::Transport {
                operation: "hub.torrent_file",
                source,
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HubClientError::Status {
                operation: "hub.torrent_file",
                status,
                body,
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|source| HubClientError::Transport {
                operation: "hub.torrent_file",
                source,
            })?;
        Ok(bytes.to_vec())
    }

    /// `GET /torrents/{info_hash}`: torrent detail.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or rejection.
    pub async fn torrent(&self, info_hash: &str) -> HubResult<omnicloud_api_models::TorrentView> {
        let path = format!("/api/v1/torrents/{info_hash}");
        self.get_json("hub.torrent", &path, None).await
    }

    /// `GET /torrent-queue/check`: the hash orchestrator probe.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or rejection.
    pub async fn queue_check(
        &self,
        identity: &NodeIdentity,
        package_id: Uuid,
    ) -> HubResult<QueueCheckResponse> {
        let path = format!("/api/v1/torrent-queue/check?package_id={package_id}");
        self.get_json("hub.queue_check", &path, Some(identity)).await
    }

    /// `POST /torrents`: commit a generated descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or rejection.
    pub async fn commit_torrent(
        &self,
        identity: &NodeIdentity,
        request: &TorrentCommitRequest,
    ) -> HubResult<serde_json::Value> {
        self.post_json("hub.commit_torrent", "/api/v1/torrents", Some(identity), request)
            .await
    }

    /// `POST /servers/{id}/torrent-status`: batched status upload.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or rejection.
    pub async fn upload_status(
        &self,
        identity: &NodeIdentity,
        upload: &TorrentStatusUpload,
    ) -> HubResult<serde_json::Value> {
        let path = format!("/api/v1/servers/{}/torrent-status", identity.node_id);
        self.post_json("hub.upload_status", &path, Some(identity), upload)
            .await
    }

    /// `POST /servers/{id}/inventory`: batched inventory upsert.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or rejection.
    pub async fn upload_inventory(
        &self,
        identity: &NodeIdentity,
        upload: &InventoryUploadRequest,
    ) -> HubResult<InventoryUploadResponse> {
        let path = format!("/api/v1/servers/{}/inventory", identity.node_id);
        self.post_json("hub.upload_inventory", &path, Some(identity), upload)
            .await
    }

    /// `GET /packages/{id}/canonical-xml`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or rejection.
    pub async fn canonical_xml(&self, package_id: Uuid) -> HubResult<CanonicalXmlPayload> {
        let path = format!("/api/v1/packages/{package_id}/canonical-xml");
        self.get_json("hub.canonical_xml", &path, None).await
    }

    /// `POST /packages/{id}/canonical-xml`: the canonical holder uploads.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or rejection.
    pub async fn put_canonical_xml(
        &self,
        package_id: Uuid,
        files: &[(String, Vec<u8>)],
    ) -> HubResult<serde_json::Value> {
        let payload = CanonicalXmlPayload {
            files: files
                .iter()
                .map(|(rel_path, content)| omnicloud_api_models::CanonicalXmlFile {
                    rel_path: rel_path.clone(),
                    content_b64: BASE64.encode(content),
                })
                .collect(),
        };
        let path = format!("/api/v1/packages/{package_id}/canonical-xml");
        self.post_json("hub.put_canonical_xml", &path, None, &payload)
            .await
    }

    /// `POST /torrents/{info_hash}/seeders`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or rejection.
    pub async fn register_seeder(
        &self,
        identity: &NodeIdentity,
        info_hash: &str,
        request: &SeederRegisterRequest,
    ) -> HubResult<serde_json::Value> {
        let path = format!("/api/v1/torrents/{info_hash}/seeders");
        self.post_json("hub.register_seeder", &path, Some(identity), request)
            .await
    }

    /// `GET /servers/{id}/nat-check`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or rejection.
    pub async fn nat_check(
        &self,
        identity: &NodeIdentity,
        port: u16,
    ) -> HubResult<NatCheckResponse> {
        let path = format!("/api/v1/servers/{}/nat-check?port={port}", identity.node_id);
        self.get_json("hub.nat_check", &path, Some(identity)).await
    }

    /// `GET /servers/{id}/pending-action`: legacy command poll.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or rejection.
    pub async fn pending_action(
        &self,
        identity: &NodeIdentity,
    ) -> HubResult<PendingActionResponse> {
        let path = format!("/api/v1/servers/{}/pending-action", identity.node_id);
        self.get_json("hub.pending_action", &path, Some(identity))
            .await
    }

    /// `POST /servers/{id}/action-done`: legacy command acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or rejection.
    pub async fn action_done(
        &self,
        identity: &NodeIdentity,
        request: &ActionDoneRequest,
    ) -> HubResult<serde_json::Value> {
        let path = format!("/api/v1/servers/{}/action-done", identity.node_id);
        self.post_json("hub.action_done", &path, Some(identity), request)
            .await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        identity: Option<&NodeIdentity>,
    ) -> HubResult<T> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.client.get(url);
        if let Some(identity) = identity {
            request = request
                .header("X-Server-ID", identity.node_id.to_string())
                .header("X-MAC-Address", identity.mac.clone());
        }
        let response = request
            .send()
            .await
            .map_err(|source| HubClientError::Transport { operation, source })?;
        Self::decode(operation, response).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        identity: Option<&NodeIdentity>,
        body: &impl serde::Serialize,
    ) -> HubResult<T> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.client.post(url).json(body);
        if let Some(identity) = identity {
            request = request
                .header("X-Server-ID", identity.node_id.to_string())
                .header("X-MAC-Address", identity.mac.clone());
        }
        let response = request
            .send()
            .await
            .map_err(|source| HubClientError::Transport { operation, source })?;
        Self::decode(operation, response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        operation: &'static str,
        response: reqwest::Response,
    ) -> HubResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HubClientError::Status {
                operation,
                status,
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|source| HubClientError::Transport { operation, source })
    }
}
