//! Shared application state and the hub's control-plane frame handler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use omnicloud_catalog::CatalogStore;
use omnicloud_control::{ControlHub, HeartbeatPayload, HubHandler};
use omnicloud_events::ActivityItem;
use omnicloud_relay::RelayServer;
use omnicloud_telemetry::Metrics;
use omnicloud_tracker::Tracker;
use tracing::warn;
use uuid::Uuid;

/// Values the router needs beyond the service handles.
#[derive(Clone)]
pub struct ApiConfig {
    /// Shared registration key new sites must present.
    pub registration_key: String,
    /// Software version reported by `/health`.
    pub version: String,
}

/// Shared state behind every handler.
#[derive(Clone)]
pub struct ApiState {
    /// Canonical catalog store.
    pub catalog: CatalogStore,
    /// Tracker swarm state, for `/tracker/live`.
    pub tracker: Arc<Tracker>,
    /// Control-plane hub.
    pub control: ControlHub,
    /// Relay server counters, when the relay is enabled.
    pub relay: Option<Arc<RelayServer>>,
    /// Metrics registry.
    pub metrics: Metrics,
    /// Router configuration values.
    pub config: ApiConfig,
    /// Live activity per node, fed by the control plane.
    pub activity: Arc<ActivityStore>,
}

/// Most recent activity snapshot per connected node.
#[derive(Default)]
pub struct ActivityStore {
    entries: StdMutex<HashMap<Uuid, (DateTime<Utc>, Vec<ActivityItem>)>>,
}

impl ActivityStore {
    /// Replace a node's snapshot.
    pub fn update(&self, node_id: Uuid, items: Vec<ActivityItem>) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.insert(node_id, (Utc::now(), items));
    }

    /// Drop a node's snapshot when it disconnects.
    pub fn remove(&self, node_id: Uuid) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.remove(&node_id);
    }

    /// Copy out every node's snapshot.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<Uuid, (DateTime<Utc>, Vec<ActivityItem>)> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

/// Control-plane callbacks backed by the catalog and the activity store.
pub struct HubHandlerImpl {
    catalog: CatalogStore,
    activity: Arc<ActivityStore>,
    metrics: Metrics,
}

impl HubHandlerImpl {
    /// Construct the handler.
    #[must_use]
    pub fn new(catalog: CatalogStore, activity: Arc<ActivityStore>, metrics: Metrics) -> Self {
        Self {
            catalog,
            activity,
            metrics,
        }
    }
}

#[async_trait]
impl HubHandler for HubHandlerImpl {
    async fn heartbeat(&self, node_id: Uuid, payload: HeartbeatPayload) {
        if let Err(err) = self
            .catalog
            .touch_node(node_id, payload.version.as_deref(), payload.public_ip.as_deref())
            .await
        {
            warn!(node_id = %node_id, error = %err, "heartbeat node update failed");
        }
        let settings = omnicloud_catalog::NodeSettings {
            node_id,
            api_url: payload.api_url,
            storage_capacity_bytes: payload.storage_capacity_bytes,
            library_locations: serde_json::Value::Array(Vec::new()),
        };
        // Only heartbeat-carried fields are refreshed; locations are edited
        // through the settings endpoints.
        if let Ok(Some(existing)) = self.catalog.node_settings(node_id).await {
            let merged = omnicloud_catalog::NodeSettings {
                library_locations: existing.library_locations,
                ..settings
            };
            if let Err(err) = self.catalog.upsert_node_settings(&merged).await {
                warn!(node_id = %node_id, error = %err, "heartbeat settings update failed");
            }
        } else if let Err(err) = self.catalog.upsert_node_settings(&settings).await {
            warn!(node_id = %node_id, error = %err, "heartbeat settings insert failed");
        }
    }

    async fn activity(&self, node_id: Uuid, items: Vec<ActivityItem>) {
        self.activity.update(node_id, items);
    }

    async fn connected(&self, _node_id: Uuid) {
        self.metrics
            .set_control_connections(i64::try_from(self.activity.snapshot().len()).unwrap_or(0));
    }

    async fn disconnected(&self, node_id: Uuid) {
        self.activity.remove(node_id);
    }
}
