//! Hub-side connection registry and command RPC.
//!
//! Transport glue (the WebSocket upgrade) lives with the API server: it
//! authenticates, calls [`ControlHub::register_connection`], drains the
//! returned receiver into the socket, and feeds every inbound frame to
//! [`ControlHub::handle_frame`]. Everything stateful: one connection per
//! site, correlation, backpressure: lives here and is testable without a
//! socket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use omnicloud_events::ActivityItem;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ControlError, ControlResult};
use crate::frames::{CommandKind, CommandOutcome, Frame, HeartbeatPayload, RequestAction,
    SEND_BUFFER_FRAMES};

/// Default wait for a command response.
pub(crate) const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Callbacks invoked for site-originated frames.
#[async_trait]
pub trait HubHandler: Send + Sync {
    /// A heartbeat arrived from a connected site.
    async fn heartbeat(&self, node_id: Uuid, payload: HeartbeatPayload);

    /// An activity snapshot arrived from a connected site.
    async fn activity(&self, node_id: Uuid, items: Vec<ActivityItem>);

    /// A site's connection attached or replaced an earlier one.
    async fn connected(&self, node_id: Uuid);

    /// A site's connection ended.
    async fn disconnected(&self, node_id: Uuid);
}

struct ConnectionEntry {
    sender: mpsc::Sender<Frame>,
    generation: u64,
}

/// One registered connection; dropping the receiver side (socket glue)
/// detaches the site.
pub struct ControlConnection {
    /// Frames to write to the socket, in order.
    pub outbound: mpsc::Receiver<Frame>,
    node_id: Uuid,
    generation: u64,
    hub: Arc<HubShared>,
}

impl ControlConnection {
    /// Detach this connection, notifying the handler if it is still the
    /// site's live connection. Socket glue calls this when the socket ends.
    pub async fn detach(self) {
        let removed = {
            let mut connections = self.hub.lock_connections();
            match connections.get(&self.node_id) {
                Some(entry) if entry.generation == self.generation => {
                    connections.remove(&self.node_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            info!(node_id = %self.node_id, "control connection detached");
            self.hub.handler.disconnected(self.node_id).await;
        }
    }
}

struct HubShared {
    connections: StdMutex<HashMap<Uuid, ConnectionEntry>>,
    pending: StdMutex<HashMap<Uuid, oneshot::Sender<CommandOutcome>>>,
    handler: Arc<dyn HubHandler>,
    next_generation: std::sync::atomic::AtomicU64,
}

impl HubShared {
    fn lock_connections(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ConnectionEntry>> {
        self.connections
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<Uuid, oneshot::Sender<CommandOutcome>>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// The hub end of the control plane.
#[derive(Clone)]
pub struct ControlHub {
    shared: Arc<HubShared>,
}

impl ControlHub {
    /// Construct a hub with the given frame handler.
    #[must_use]
    pub fn new(handler: Arc<dyn HubHandler>) -> Self {
        Self {
            shared: Arc::new(HubShared {
                connections: StdMutex::new(HashMap::new()),
                pending: StdMutex::new(HashMap::new()),
                handler,
                next_generation: std::sync::atomic::AtomicU64::new(1),
            }),
        }
    }

    /// Register an authenticated site's connection, replacing any prior one.
    /// The prior connection's send channel closes, which makes its socket
    /// glue exit; its in-flight responses are abandoned to their timeouts.
    pub async fn register_connection(&self, node_id: Uuid) -> ControlConnection {
        let (sender, outbound) = mpsc::channel(SEND_BUFFER_FRAMES);
        let generation = self
            .shared
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let replaced = {
            let mut connections = self.shared.lock_connections();
            connections
                .insert(node_id, ConnectionEntry { sender, generation })
                .is_some()
        };
        if replaced {
            info!(node_id = %node_id, "control connection replaced by a newer one");
        }
        self.shared.handler.connected(node_id).await;
        ControlConnection {
            outbound,
            node_id,
            generation,
            hub: Arc::clone(&self.shared),
        }
    }

    /// Nodes with a live connection.
    #[must_use]
    pub fn connected_nodes(&self) -> Vec<Uuid> {
        self.shared.lock_connections().keys().copied().collect()
    }

    /// Whether a node has a live connection.
    #[must_use]
    pub fn is_connected(&self, node_id: Uuid) -> bool {
        self.shared.lock_connections().contains_key(&node_id)
    }

    /// Process one frame read from a site's socket. Replies (pongs) are
    /// queued on the same connection.
    pub async fn handle_frame(&self, node_id: Uuid, frame: Frame) -> ControlResult<()> {
        match frame {
            Frame::Ping { message_id, .. } => {
                self.queue_frame(node_id, Frame::pong(message_id))?;
            }
            Frame::Pong { .. } => {}
            Frame::Heartbeat { payload, .. } => {
                self.shared.handler.heartbeat(node_id, payload).await;
            }
            Frame::Activity { items, .. } => {
                self.shared.handler.activity(node_id, items).await;
            }
            Frame::Response {
                message_id,
                success,
                message,
                error,
                payload,
                ..
            } => {
                let waiter = self.shared.lock_pending().remove(&message_id);
                match waiter {
                    Some(waiter) => {
                        let outcome = CommandOutcome {
                            success,
                            message: if success {
                                message
                            } else {
                                error.unwrap_or(message)
                            },
                            payload,
                        };
                        // A dropped receiver means the caller timed out; the
                        // late response is discarded.
                        let _ = waiter.send(outcome);
                    }
                    None => {
                        warn!(
                            node_id = %node_id,
                            message_id = %message_id,
                            "response with unknown message id dropped"
                        );
                    }
                }
            }
            Frame::Command { .. } | Frame::Request { .. } => {
                return Err(ControlError::Protocol {
                    detail: "sites must not send command or request frames".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Send a command and wait for its correlated response.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotConnected`] without a live connection,
    /// [`ControlError::BufferFull`] on backpressure overflow, or
    /// [`ControlError::Timeout`] if no response arrives in `timeout`
    /// (default 30 s). Timed-out commands are not retried here.
    pub async fn send_command_and_wait(
        &self,
        node_id: Uuid,
        kind: CommandKind,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> ControlResult<CommandOutcome> {
        let message_id = Uuid::new_v4();
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.shared.lock_pending().insert(message_id, waiter_tx);

        let frame = Frame::Command {
            message_id,
            timestamp: Utc::now(),
            kind,
            payload,
        };
        if let Err(err) = self.queue_frame(node_id, frame) {
            self.shared.lock_pending().remove(&message_id);
            return Err(err);
        }

        let wait = timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        match tokio::time::timeout(wait, waiter_rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_closed)) => {
                self.shared.lock_pending().remove(&message_id);
                Err(ControlError::Timeout { message_id })
            }
            Err(_elapsed) => {
                self.shared.lock_pending().remove(&message_id);
                debug!(message_id = %message_id, "command timed out");
                Err(ControlError::Timeout { message_id })
            }
        }
    }

    /// Send an ad-hoc request frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is disconnected or its buffer is full.
    pub fn send_request(&self, node_id: Uuid, action: RequestAction) -> ControlResult<()> {
        self.queue_frame(
            node_id,
            Frame::Request {
                message_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                action,
            },
        )
    }

    /// Queue a frame on a node's connection; overflow drops the connection
    /// so the remote end reconnects.
    fn queue_frame(&self, node_id: Uuid, frame: Frame) -> ControlResult<()> {
        let sender = {
            let connections = self.shared.lock_connections();
            connections
                .get(&node_id)
                .map(|entry| entry.sender.clone())
                .ok_or(ControlError::NotConnected { node_id })?
        };
        match sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_frame)) => {
                warn!(node_id = %node_id, "control send buffer overflow; dropping connection");
                self.shared.lock_connections().remove(&node_id);
                Err(ControlError::BufferFull { node_id })
            }
            Err(mpsc::error::TrySendError::Closed(_frame)) => {
                self.shared.lock_connections().remove(&node_id);
                Err(ControlError::NotConnected { node_id })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        heartbeats: Mutex<Vec<(Uuid, HeartbeatPayload)>>,
        activity: Mutex<Vec<(Uuid, usize)>>,
        connects: Mutex<Vec<Uuid>>,
        disconnects: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl HubHandler for RecordingHandler {
        async fn heartbeat(&self, node_id: Uuid, payload: HeartbeatPayload) {
            self.heartbeats.lock().unwrap().push((node_id, payload));
        }
        async fn activity(&self, node_id: Uuid, items: Vec<ActivityItem>) {
            self.activity.lock().unwrap().push((node_id, items.len()));
        }
        async fn connected(&self, node_id: Uuid) {
            self.connects.lock().unwrap().push(node_id);
        }
        async fn disconnected(&self, node_id: Uuid) {
            self.disconnects.lock().unwrap().push(node_id);
        }
    }

    fn hub() -> (ControlHub, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::default());
        (
            ControlHub::new(Arc::clone(&handler) as Arc<dyn HubHandler>),
            handler,
        )
    }

    #[tokio::test]
    async fn command_response_correlation() {
        let (hub, _handler) = hub();
        let node_id = Uuid::new_v4();
        let mut connection = hub.register_connection(node_id).await;

        let waiter = {
            let hub = hub.clone();
            tokio::spawn(async move {
                hub.send_command_and_wait(
                    node_id,
                    CommandKind::Rescan,
                    serde_json::json!({}),
                    Some(Duration::from_secs(5)),
                )
                .await
            })
        };

        // The site receives the command frame and answers it.
        let frame = connection.outbound.recv().await.expect("command frame");
        let Frame::Command { message_id, kind, .. } = frame else {
            panic!("expected a command frame");
        };
        assert_eq!(kind, CommandKind::Rescan);

        hub.handle_frame(
            node_id,
            Frame::Response {
                message_id,
                response_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                success: true,
                message: "rescan queued".to_string(),
                error: None,
                payload: None,
            },
        )
        .await
        .expect("response handled");

        let outcome = waiter.await.expect("join").expect("outcome");
        assert!(outcome.success);
        assert_eq!(outcome.message, "rescan queued");
    }

    #[tokio::test]
    async fn late_and_unknown_responses_are_dropped() {
        let (hub, _handler) = hub();
        let node_id = Uuid::new_v4();
        let _connection = hub.register_connection(node_id).await;

        // Unknown message id: logged and dropped, never an error.
        hub.handle_frame(
            node_id,
            Frame::Response {
                message_id: Uuid::new_v4(),
                response_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                success: true,
                message: "late".to_string(),
                error: None,
                payload: None,
            },
        )
        .await
        .expect("unknown response dropped");
    }

    #[tokio::test]
    async fn command_times_out_without_a_response() {
        let (hub, _handler) = hub();
        let node_id = Uuid::new_v4();
        let _connection = hub.register_connection(node_id).await;

        let result = hub
            .send_command_and_wait(
                node_id,
                CommandKind::StatusUpdate,
                serde_json::json!({}),
                Some(Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(result, Err(ControlError::Timeout { .. })));
    }

    #[tokio::test]
    async fn new_connection_replaces_the_old_one() {
        let (hub, handler) = hub();
        let node_id = Uuid::new_v4();
        let first = hub.register_connection(node_id).await;
        let _second = hub.register_connection(node_id).await;

        assert_eq!(handler.connects.lock().unwrap().len(), 2);
        assert!(hub.is_connected(node_id));

        // Detaching the stale connection must not unregister the new one.
        first.detach().await;
        assert!(hub.is_connected(node_id));
        assert!(handler.disconnects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn command_to_disconnected_node_fails_fast() {
        let (hub, _handler) = hub();
        let result = hub
            .send_command_and_wait(
                Uuid::new_v4(),
                CommandKind::Restart,
                serde_json::json!({}),
                None,
            )
            .await;
        assert!(matches!(result, Err(ControlError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn ping_gets_a_pong_on_the_same_connection() {
        let (hub, _handler) = hub();
        let node_id = Uuid::new_v4();
        let mut connection = hub.register_connection(node_id).await;

        let ping_id = Uuid::new_v4();
        hub.handle_frame(
            node_id,
            Frame::Ping {
                message_id: ping_id,
                timestamp: Utc::now(),
            },
        )
        .await
        .expect("ping handled");

        let frame = connection.outbound.recv().await.expect("pong frame");
        let Frame::Pong { message_id, .. } = frame else {
            panic!("expected pong");
        };
        assert_eq!(message_id, ping_id);
    }

    #[tokio::test]
    async fn heartbeat_and_activity_reach_the_handler() {
        let (hub, handler) = hub();
        let node_id = Uuid::new_v4();
        let _connection = hub.register_connection(node_id).await;

        hub.handle_frame(
            node_id,
            Frame::Heartbeat {
                message_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                payload: HeartbeatPayload {
                    package_count: Some(3),
                    ..HeartbeatPayload::default()
                },
            },
        )
        .await
        .expect("heartbeat");
        hub.handle_frame(
            node_id,
            Frame::Activity {
                message_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                items: vec![ActivityItem::idle()],
            },
        )
        .await
        .expect("activity");

        assert_eq!(handler.heartbeats.lock().unwrap().len(), 1);
        assert_eq!(handler.activity.lock().unwrap()[0].1, 1);
    }
}
