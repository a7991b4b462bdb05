//! Site-side control client: persistent connection, heartbeats, activity
//! stream, and command execution.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use omnicloud_events::{ActivityItem, Event, EventBus};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ControlError;
use crate::frames::{
    CommandKind, CommandOutcome, Frame, HeartbeatPayload, RequestAction, SEND_BUFFER_FRAMES,
};

/// Initial reconnect delay.
const RECONNECT_BASE: Duration = Duration::from_secs(5);

/// Reconnect delay ceiling.
const RECONNECT_CAP: Duration = Duration::from_secs(60);

/// A connection stable for this long resets the backoff.
const STABLE_AFTER: Duration = Duration::from_secs(60);

/// Read timeout; the hub's keepalive cadence guarantees traffic well inside
/// this window.
const READ_TIMEOUT: Duration = Duration::from_secs(90);

/// Client-side cadences.
#[derive(Debug, Clone)]
pub struct ControlClientConfig {
    /// Fully-formed WebSocket URL including the auth query parameters.
    pub ws_url: String,
    /// Heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Activity snapshot cadence.
    pub activity_interval: Duration,
    /// Keepalive cadence.
    pub ping_interval: Duration,
}

impl ControlClientConfig {
    /// Conventional cadences for a site.
    #[must_use]
    pub fn new(ws_url: String) -> Self {
        Self {
            ws_url,
            heartbeat_interval: Duration::from_secs(30),
            activity_interval: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Pluggable source of activity items; the site registers one per subsystem
/// (engine, queue, transfers, scanner).
#[async_trait]
pub trait ActivityCollector: Send + Sync {
    /// Items to report this tick; empty when the subsystem is idle.
    async fn collect(&self) -> Vec<ActivityItem>;
}

/// Source of the heartbeat status payload.
#[async_trait]
pub trait HeartbeatSource: Send + Sync {
    /// Assemble the current status.
    async fn heartbeat(&self) -> HeartbeatPayload;
}

/// Executes hub commands on the site.
#[async_trait]
pub trait SiteCommandHandler: Send + Sync {
    /// Execute one command and report its outcome.
    async fn handle(&self, kind: CommandKind, payload: serde_json::Value) -> CommandOutcome;
}

/// The persistent control-plane client.
pub struct ControlClient;

impl ControlClient {
    /// Start the connection loop; runs until `cancel` fires.
    pub fn start(
        config: ControlClientConfig,
        heartbeat: Arc<dyn HeartbeatSource>,
        collectors: Vec<Arc<dyn ActivityCollector>>,
        handler: Arc<dyn SiteCommandHandler>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = RECONNECT_BASE;
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let attempt_started = std::time::Instant::now();
                match run_connection(&config, &heartbeat, &collectors, &handler, &events, &cancel)
                    .await
                {
                    Ok(()) => return,
                    Err(err) => {
                        if cancel.is_cancelled() {
                            return;
                        }
                        let _ = events.publish(Event::ControlDisconnected {
                            reason: err.to_string(),
                        });
                        warn!(error = %err, "control connection lost");
                    }
                }
                if attempt_started.elapsed() > STABLE_AFTER {
                    backoff = RECONNECT_BASE;
                }
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(RECONNECT_CAP);
            }
        })
    }
}

async fn run_connection(
    config: &ControlClientConfig,
    heartbeat: &Arc<dyn HeartbeatSource>,
    collectors: &[Arc<dyn ActivityCollector>],
    handler: &Arc<dyn SiteCommandHandler>,
    events: &EventBus,
    cancel: &CancellationToken,
) -> Result<(), ControlError> {
    let (socket, _response) =
        connect_async(config.ws_url.as_str())
            .await
            .map_err(|err| ControlError::Transport {
                operation: "control_client.connect",
                detail: err.to_string(),
            })?;
    info!(url = %config.ws_url, "control channel connected");
    let _ = events.publish(Event::ControlConnected {
        endpoint: config.ws_url.clone(),
    });

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(SEND_BUFFER_FRAMES);

    let mut heartbeat_tick = tokio::time::interval(config.heartbeat_interval);
    let mut activity_tick = tokio::time::interval(config.activity_interval);
    let mut ping_tick = tokio::time::interval(config.ping_interval);
    heartbeat_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    activity_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return Ok(());
            }
            outbound = out_rx.recv() => {
                // Single writer: the channel serializes every producer.
                let Some(frame) = outbound else { return Ok(()) };
                let text = frame.encode()?;
                sink.send(WsMessage::Text(text.into()))
                    .await
                    .map_err(|err| ControlError::Transport {
                        operation: "control_client.send",
                        detail: err.to_string(),
                    })?;
            }
            _ = ping_tick.tick() => {
                queue(&out_tx, Frame::ping())?;
            }
            _ = heartbeat_tick.tick() => {
                let payload = heartbeat.heartbeat().await;
                queue(&out_tx, Frame::Heartbeat {
                    message_id: Uuid::new_v4(),
                    timestamp: Utc::now(),
                    payload,
                })?;
            }
            _ = activity_tick.tick() => {
                let items = assemble_activity(collectors).await;
                queue(&out_tx, Frame::Activity {
                    message_id: Uuid::new_v4(),
                    timestamp: Utc::now(),
                    items,
                })?;
            }
            inbound = tokio::time::timeout(READ_TIMEOUT, stream.next()) => {
                let message = inbound
                    .map_err(|_elapsed| ControlError::Transport {
                        operation: "control_client.read",
                        detail: "read timed out".to_string(),
                    })?
                    .ok_or_else(|| ControlError::Transport {
                        operation: "control_client.read",
                        detail: "connection closed".to_string(),
                    })?
                    .map_err(|err| ControlError::Transport {
                        operation: "control_client.read",
                        detail: err.to_string(),
                    })?;
                match message {
                    WsMessage::Text(text) => {
                        let frame = Frame::decode(&text)?;
                        handle_hub_frame(frame, heartbeat, handler, &out_tx).await?;
                    }
                    WsMessage::Close(_) => {
                        return Err(ControlError::Transport {
                            operation: "control_client.read",
                            detail: "hub closed the connection".to_string(),
                        });
                    }
                    WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_)
                    | WsMessage::Frame(_) => {}
                }
            }
        }
    }
}

fn queue(out_tx: &mpsc::Sender<Frame>, frame: Frame) -> Result<(), ControlError> {
    // Overflow means the writer cannot keep up; drop the connection and let
    // the reconnect loop start fresh.
    out_tx
        .try_send(frame)
        .map_err(|_err| ControlError::Transport {
            operation: "control_client.queue",
            detail: "send buffer overflow".to_string(),
        })
}

async fn handle_hub_frame(
    frame: Frame,
    heartbeat: &Arc<dyn HeartbeatSource>,
    handler: &Arc<dyn SiteCommandHandler>,
    out_tx: &mpsc::Sender<Frame>,
) -> Result<(), ControlError> {
    match frame {
        Frame::Ping { message_id, .. } => queue(out_tx, Frame::pong(message_id)),
        Frame::Pong { .. } => Ok(()),
        Frame::Command {
            message_id,
            kind,
            payload,
            ..
        } => {
            debug!(kind = kind.as_str(), message_id = %message_id, "command received");
            let handler = Arc::clone(handler);
            let out_tx = out_tx.clone();
            // Commands may take a while (content deletion); keep the read
            // loop responsive.
            tokio::spawn(async move {
                let outcome = handler.handle(kind, payload).await;
                let response = Frame::Response {
                    message_id,
                    response_id: Uuid::new_v4(),
                    timestamp: Utc::now(),
                    success: outcome.success,
                    error: (!outcome.success).then(|| outcome.message.clone()),
                    message: outcome.message,
                    payload: outcome.payload,
                };
                if out_tx.send(response).await.is_err() {
                    warn!(message_id = %message_id, "connection gone before command response");
                }
            });
            Ok(())
        }
        Frame::Request {
            message_id, action, ..
        } => match action {
            RequestAction::SendStatus => {
                let payload = heartbeat.heartbeat().await;
                let payload_json =
                    serde_json::to_value(&payload).map_err(|source| ControlError::Frame {
                        operation: "control_client.status_payload",
                        source,
                    })?;
                queue(
                    out_tx,
                    Frame::Response {
                        message_id,
                        response_id: Uuid::new_v4(),
                        timestamp: Utc::now(),
                        success: true,
                        message: "status".to_string(),
                        error: None,
                        payload: Some(payload_json),
                    },
                )
            }
        },
        Frame::Heartbeat { .. } | Frame::Activity { .. } | Frame::Response { .. } => {
            Err(ControlError::Protocol {
                detail: "hub must not send site-originated frames".to_string(),
            })
        }
    }
}

/// Collect, de-duplicate, and fall back to the idle marker so the hub can
/// distinguish "connected and idle" from "stale".
async fn assemble_activity(collectors: &[Arc<dyn ActivityCollector>]) -> Vec<ActivityItem> {
    let mut items: Vec<ActivityItem> = Vec::new();
    for collector in collectors {
        for item in collector.collect().await {
            let duplicate = items
                .iter()
                .any(|existing| existing.dedup_key() == item.dedup_key());
            if !duplicate {
                items.push(item);
            }
        }
    }
    if items.is_empty() {
        items.push(ActivityItem::idle());
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnicloud_events::{ActivityAction, ActivityCategory};

    struct FixedCollector(Vec<ActivityItem>);

    #[async_trait]
    impl ActivityCollector for FixedCollector {
        async fn collect(&self) -> Vec<ActivityItem> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn activity_deduplicates_across_collectors() {
        let item = ActivityItem::new(ActivityCategory::Torrent, ActivityAction::Seeding, "abc");
        let collectors: Vec<Arc<dyn ActivityCollector>> = vec![
            Arc::new(FixedCollector(vec![item.clone()])),
            Arc::new(FixedCollector(vec![
                item.clone(),
                ActivityItem::new(ActivityCategory::Transfer, ActivityAction::Downloading, "t1"),
            ])),
        ];
        let items = assemble_activity(&collectors).await;
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn empty_collectors_emit_the_idle_marker() {
        let collectors: Vec<Arc<dyn ActivityCollector>> = vec![Arc::new(FixedCollector(vec![]))];
        let items = assemble_activity(&collectors).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].category, ActivityCategory::System);
        assert_eq!(items[0].action, ActivityAction::Idle);
    }

    struct EchoHandler;

    #[async_trait]
    impl SiteCommandHandler for EchoHandler {
        async fn handle(&self, kind: CommandKind, _payload: serde_json::Value) -> CommandOutcome {
            CommandOutcome::ok(format!("executed {}", kind.as_str()))
        }
    }

    struct EmptyHeartbeat;

    #[async_trait]
    impl HeartbeatSource for EmptyHeartbeat {
        async fn heartbeat(&self) -> HeartbeatPayload {
            HeartbeatPayload {
                package_count: Some(7),
                ..HeartbeatPayload::default()
            }
        }
    }

    #[tokio::test]
    async fn commands_produce_correlated_responses() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let heartbeat: Arc<dyn HeartbeatSource> = Arc::new(EmptyHeartbeat);
        let handler: Arc<dyn SiteCommandHandler> = Arc::new(EchoHandler);

        let command_id = Uuid::new_v4();
        handle_hub_frame(
            Frame::Command {
                message_id: command_id,
                timestamp: Utc::now(),
                kind: CommandKind::Rescan,
                payload: serde_json::json!({}),
            },
            &heartbeat,
            &handler,
            &out_tx,
        )
        .await
        .expect("command accepted");

        let response = out_rx.recv().await.expect("response frame");
        let Frame::Response {
            message_id,
            success,
            message,
            ..
        } = response
        else {
            panic!("expected response");
        };
        assert_eq!(message_id, command_id, "response echoes the command id");
        assert!(success);
        assert_eq!(message, "executed rescan");
    }

    #[tokio::test]
    async fn status_request_carries_the_heartbeat_payload() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let heartbeat: Arc<dyn HeartbeatSource> = Arc::new(EmptyHeartbeat);
        let handler: Arc<dyn SiteCommandHandler> = Arc::new(EchoHandler);

        handle_hub_frame(
            Frame::Request {
                message_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                action: RequestAction::SendStatus,
            },
            &heartbeat,
            &handler,
            &out_tx,
        )
        .await
        .expect("request accepted");

        let Frame::Response { payload, .. } = out_rx.recv().await.expect("frame") else {
            panic!("expected response");
        };
        assert_eq!(payload.unwrap()["package_count"], 7);
    }

    #[tokio::test]
    async fn hub_sending_site_frames_is_a_protocol_error() {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let heartbeat: Arc<dyn HeartbeatSource> = Arc::new(EmptyHeartbeat);
        let handler: Arc<dyn SiteCommandHandler> = Arc::new(EchoHandler);

        let result = handle_hub_frame(
            Frame::Activity {
                message_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                items: vec![],
            },
            &heartbeat,
            &handler,
            &out_tx,
        )
        .await;
        assert!(matches!(result, Err(ControlError::Protocol { .. })));
    }
}
