//! Control-plane WebSocket upgrade and socket glue.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use omnicloud_control::Frame;

use crate::auth::verify_registration_key;
use crate::error::ApiError;
use crate::state::ApiState;

#[derive(Debug, Deserialize)]
pub(crate) struct WsAuthQuery {
    server_id: Uuid,
    mac_address: String,
    registration_key: String,
}

/// `GET /ws`: authenticate, then upgrade into the control plane.
/// Authentication failures answer 401 before any upgrade happens.
pub(crate) async fn control_upgrade(
    State(state): State<ApiState>,
    Query(query): Query<WsAuthQuery>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let node = state
        .catalog
        .node(query.server_id)
        .await?
        .ok_or_else(|| ApiError::unauthorized("unknown node"))?;
    if !node.mac.eq_ignore_ascii_case(&query.mac_address) {
        return Err(ApiError::unauthorized("mac address mismatch"));
    }
    if !node.authorized {
        return Err(ApiError::forbidden("node is not authorized"));
    }
    let stored_hash = state
        .catalog
        .registration_key_hash(query.server_id, &node.mac)
        .await?
        .ok_or_else(|| ApiError::unauthorized("unknown node"))?;
    if !verify_registration_key(&stored_hash, &query.registration_key) {
        return Err(ApiError::unauthorized("registration key rejected"));
    }

    let node_id = query.server_id;
    Ok(upgrade.on_upgrade(move |socket| control_session(state, node_id, socket)))
}

/// Socket glue: one writer draining the hub's per-connection channel, one
/// reader feeding frames back. Per-connection FIFO both ways.
async fn control_session(state: ApiState, node_id: Uuid, socket: WebSocket) {
    info!(node_id = %node_id, "control connection established");
    let mut connection = state.control.register_connection(node_id).await;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            outbound = connection.outbound.recv() => {
                let Some(frame) = outbound else {
                    // Replaced by a newer connection; close this socket.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(node_id = %node_id, error = %err, "frame encoding failed");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                let Some(Ok(message)) = inbound else { break };
                match message {
                    Message::Text(text) => {
                        match Frame::decode(&text) {
                            Ok(frame) => {
                                if let Err(err) = state.control.handle_frame(node_id, frame).await {
                                    warn!(
                                        node_id = %node_id,
                                        error = %err,
                                        "closing control connection on protocol error"
                                    );
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(node_id = %node_id, error = %err, "undecodable control frame");
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {
                        debug!(node_id = %node_id, "ignoring non-text control message");
                    }
                }
            }
        }
    }
    connection.detach().await;
}
