//! WebSocket handler for client connections.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};

use crate::api::{ApiError, ApiResult, AppState};

use super::registry::RelayRegistry;
use super::types::{ClientMessage, ConnectionId, ServerMessage};

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

/// WebSocket upgrade handler.
///
/// GET /ws
///
/// Browsers do not apply CORS to WebSocket handshakes, so the configured
/// origin allowlist is enforced here as well. Requests without an `Origin`
/// header (non-browser clients) are always admitted.
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let allowed = &state.cors.allowed_origins;
    if !allowed.is_empty() {
        if let Some(origin) = headers.get(header::ORIGIN) {
            let origin = origin.to_str().unwrap_or_default();
            if !allowed.iter().any(|o| o == origin) {
                warn!("refusing websocket handshake from origin {origin}");
                return Err(ApiError::Forbidden(format!("origin {origin} not allowed")));
            }
        }
    }
    let registry = state.registry.clone();
    Ok(ws.on_upgrade(move |socket| handle_connection(socket, registry)))
}

/// Handle one WebSocket connection for its whole lifetime.
async fn handle_connection(socket: WebSocket, registry: Arc<RelayRegistry>) {
    let (mut sender, mut receiver) = socket.split();

    let (conn_id, mut outbound_rx) = registry.connect();

    // Hand the client its connection id so it can recognize itself in
    // peer-joined / current-members frames.
    let connected = ServerMessage::Connected { peer_id: conn_id };
    let json = match serde_json::to_string(&connected) {
        Ok(json) => json,
        Err(e) => {
            warn!("failed to serialize connected frame: {e}");
            registry.disconnect(conn_id);
            return;
        }
    };
    if sender.send(Message::Text(json.into())).await.is_err() {
        warn!("connection {conn_id} dropped before handshake completed");
        registry.disconnect(conn_id);
        return;
    }

    // Writer task: drains the outbound queue and keeps the socket alive.
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping_interval.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                maybe = outbound_rx.recv() => {
                    let Some(msg) = maybe else { break };
                    let json = match serde_json::to_string(&msg) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("failed to serialize frame: {e}");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader loop: one message at a time, run to completion. A malformed
    // frame is logged and skipped, never fatal to the loop.
    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => dispatch(&registry, conn_id, msg),
                Err(e) => {
                    warn!("connection {conn_id} sent malformed frame, ignoring: {e}");
                }
            },
            Ok(Message::Binary(_)) => {
                debug!("connection {conn_id} sent binary frame, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!("connection {conn_id} closed by client");
                break;
            }
            Err(e) => {
                warn!("websocket error on connection {conn_id}: {e}");
                break;
            }
        }
    }

    send_task.abort();
    registry.disconnect(conn_id);
}

/// Route one inbound message.
fn dispatch(registry: &RelayRegistry, conn: ConnectionId, msg: ClientMessage) {
    match msg {
        ClientMessage::RegisterIdentity { user_id } => {
            registry.register_identity(conn, &user_id);
        }
        ClientMessage::InitiateCall(invite) => {
            debug!(
                "call from tutor {} to student {} for session {}",
                invite.tutor_id, invite.student_id, invite.session_id
            );
            let callee = invite.student_id.clone();
            registry.send_to_user(conn, &callee, ServerMessage::IncomingCall(invite));
        }
        ClientMessage::DeclineCall {
            session_id,
            student_id,
            tutor_id,
        } => {
            let target = tutor_id.clone();
            registry.send_to_user(
                conn,
                &target,
                ServerMessage::CallDeclined {
                    session_id,
                    student_id,
                    tutor_id,
                },
            );
        }
        ClientMessage::EndCall {
            session_id,
            student_id,
            tutor_id,
        } => {
            let ended = ServerMessage::CallEnded {
                session_id: session_id.clone(),
            };
            registry.send_to_user(conn, &student_id, ended.clone());
            registry.send_to_user(conn, &tutor_id, ended);
        }
        ClientMessage::JoinRoom { session_id } => {
            registry.join_room(conn, &session_id);
        }
        ClientMessage::Offer(body) => {
            let session_id = body.session_id.clone();
            registry.broadcast_room(conn, &session_id, ServerMessage::Offer(body));
        }
        ClientMessage::Answer(body) => {
            let session_id = body.session_id.clone();
            registry.broadcast_room(conn, &session_id, ServerMessage::Answer(body));
        }
        ClientMessage::IceCandidate(body) => {
            let session_id = body.session_id.clone();
            registry.broadcast_room(conn, &session_id, ServerMessage::IceCandidate(body));
        }
    }
}
