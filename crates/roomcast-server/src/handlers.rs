//! Push channel handlers for the Roomcast server.
//!
//! This module handles the push connection lifecycle: the `Connect`
//! handshake, request frames, and cleanup when the connection drops.

use crate::metrics::{self, ConnectionMetricsGuard};
use crate::socket::WebSocketPeer;
use crate::state::AppState;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
};
use roomcast_core::{ChatError, ConnectionId, Identity, TransportKind};
use roomcast_protocol::{codes, Frame, Version, PROTOCOL_VERSION};
use roomcast_transport::{error_frame, message_frame, Connection, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_push(WebSocketPeer::new(socket, Some(addr)), state))
}

/// Serve one push connection until it closes.
pub async fn serve_push<C: Connection>(mut conn: C, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let remote = conn.remote_addr().unwrap_or_else(|| "local".to_string());

    let (identity, version) = match handshake(&mut conn, &state).await {
        Ok(accepted) => accepted,
        Err(reply) => {
            if let Some(frame) = reply {
                debug!(remote = %remote, frame = ?frame, "Handshake rejected");
                let _ = conn.send(frame).await;
            }
            let _ = conn.close().await;
            return;
        }
    };

    let connection_id = ConnectionId::generate();
    let connected = Frame::Connected {
        connection_id: connection_id.to_string(),
        user_id: identity.user_id.clone(),
        username: identity.username.clone(),
        version,
        heartbeat_ms: state.service.config().heartbeat.probe_interval.as_millis() as u64,
    };
    if conn.send(connected).await.is_err() {
        warn!(connection = %connection_id, "Failed to send Connected frame");
        return;
    }

    info!(
        connection = %connection_id,
        user = %identity.user_id,
        remote = %remote,
        version = %version,
        "Push client connected"
    );

    let mut outbound = state.push.connect(connection_id.clone());

    loop {
        tokio::select! {
            biased;

            // Events and probes queued by the push adapter.
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if conn.send(frame).await.is_err() {
                    break;
                }
            }

            inbound = conn.recv() => {
                match inbound {
                    Ok(Some(frame)) => {
                        let start = Instant::now();
                        let replies = handle_frame(frame, &identity, &connection_id, &state).await;
                        metrics::record_latency(start.elapsed().as_secs_f64());

                        let mut failed = false;
                        for reply in replies {
                            if conn.send(reply).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(TransportError::Protocol(e)) => {
                        debug!(connection = %connection_id, error = %e, "Invalid frame");
                        metrics::record_error("protocol");
                        let reply = Frame::error(0, codes::INVALID_FRAME, e.to_string());
                        if conn.send(reply).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(connection = %connection_id, error = %e, "Push connection failed");
                        break;
                    }
                }
            }
        }
    }

    state.push.disconnect(&connection_id);
    let rooms = state.service.disconnect(&connection_id).await;
    metrics::set_active_rooms(state.service.stats().rooms);
    let _ = conn.close().await;

    info!(connection = %connection_id, rooms = rooms.len(), "Push client disconnected");
}

/// Wait for `Connect`. On rejection, returns the frame to send, if any.
async fn handshake<C: Connection>(
    conn: &mut C,
    state: &AppState,
) -> Result<(Identity, Version), Option<Frame>> {
    let first = tokio::time::timeout(state.config.handshake_timeout(), conn.recv()).await;

    let (version, token) = match first {
        Err(_) => {
            return Err(Some(Frame::error(
                0,
                codes::INVALID_FRAME,
                "Handshake timed out",
            )))
        }
        Ok(Ok(None)) => return Err(None),
        Ok(Err(e)) => return Err(Some(Frame::error(0, codes::INVALID_FRAME, e.to_string()))),
        Ok(Ok(Some(Frame::Connect { version, token }))) => (version, token),
        Ok(Ok(Some(other))) => {
            return Err(Some(Frame::error(
                0,
                codes::INVALID_FRAME,
                format!("Expected connect, got {}", other.frame_type().as_str()),
            )))
        }
    };

    let Some(version) = PROTOCOL_VERSION.negotiate(&version) else {
        return Err(Some(Frame::error(
            0,
            codes::UNSUPPORTED_VERSION,
            format!("Unsupported protocol version {version}"),
        )));
    };

    let identity = state
        .service
        .authenticate(&token)
        .await
        .map_err(|e| Some(error_frame(0, &e)))?;

    Ok((identity, version))
}

/// Handle a decoded request frame, returning the replies in order.
async fn handle_frame(
    frame: Frame,
    identity: &Identity,
    connection_id: &ConnectionId,
    state: &AppState,
) -> Vec<Frame> {
    match frame {
        Frame::Join { id, room_id } => {
            debug!(connection = %connection_id, room = %room_id, "Join request");

            match state
                .service
                .join(identity, &room_id, connection_id.clone(), TransportKind::Push)
                .await
            {
                Ok(outcome) => {
                    metrics::set_active_rooms(state.service.stats().rooms);
                    let mut replies = vec![Frame::Joined {
                        id,
                        room_id,
                        name: outcome.room.name,
                        active_users: outcome.active_users,
                    }];
                    replies.extend(outcome.welcome.as_ref().map(message_frame));
                    replies
                }
                Err(e) => vec![error_frame(id, &e)],
            }
        }

        Frame::Leave { id, room_id } => {
            debug!(connection = %connection_id, room = %room_id, "Leave request");

            if state.service.leave(&room_id, connection_id).await {
                vec![Frame::ack(id)]
            } else {
                vec![error_frame(id, &ChatError::NotAMember(room_id))]
            }
        }

        Frame::Post { id, room_id, text } => {
            match state.service.post(identity, &room_id, &text).await {
                Ok(_) => vec![Frame::ack(id)],
                Err(e) => vec![error_frame(id, &e)],
            }
        }

        Frame::Pong { room_id, .. } => {
            if !state.service.heartbeat(&room_id, connection_id) {
                debug!(connection = %connection_id, room = %room_id, "Pong for a room not joined");
            }
            Vec::new()
        }

        Frame::Connect { .. } => {
            vec![Frame::error(0, codes::INVALID_FRAME, "Already connected")]
        }

        other => {
            warn!(connection = %connection_id, frame_type = ?other.frame_type(), "Unexpected frame type");
            vec![Frame::error(
                0,
                codes::INVALID_FRAME,
                format!("Unexpected frame: {}", other.frame_type().as_str()),
            )]
        }
    }
}
