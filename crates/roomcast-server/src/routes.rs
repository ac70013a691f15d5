//! HTTP surface: the pull bridge, room management and health.

use crate::config::Config;
use crate::handlers::ws_handler;
use crate::metrics;
use crate::state::AppState;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use roomcast_core::{ChatError, HeartbeatMonitor, NewRoom, RoomInfo, StoredMessage};
use roomcast_transport::{error_code, BridgeSubscription};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));
    let seeded = state.seed_rooms().await?;
    debug!(rooms = seeded, "Startup rooms ready");

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let shutdown = CancellationToken::new();
    let heartbeat = HeartbeatMonitor::new(state.service.clone())
        .with_cancellation(shutdown.child_token())
        .start();

    let app = router(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Roomcast server listening on {}", addr);
    info!("Push endpoint: ws://{}{}", addr, config.transport.push_path);
    info!("Bridge endpoint: http://{}{}", addr, config.transport.bridge_prefix);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await?;

    heartbeat.shutdown().await;
    info!("Roomcast server stopped");
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown requested");
        }
        () = token.cancelled() => {}
    }
    token.cancel();
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let push_path = state.config.transport.push_path.clone();
    let bridge_prefix = state.config.transport.bridge_prefix.clone();

    let bridge = Router::new()
        .route("/rooms/:room_id/join", post(bridge_join))
        .route("/rooms/:room_id/leave", post(bridge_leave))
        .route(
            "/rooms/:room_id/messages",
            post(bridge_post).get(bridge_messages),
        )
        .route("/rooms/:room_id/pong", post(bridge_pong))
        .route("/rooms/:room_id/events", get(bridge_events));

    Router::new()
        .route(&push_path, get(ws_handler))
        .nest(&bridge_prefix, bridge)
        .route("/api/rooms", get(list_rooms).post(create_room))
        .route("/api/rooms/:room_id", delete(delete_room))
        .route("/api/announcements", post(announce))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// A [`ChatError`] as an HTTP response.
#[derive(Debug)]
pub struct ApiError(ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ChatError::RoomNotFound(_) => StatusCode::NOT_FOUND,
            ChatError::RoomFull(_) | ChatError::RoomNameTaken(_) => StatusCode::CONFLICT,
            ChatError::NotAMember(_) => StatusCode::FORBIDDEN,
            ChatError::InvalidRoom(_) | ChatError::InvalidMessage(_) => StatusCode::BAD_REQUEST,
            ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = json!({
            "error": {
                "code": error_code(&self.0),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// The bearer token of a request.
fn credential(headers: &HeaderMap) -> ApiResult<&str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ChatError::Unauthenticated)?;
    Ok(value.strip_prefix("Bearer ").unwrap_or(value).trim())
}

#[derive(Debug, Serialize)]
struct JoinResponse {
    connection_id: String,
    room: RoomInfo,
    active_users: usize,
    is_new_member: bool,
    welcome: Option<StoredMessage>,
}

#[derive(Debug, Deserialize)]
struct PostBody {
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct PongBody {
    connection_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    skip: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    /// For clients that cannot set headers on an event stream.
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateRoomBody {
    name: String,
    description: Option<String>,
    capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct DeleteRoomBody {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnnounceBody {
    text: String,
    room_id: Option<String>,
}

async fn bridge_join(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<JoinResponse>> {
    let outcome = state.bridge.join(credential(&headers)?, &room_id).await?;
    metrics::set_active_rooms(state.service.stats().rooms);
    Ok(Json(JoinResponse {
        connection_id: outcome.record.connection_id.to_string(),
        room: outcome.room,
        active_users: outcome.active_users,
        is_new_member: outcome.is_new_member,
        welcome: outcome.welcome,
    }))
}

async fn bridge_leave(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let left = state.bridge.leave(credential(&headers)?, &room_id).await?;
    Ok(Json(json!({ "left": left })))
}

async fn bridge_post(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PostBody>,
) -> ApiResult<(StatusCode, Json<StoredMessage>)> {
    let message = state
        .bridge
        .post(credential(&headers)?, &room_id, &body.text)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn bridge_messages(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<StoredMessage>>> {
    let messages = state
        .bridge
        .messages(
            credential(&headers)?,
            &room_id,
            query.limit,
            query.skip.unwrap_or(0),
        )
        .await?;
    Ok(Json(messages))
}

async fn bridge_pong(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<PongBody>>,
) -> ApiResult<StatusCode> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    state
        .bridge
        .pong(
            credential(&headers)?,
            &room_id,
            body.connection_id.as_deref(),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn bridge_events(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let token = match query.token.as_deref() {
        Some(token) => token,
        None => credential(&headers)?,
    };
    let subscription = state.bridge.subscribe(token, &room_id).await?;
    Ok(Sse::new(event_stream(subscription)).keep_alive(KeepAlive::default()))
}

/// Frames of a bridge subscription as SSE events, named by frame type.
fn event_stream(
    subscription: BridgeSubscription,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    stream::unfold(subscription, |mut subscription| async move {
        let frame = subscription.recv().await?;
        let event = match frame.to_json() {
            Ok(data) => SseEvent::default()
                .event(frame.frame_type().as_str())
                .data(data),
            Err(e) => {
                warn!(room = %subscription.room_id(), error = %e, "Failed to encode bridge event");
                SseEvent::default().comment("encode error")
            }
        };
        Some((Ok(event), subscription))
    })
}

async fn list_rooms(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_rooms().await?))
}

async fn create_room(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateRoomBody>,
) -> ApiResult<(StatusCode, Json<RoomInfo>)> {
    let creator = state.service.authenticate(credential(&headers)?).await?;
    let info = state
        .service
        .create_room(
            &creator,
            NewRoom {
                name: body.name,
                description: body.description,
                capacity: body.capacity,
            },
        )
        .await?;
    metrics::set_active_rooms(state.service.stats().rooms);
    Ok((StatusCode::CREATED, Json(info)))
}

async fn delete_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<DeleteRoomBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    let user = state.service.authenticate(credential(&headers)?).await?;
    let body = body.map(|Json(body)| body).unwrap_or_default();

    let evicted = state.service.delete_room(&room_id, body.reason).await?;
    metrics::set_active_rooms(state.service.stats().rooms);
    info!(room = %room_id, user = %user.user_id, evicted, "Room deleted over HTTP");
    Ok(Json(json!({ "evicted": evicted })))
}

async fn announce(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AnnounceBody>,
) -> ApiResult<Json<serde_json::Value>> {
    state.service.authenticate(credential(&headers)?).await?;
    let sent = state
        .service
        .announce(&body.text, body.room_id.as_deref())
        .await?;
    Ok(Json(json!({ "sent": sent.len() })))
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.service.stats();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "rooms": stats.rooms,
        "connections": stats.connections,
        "memberships": stats.memberships,
        "push_clients": state.push.client_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use axum::http::HeaderValue;
    use futures_util::StreamExt;
    use roomcast_protocol::{Frame, FrameType, PROTOCOL_VERSION};
    use roomcast_transport::{Connection, WebSocketConnection};

    fn auth(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn test_credential_requires_header() {
        assert!(credential(&HeaderMap::new()).is_err());
        assert_eq!(credential(&auth("abc")).unwrap(), "abc");
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (ChatError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (ChatError::RoomNotFound("r".into()), StatusCode::NOT_FOUND),
            (ChatError::RoomFull("r".into()), StatusCode::CONFLICT),
            (ChatError::NotAMember("r".into()), StatusCode::FORBIDDEN),
            (ChatError::InvalidMessage("empty"), StatusCode::BAD_REQUEST),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn test_bridge_join_post_and_history() {
        let (state, room) = test_state().await;

        let Json(joined) = bridge_join(
            State(state.clone()),
            Path(room.clone()),
            auth("alice-token"),
        )
        .await
        .unwrap();
        assert!(joined.is_new_member);
        assert!(joined.connection_id.starts_with("bridge_u-alice_"));
        assert!(joined.welcome.is_some());

        let (status, Json(message)) = bridge_post(
            State(state.clone()),
            Path(room.clone()),
            auth("alice-token"),
            Json(PostBody {
                text: "  hi there  ".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(message.text, "hi there");

        let Json(history) = bridge_messages(
            State(state.clone()),
            Path(room.clone()),
            Query(HistoryQuery {
                limit: Some(1),
                skip: None,
            }),
            auth("bob-token"),
        )
        .await
        .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, message.id);
    }

    #[tokio::test]
    async fn test_bridge_rejects_missing_token() {
        let (state, room) = test_state().await;
        let err = bridge_join(State(state), Path(room), HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_bridge_pong_requires_membership() {
        let (state, room) = test_state().await;

        let err = bridge_pong(
            State(state.clone()),
            Path(room.clone()),
            auth("alice-token"),
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        bridge_join(State(state.clone()), Path(room.clone()), auth("alice-token"))
            .await
            .unwrap();
        let status = bridge_pong(State(state), Path(room), auth("alice-token"), None)
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_create_list_and_delete_room() {
        let (state, _) = test_state().await;

        let (status, Json(info)) = create_room(
            State(state.clone()),
            auth("bob-token"),
            Json(CreateRoomBody {
                name: "Rustaceans".into(),
                description: Some("Crabs only".into()),
                capacity: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(info.capacity, 10);
        assert_eq!(info.created_by, "u-bob");

        let duplicate = create_room(
            State(state.clone()),
            auth("bob-token"),
            Json(CreateRoomBody {
                name: "rustaceans".into(),
                description: None,
                capacity: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        assert_eq!(state.service.list_rooms().await.unwrap().len(), 2);

        bridge_join(State(state.clone()), Path(info.id.clone()), auth("alice-token"))
            .await
            .unwrap();
        let Json(body) = delete_room(
            State(state.clone()),
            Path(info.id.clone()),
            auth("bob-token"),
            None,
        )
        .await
        .unwrap();
        assert_eq!(body["evicted"], 1);
        assert_eq!(state.service.list_rooms().await.unwrap().len(), 1);

        let gone = delete_room(State(state), Path(info.id), auth("bob-token"), None)
            .await
            .unwrap_err();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_announcement_reaches_bridge_stream() {
        let (state, room) = test_state().await;
        let subscription = state.bridge.subscribe("bob-token", &room).await.unwrap();
        let mut events = Box::pin(event_stream(subscription));

        let Json(body) = announce(
            State(state.clone()),
            auth("alice-token"),
            Json(AnnounceBody {
                text: "Maintenance at noon".into(),
                room_id: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(body["sent"], 1);

        assert!(events.next().await.is_some());
    }

    #[tokio::test]
    async fn test_bridge_stream_ends_when_room_deleted() {
        let (state, room) = test_state().await;
        let subscription = state.bridge.subscribe("bob-token", &room).await.unwrap();
        let mut events = Box::pin(event_stream(subscription));

        state.service.delete_room(&room, None).await.unwrap();

        assert!(events.next().await.is_some());
        let end = tokio::time::timeout(std::time::Duration::from_secs(1), events.next()).await;
        assert!(matches!(end, Ok(None)));
    }

    #[tokio::test]
    async fn test_push_client_end_to_end() {
        let (state, room) = test_state().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        let mut conn = WebSocketConnection::connect(&format!("ws://{addr}/ws"))
            .await
            .unwrap();
        conn.send(Frame::connect(PROTOCOL_VERSION, "alice-token"))
            .await
            .unwrap();
        assert_eq!(
            conn.recv().await.unwrap().unwrap().frame_type(),
            FrameType::Connected
        );

        conn.send(Frame::join(1, &room)).await.unwrap();
        assert_eq!(
            conn.recv().await.unwrap().unwrap().frame_type(),
            FrameType::Joined
        );

        // A bridge post is seen by the push member.
        bridge_join(State(state.clone()), Path(room.clone()), auth("bob-token"))
            .await
            .unwrap();
        state.bridge.post("bob-token", &room, "from the bridge").await.unwrap();
        loop {
            if let Some(Frame::MessagePosted { text, .. }) = conn.recv().await.unwrap() {
                if text == "from the bridge" {
                    break;
                }
            }
        }
        conn.close().await.unwrap();
    }
}
