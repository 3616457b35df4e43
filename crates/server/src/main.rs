use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use conversation_transport::TokenConfig;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use server_api::ApiContext;
use shared::{
    domain::{ChatMessage, ConversationId, MessageId},
    error::{ApiError, ErrorCode},
    protocol::{
        AppendMessageRequest, AppendMessageResponse, ConversationSummary,
        CreateGroupConversationRequest, ListMessagesQuery, LoginRequest, LoginResponse,
        MarkReadRequest, MarkReadResponse, OpenDirectConversationRequest, ReceiptsRequest,
        ReceiptsResponse, ServerEvent, TransportTokenRequest, TransportTokenResponse,
        TypingRequest,
    },
};
use storage::Storage;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

mod app_state;
mod auth;
mod config;
mod hub;

use app_state::AppState;
use auth::{AuthConfig, AuthUser};
use config::{load_settings, prepare_database_url};
use hub::NotificationHub;

const MAX_REQUEST_BYTES: usize = 256 * 1024;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext {
        storage,
        transport: TokenConfig {
            api_key: settings.transport_api_key,
            api_secret: settings.transport_api_secret,
            ttl_seconds: settings.transport_ttl_seconds,
        },
    };
    let auth = AuthConfig {
        secret: settings.auth_secret,
        ttl_seconds: settings.auth_ttl_seconds,
    };

    let state = AppState {
        api,
        auth,
        hub: NotificationHub::default(),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/conversations", get(http_list_conversations))
        .route("/conversations/direct", post(http_open_direct))
        .route("/conversations/group", post(http_create_group))
        .route(
            "/conversations/:conversation_id/messages",
            get(http_list_messages),
        )
        .route("/messages", post(http_append_message))
        .route("/messages/:message_id", delete(http_delete_message))
        .route("/messages/read", post(http_mark_read))
        .route("/messages/receipts", post(http_receipts))
        .route("/messages/typing", post(http_typing))
        .route("/transport/token", post(http_transport_token))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    if matches!(err.code, ErrorCode::Internal) {
        error!(message = %err.message, "request failed");
    }
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.api.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(error) => {
            warn!(%error, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable")
        }
    }
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<LoginResponse> {
    let user_id = server_api::login(&state.api, &req.username)
        .await
        .map_err(reject)?;
    let username = req.username.trim().to_string();
    let token = state
        .auth
        .issue(user_id, &username)
        .map_err(|e| reject(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    info!(user_id = user_id.0, "login");
    Ok(Json(LoginResponse {
        user_id,
        username,
        token,
    }))
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> ApiResult<Vec<ConversationSummary>> {
    let conversations = server_api::list_conversations(&state.api, user.user_id)
        .await
        .map_err(reject)?;
    Ok(Json(conversations))
}

async fn http_open_direct(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<OpenDirectConversationRequest>,
) -> ApiResult<ConversationSummary> {
    let conversation =
        server_api::open_direct_conversation(&state.api, user.user_id, req.other_user_id)
            .await
            .map_err(reject)?;
    Ok(Json(conversation))
}

async fn http_create_group(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateGroupConversationRequest>,
) -> ApiResult<ConversationSummary> {
    let conversation = server_api::create_group_conversation(&state.api, user.user_id, &req)
        .await
        .map_err(reject)?;
    Ok(Json(conversation))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(conversation_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> ApiResult<Vec<ChatMessage>> {
    let messages = server_api::list_messages(
        &state.api,
        user.user_id,
        ConversationId(conversation_id),
        q.limit,
        q.before,
    )
    .await
    .map_err(reject)?;
    Ok(Json(messages))
}

async fn http_append_message(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<AppendMessageRequest>,
) -> ApiResult<AppendMessageResponse> {
    let (outcome, notifications) = server_api::append_message(&state.api, user.user_id, &req)
        .await
        .map_err(reject)?;
    state.hub.dispatch(notifications);
    Ok(Json(AppendMessageResponse { outcome }))
}

async fn http_delete_message(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(message_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    server_api::delete_message(&state.api, user.user_id, &MessageId(message_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<MarkReadRequest>,
) -> ApiResult<MarkReadResponse> {
    let (read_count, notifications) =
        server_api::mark_read(&state.api, user.user_id, &req.message_ids, req.conversation_id)
            .await
            .map_err(reject)?;
    state.hub.dispatch(notifications);
    Ok(Json(MarkReadResponse { read_count }))
}

async fn http_receipts(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<ReceiptsRequest>,
) -> ApiResult<ReceiptsResponse> {
    let receipts = server_api::receipts(&state.api, user.user_id, &req.message_ids)
        .await
        .map_err(reject)?;
    Ok(Json(ReceiptsResponse { receipts }))
}

async fn http_typing(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<TypingRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let notifications =
        server_api::typing(&state.api, user.user_id, req.conversation_id, req.is_typing)
            .await
            .map_err(reject)?;
    state.hub.dispatch(notifications);
    Ok(StatusCode::NO_CONTENT)
}

async fn http_transport_token(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<TransportTokenRequest>,
) -> ApiResult<TransportTokenResponse> {
    let token = server_api::transport_token(&state.api, user.user_id, req.conversation_id)
        .await
        .map_err(reject)?;
    Ok(Json(token))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    let verified = match q.token.as_deref() {
        Some(token) => state
            .auth
            .verify(token)
            .map_err(|err| format!("invalid token: {err}")),
        None => Err("missing token".to_string()),
    };
    ws.on_upgrade(move |socket| async move {
        match verified {
            Ok(user) => ws_connection(state, socket, user).await,
            Err(reason) => reject_socket(socket, reason).await,
        }
    })
}

/// Closes an unauthenticated hub socket with the policy-violation code so
/// the client knows not to retry.
async fn reject_socket(mut socket: WebSocket, reason: String) {
    warn!(%reason, "hub: rejecting websocket");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.into(),
        })))
        .await;
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user: AuthUser) {
    let user_id = user.user_id;
    let (mut sender, mut receiver) = socket.split();
    let registration = state.hub.register(user_id);
    let session_id = registration.session_id;
    info!(user_id = user_id.0, username = %user.username, session_id, "hub: session opened");

    let mut events = UnboundedReceiverStream::new(registration.events);
    let send_task = tokio::spawn(async move {
        if let Ok(text) = serde_json::to_string(&ServerEvent::Connected { user_id }) {
            if sender.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        while let Some(event) = events.next().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        if let Message::Close(_) = msg {
            break;
        }
    }

    send_task.abort();
    state.hub.unregister(user_id, session_id);
    info!(user_id = user_id.0, session_id, "hub: session closed");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/sync_flow_tests.rs"]
mod sync_flow_tests;
