use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use server_api::{list_chat_users, list_conversation, register_user, send_message, ApiContext};
use shared::{
    domain::{UserId, UserSummary},
    error::{ApiError, ErrorCode},
    protocol::{ImageUploadResponse, MessageDraft, MessagePayload, ServerEvent},
};
use storage::Storage;
use tokio::sync::broadcast;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

mod config;
mod upload;

use config::{load_settings, prepare_database_url};
use upload::stage_image;

/// Transport-level ceiling, above the gate's own 5 MiB check so oversized
/// uploads reach the gate and get a clean rejection.
const MAX_UPLOAD_HTTP_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    events: broadcast::Sender<ServerEvent>,
    upload_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: i64,
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
    let upload_dir = PathBuf::from(&settings.upload_dir);
    std::fs::create_dir_all(&upload_dir)?;

    let api = ApiContext { storage };
    let (events, _) = broadcast::channel(256);

    let state = AppState {
        api,
        events,
        upload_dir,
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
        .route("/messages/users", get(http_list_users))
        .route("/messages/:user_id", get(http_get_conversation))
        .route("/messages/send/:user_id", post(http_send_message))
        .route("/uploads/image", post(upload_image))
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_HTTP_BYTES))
        .layer(RequestBodyLimitLayer::new(MAX_UPLOAD_HTTP_BYTES))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn api_error_response(error: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match error.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ApiError>)> {
    let user_id = register_user(&state.api, &req.username, req.display_name.as_deref())
        .await
        .map_err(api_error_response)?;
    Ok(Json(LoginResponse { user_id: user_id.0 }))
}

async fn http_list_users(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<UserSummary>>, (StatusCode, Json<ApiError>)> {
    let users = list_chat_users(&state.api, UserId(q.user_id))
        .await
        .map_err(api_error_response)?;
    Ok(Json(users))
}

async fn http_get_conversation(
    State(state): State<Arc<AppState>>,
    Path(other_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<MessagePayload>>, (StatusCode, Json<ApiError>)> {
    let messages = list_conversation(&state.api, UserId(q.user_id), UserId(other_id))
        .await
        .map_err(api_error_response)?;
    Ok(Json(messages))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Path(recipient_id): Path<i64>,
    Query(q): Query<UserQuery>,
    Json(draft): Json<MessageDraft>,
) -> Result<Json<MessagePayload>, (StatusCode, Json<ApiError>)> {
    let event = send_message(&state.api, UserId(q.user_id), UserId(recipient_id), &draft)
        .await
        .map_err(api_error_response)?;
    let ServerEvent::NewMessage(message) = event else {
        return Err(api_error_response(ApiError::new(
            ErrorCode::Internal,
            "unexpected event from send_message",
        )));
    };
    let _ = state.events.send(ServerEvent::NewMessage(message.clone()));
    Ok(Json(message))
}

async fn upload_image(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<ImageUploadResponse>, (StatusCode, Json<ApiError>)> {
    let staged_name = stage_image(&state.upload_dir, &mut multipart)
        .await
        .map_err(|e| (e.status(), Json(e.api_error())))?;
    Ok(Json(ImageUploadResponse {
        image_url: format!("/uploads/{staged_name}"),
    }))
}

/// A connection only sees `newMessage` events addressed to its user.
fn event_is_for_user(event: &ServerEvent, user_id: UserId) -> bool {
    match event {
        ServerEvent::NewMessage(message) => message.recipient_id == user_id,
        ServerEvent::Error(_) => false,
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket, UserId(q.user_id)))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    user_id: UserId,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();

    let send_task = tokio::spawn(async move {
        while let Ok(event) = events_rx.recv().await {
            if !event_is_for_user(&event, user_id) {
                continue;
            }
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}
