use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use codepush_core::{
    ClientId, MAX_PUSH_MESSAGE_BYTES, PushMessage, decode_push_message, encode_push_message,
    validate_client_id, validate_code,
};
use futures::{SinkExt, StreamExt};
use rand::{Rng, distr::Alphanumeric};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{debug, info, warn};

const ACCESS_TOKEN_LEN: usize = 48;
const API_TOKEN_LEN: usize = 32;
const MAX_USERNAME_LEN: usize = 64;
/// bcrypt work factor for stored passwords.
pub const DEFAULT_PASSWORD_COST: u32 = bcrypt::DEFAULT_COST;
const MIN_PASSWORD_COST: u32 = 4;
const MAX_PASSWORD_COST: u32 = 31;

#[derive(Debug, Clone)]
struct Connection {
    serial: u64,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Debug)]
struct User {
    /// bcrypt hash; carries its own salt and cost.
    password_hash: String,
    api_token: String,
}

#[derive(Debug, Default)]
struct RelayState {
    users: HashMap<String, User>,
    /// Access token -> username.
    sessions: HashMap<String, String>,
    /// Username -> live channels by client id.
    clients: HashMap<String, HashMap<ClientId, Connection>>,
    next_serial: u64,
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<RelayState>>,
    password_cost: u32,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self::with_password_cost(DEFAULT_PASSWORD_COST)
    }

    /// State whose new passwords are hashed with `cost`, clamped to what bcrypt accepts.
    #[must_use]
    pub fn with_password_cost(cost: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RelayState::default())),
            password_cost: cost.clamp(MIN_PASSWORD_COST, MAX_PASSWORD_COST),
        }
    }

    /// Client ids with a live channel for `username`, sorted.
    pub async fn connected_clients(&self, username: &str) -> Vec<ClientId> {
        let relay = self.inner.read().await;
        let mut ids = relay
            .clients
            .get(username)
            .map(|clients| clients.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub user_id: String,
    pub api_token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PushRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PushResponse {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct ChannelParams {
    token: Option<String>,
}

/// Request error rendered as `{"detail": ...}`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "detail": self.detail })),
        )
            .into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/healthz", get(healthz_handler))
        .route("/register", post(register_handler))
        .route("/login", post(login_handler))
        .route("/push/{username}", post(push_handler))
        .route("/ws/{device_id}", get(ws_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({"message": "codepush relay is running"}))
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn register_handler(
    State(state): State<AppState>,
    Json(request): Json<Credentials>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let username = request.username.trim();
    if username.is_empty() || username.len() > MAX_USERNAME_LEN {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Invalid username"));
    }
    if request.password.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Password is required"));
    }

    if state.inner.read().await.users.contains_key(username) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Username already registered",
        ));
    }
    let user = User {
        password_hash: hash_password(request.password, state.password_cost).await?,
        api_token: random_token(API_TOKEN_LEN),
    };

    let mut relay = state.inner.write().await;
    if relay.users.contains_key(username) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Username already registered",
        ));
    }
    relay.users.insert(username.to_owned(), user);
    drop(relay);

    info!(username, "user registered");
    Ok(Json(serde_json::json!({"message": "registered"})))
}

async fn login_handler(
    State(state): State<AppState>,
    Json(request): Json<Credentials>,
) -> Result<Json<LoginResponse>, ApiError> {
    let username = request.username.trim();
    let stored = state
        .inner
        .read()
        .await
        .users
        .get(username)
        .map(|user| (user.password_hash.clone(), user.api_token.clone()));

    let api_token = match stored {
        Some((password_hash, api_token))
            if verify_password(request.password, password_hash.clone()).await =>
        {
            api_token
        }
        _ => {
            warn!(username, "login rejected");
            return Err(ApiError::new(
                StatusCode::UNAUTHORIZED,
                "Incorrect username or password",
            ));
        }
    };

    let access_token = random_token(ACCESS_TOKEN_LEN);
    let mut relay = state.inner.write().await;
    relay
        .sessions
        .insert(access_token.clone(), username.to_owned());
    drop(relay);

    info!(username, "user logged in");
    Ok(Json(LoginResponse {
        access_token,
        token_type: "bearer".to_owned(),
        user_id: username.to_owned(),
        api_token,
    }))
}

async fn push_handler(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>, ApiError> {
    let (code, recipients) = {
        let relay = state.inner.read().await;
        if !relay.users.contains_key(&username) {
            warn!(username = %username, "push for unknown user");
            return Err(ApiError::new(StatusCode::FORBIDDEN, "Invalid username"));
        }

        let code = request.code.as_deref().map(str::trim).unwrap_or_default();
        if code.is_empty() {
            return Err(ApiError::new(StatusCode::BAD_REQUEST, "Code is required"));
        }
        validate_code(code)
            .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, err.to_string()))?;

        let clients = relay.clients.get(&username);
        let targeted = request
            .device_id
            .as_deref()
            .and_then(|device_id| clients.and_then(|clients| clients.get(device_id)));
        let recipients = match targeted {
            Some(connection) => vec![connection.tx.clone()],
            None => clients
                .map(|clients| clients.values().map(|conn| conn.tx.clone()).collect())
                .unwrap_or_default(),
        };
        (code.to_owned(), recipients)
    };

    if recipients.is_empty() {
        info!(username = %username, "push with no connected clients");
        return Ok(Json(PushResponse {
            status: "error".to_owned(),
            message: "No connected clients".to_owned(),
        }));
    }

    let frame = encode_push_message(&PushMessage::VerificationCode { code })
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    let delivered = recipients
        .iter()
        .filter(|tx| tx.send(Message::Text(frame.clone().into())).is_ok())
        .count();

    info!(username = %username, delivered, "code pushed");
    Ok(Json(PushResponse {
        status: "success".to_owned(),
        message: format!("Code sent to {delivered} client(s)"),
    }))
}

async fn ws_handler(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<ChannelParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    validate_client_id(&device_id)
        .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, err.to_string()))?;

    let username = {
        let relay = state.inner.read().await;
        params
            .token
            .as_deref()
            .and_then(|token| relay.sessions.get(token))
            .cloned()
    };
    let Some(username) = username else {
        warn!(device_id = %device_id, "channel rejected: invalid token");
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "Invalid token"));
    };

    Ok(ws
        .max_message_size(MAX_PUSH_MESSAGE_BYTES)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_socket(state, username, device_id, socket).await {
                warn!("socket session ended with error: {}", err);
            }
        }))
}

async fn handle_socket(
    state: AppState,
    username: String,
    device_id: ClientId,
    socket: WebSocket,
) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Pongs queued by the read half are only flushed when the write half
    // sends, so an otherwise idle channel still writes a ping periodically.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            let closing = matches!(message, Message::Close(_));
                            if ws_sender.send(message).await.is_err() || closing {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let serial = register_client(&state, &username, &device_id, outbound_tx).await;
    info!(username = %username, device_id = %device_id, "client connected");

    let mut result = Ok(());
    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                result = Err(err.to_string());
                break;
            }
        };

        match message {
            Message::Text(text) => match decode_push_message(text.as_str()) {
                Ok(PushMessage::Ping) => debug!(device_id = %device_id, "ping"),
                Ok(other) => debug!(device_id = %device_id, ?other, "ignoring client message"),
                Err(err) => warn!(device_id = %device_id, "bad frame from client: {}", err),
            },
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    unregister_client(&state, &username, &device_id, serial).await;
    send_task.abort();
    info!(username = %username, device_id = %device_id, "client disconnected");
    result
}

/// Registers a channel, replacing (and closing) any earlier channel with the
/// same client id. Returns the serial identifying this registration.
async fn register_client(
    state: &AppState,
    username: &str,
    device_id: &ClientId,
    tx: mpsc::UnboundedSender<Message>,
) -> u64 {
    let mut relay = state.inner.write().await;
    relay.next_serial += 1;
    let serial = relay.next_serial;
    let replaced = relay
        .clients
        .entry(username.to_owned())
        .or_default()
        .insert(device_id.clone(), Connection { serial, tx });
    drop(relay);

    if let Some(previous) = replaced {
        info!(device_id = %device_id, "replacing earlier channel");
        let _ = previous.tx.send(Message::Close(None));
    }
    serial
}

async fn unregister_client(state: &AppState, username: &str, device_id: &ClientId, serial: u64) {
    let mut relay = state.inner.write().await;
    let Some(clients) = relay.clients.get_mut(username) else {
        return;
    };
    if clients
        .get(device_id)
        .is_some_and(|connection| connection.serial == serial)
    {
        clients.remove(device_id);
    }
    if clients.is_empty() {
        relay.clients.remove(username);
    }
}

/// Salted bcrypt hash, computed on the blocking pool.
async fn hash_password(password: String, cost: u32) -> Result<String, ApiError> {
    let hashed = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|err| err.to_string())
        .and_then(|result| result.map_err(|err| err.to_string()));
    hashed.map_err(|err| {
        warn!("password hashing failed: {}", err);
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Registration failed")
    })
}

async fn verify_password(password: String, password_hash: String) -> bool {
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &password_hash))
        .await
        .is_ok_and(|verified| verified.unwrap_or(false))
}

fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
