//! Local stand-ins for the Telegram Bot API and Discord REST/gateway, served with axum on a
//! free port.
#![allow(dead_code)]

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const GOOD_TOKEN: &str = "GOOD";
pub const TELEGRAM_BOT_ID: i64 = 99;
pub const DISCORD_SELF_ID: &str = "999";

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind free port");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

/// Poll until `f` holds or ~5s pass.
pub async fn wait_until(f: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}

#[derive(Clone, Default)]
struct TelegramState {
    updates: Arc<Mutex<VecDeque<Value>>>,
    requests: Arc<Mutex<Vec<(String, Value)>>>,
}

pub struct MockTelegram {
    pub base: String,
    state: TelegramState,
}

impl MockTelegram {
    /// Updates returned (once) by the next getUpdates call.
    pub fn queue_update(&self, update: Value) {
        self.state.updates.lock().unwrap().push_back(update);
    }

    /// (method, body) of every call made so far.
    pub fn requests(&self) -> Vec<(String, Value)> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn called(&self, method: &str) -> bool {
        self.requests().iter().any(|(m, _)| m == method)
    }
}

fn tg_error(status: StatusCode, description: &str, extra: Value) -> (StatusCode, Json<Value>) {
    let mut body = json!({
        "ok": false,
        "error_code": status.as_u16(),
        "description": description
    });
    if let Value::Object(map) = extra {
        for (k, v) in map {
            body[k] = v;
        }
    }
    (status, Json(body))
}

async fn telegram_api(
    State(state): State<TelegramState>,
    Path((bot, method)): Path<(String, String)>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    state
        .requests
        .lock()
        .unwrap()
        .push((method.clone(), body.clone()));
    if bot != format!("bot{}", GOOD_TOKEN) {
        return tg_error(StatusCode::UNAUTHORIZED, "Unauthorized", Value::Null);
    }
    match method.as_str() {
        "getMe" => (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "result": {
                    "id": TELEGRAM_BOT_ID,
                    "is_bot": true,
                    "first_name": "Relay",
                    "username": "relay_bot"
                }
            })),
        ),
        "getUpdates" => {
            let batch: Vec<Value> = state.updates.lock().unwrap().drain(..).collect();
            if batch.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            (StatusCode::OK, Json(json!({ "ok": true, "result": batch })))
        }
        "sendMessage" => match body["chat_id"].as_str() {
            Some("429") => tg_error(
                StatusCode::TOO_MANY_REQUESTS,
                "Too Many Requests: retry after 3",
                json!({ "parameters": { "retry_after": 3 } }),
            ),
            Some("400") => tg_error(
                StatusCode::BAD_REQUEST,
                "Bad Request: chat not found",
                Value::Null,
            ),
            _ => (
                StatusCode::OK,
                Json(json!({ "ok": true, "result": { "message_id": 1 } })),
            ),
        },
        "setWebhook" | "deleteWebhook" => {
            (StatusCode::OK, Json(json!({ "ok": true, "result": true })))
        }
        _ => tg_error(StatusCode::NOT_FOUND, "Not Found", Value::Null),
    }
}

pub async fn spawn_telegram() -> MockTelegram {
    let state = TelegramState::default();
    let app = Router::new()
        .route("/:bot/:method", post(telegram_api))
        .with_state(state.clone());
    let base = serve(app).await;
    MockTelegram { base, state }
}

/// A Telegram text message update.
pub fn telegram_update(
    update_id: i64,
    chat_id: i64,
    from_id: i64,
    username: &str,
    text: &str,
) -> Value {
    json!({
        "update_id": update_id,
        "message": {
            "message_id": update_id,
            "chat": { "id": chat_id, "type": "group" },
            "from": {
                "id": from_id,
                "is_bot": false,
                "first_name": username,
                "username": username
            },
            "text": text
        }
    })
}

#[derive(Clone)]
struct DiscordState {
    base: Arc<Mutex<String>>,
    sent: Arc<Mutex<Vec<(String, Value)>>>,
    dispatches: Arc<Mutex<Vec<Value>>>,
    heartbeat_ms: u64,
    ack_heartbeats: bool,
}

pub struct MockDiscord {
    pub base: String,
    state: DiscordState,
}

impl MockDiscord {
    /// (channel id, body) for every message POSTed.
    pub fn sent(&self) -> Vec<(String, Value)> {
        self.state.sent.lock().unwrap().clone()
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bot {}", GOOD_TOKEN))
        .unwrap_or(false)
}

async fn gateway_bot(
    State(state): State<DiscordState>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "401: Unauthorized", "code": 0 })),
        );
    }
    let ws_base = state.base.lock().unwrap().replacen("http://", "ws://", 1);
    (
        StatusCode::OK,
        Json(json!({ "url": format!("{}/gateway", ws_base), "shards": 1 })),
    )
}

async fn create_message(
    State(state): State<DiscordState>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "401: Unauthorized", "code": 0 })),
        );
    }
    if channel_id == "limited" {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "message": "You are being rate limited.",
                "retry_after": 1.5,
                "global": false
            })),
        );
    }
    if channel_id == "missing" {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "Unknown Channel", "code": 10003 })),
        );
    }
    state.sent.lock().unwrap().push((channel_id, body));
    (StatusCode::OK, Json(json!({ "id": "1" })))
}

async fn gateway_ws(State(state): State<DiscordState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_gateway(socket, state))
}

async fn run_gateway(mut socket: WebSocket, state: DiscordState) {
    let hello = json!({ "op": 10, "d": { "heartbeat_interval": state.heartbeat_ms } });
    if socket.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }
    // Wait for Identify.
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                let v: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
                if v["op"] == json!(2) {
                    break;
                }
            }
            Some(Ok(_)) => continue,
            _ => return,
        }
    }
    let ready = json!({
        "op": 0,
        "t": "READY",
        "s": 1,
        "d": { "user": { "id": DISCORD_SELF_ID } }
    });
    if socket.send(Message::Text(ready.to_string())).await.is_err() {
        return;
    }
    let dispatches: Vec<Value> = state.dispatches.lock().unwrap().clone();
    for (i, d) in dispatches.into_iter().enumerate() {
        let frame = json!({ "op": 0, "t": "MESSAGE_CREATE", "s": i + 2, "d": d });
        if socket.send(Message::Text(frame.to_string())).await.is_err() {
            return;
        }
    }
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Close(_) => break,
            Message::Text(text) if state.ack_heartbeats => {
                let v: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
                if v["op"] == json!(1) {
                    let ack = json!({ "op": 11 });
                    if socket.send(Message::Text(ack.to_string())).await.is_err() {
                        return;
                    }
                }
            }
            _ => {}
        }
    }
}

/// Discord REST + gateway stand-in. `dispatches` are MESSAGE_CREATE bodies sent after READY.
pub async fn spawn_discord(dispatches: Vec<Value>) -> MockDiscord {
    spawn_discord_with(dispatches, 45_000, true).await
}

/// Like [`spawn_discord`] with a chosen heartbeat interval, optionally never ACKing heartbeats.
pub async fn spawn_discord_with(
    dispatches: Vec<Value>,
    heartbeat_ms: u64,
    ack_heartbeats: bool,
) -> MockDiscord {
    let state = DiscordState {
        base: Arc::default(),
        sent: Arc::default(),
        dispatches: Arc::new(Mutex::new(dispatches)),
        heartbeat_ms,
        ack_heartbeats,
    };
    let app = Router::new()
        .route("/gateway/bot", get(gateway_bot))
        .route("/gateway/", get(gateway_ws))
        .route("/channels/:id/messages", post(create_message))
        .with_state(state.clone());
    let base = serve(app).await;
    *state.base.lock().unwrap() = base.clone();
    MockDiscord { base, state }
}

/// A Discord MESSAGE_CREATE body.
pub fn discord_message(channel_id: &str, author_id: &str, username: &str, content: &str) -> Value {
    json!({
        "id": "m1",
        "channel_id": channel_id,
        "guild_id": "g1",
        "author": { "id": author_id, "username": username },
        "content": content
    })
}

/// A server that accepts connections and never answers. Returns its base URL.
pub async fn spawn_stalled() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind free port");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{}", addr)
}

/// Base URL of a port with nothing listening.
pub fn closed_port_base() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    let addr = listener.local_addr().expect("local_addr");
    drop(listener);
    format!("http://{}", addr)
}
