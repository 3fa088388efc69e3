//! Discord connection: gateway WebSocket for MESSAGE_CREATE events, REST API for sending.
//!
//! Connect performs the full handshake (Hello, Identify, Ready) so credential errors surface
//! from `connect` rather than from the stream. A heartbeat task keeps the session alive until
//! the stream ends or the connection is dropped.

use crate::channels::connection::{receiver_stream, InboundStream, PlatformConnection};
use crate::channels::inbound::{InboundEvent, Platform};
use crate::channels::state::{ConnectionState, StateCell};
use crate::error::{ConnectError, SendError};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
const GATEWAY_QUERY: &str = "v=10&encoding=json";

/// GUILDS (1) | GUILD_MESSAGES (512) | MESSAGE_CONTENT (32768)
const GATEWAY_INTENTS: u64 = 1 | 512 | 32768;

const OP_DISPATCH: u64 = 0;
const OP_HEARTBEAT: u64 = 1;
const OP_IDENTIFY: u64 = 2;
const OP_RECONNECT: u64 = 7;
const OP_INVALID_SESSION: u64 = 9;
const OP_HELLO: u64 = 10;
const OP_HEARTBEAT_ACK: u64 = 11;

const CLOSE_AUTHENTICATION_FAILED: u16 = 4004;
const CLOSE_DISALLOWED_INTENTS: u16 = 4014;

const DEFAULT_HEARTBEAT_MS: u64 = 41_250;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const INBOUND_BUFFER: usize = 64;
const NO_SEQUENCE: i64 = -1;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = Arc<tokio::sync::Mutex<SplitSink<WsStream, Message>>>;
type WsReader = SplitStream<WsStream>;

/// Gateway frame envelope.
#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u64,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<i64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageCreate {
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
    author: Author,
    #[serde(default)]
    content: String,
    #[serde(default)]
    webhook_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Author {
    id: String,
    username: String,
    #[serde(default)]
    global_name: Option<String>,
    #[serde(default)]
    bot: bool,
}

/// Session facts learned from READY and used while filtering dispatches.
#[derive(Debug, Clone, Default)]
struct SessionInfo {
    self_user_id: Option<String>,
    guild_id: Option<String>,
}

/// Parse a MESSAGE_CREATE dispatch body into an inbound event.
/// Returns None for payloads outside the configured guild or that fail to parse.
fn parse_message_create(d: &Value, info: &SessionInfo) -> Option<InboundEvent> {
    let msg: MessageCreate = serde_json::from_value(d.clone()).ok()?;
    if let Some(ref want) = info.guild_id {
        if msg.guild_id.as_deref() != Some(want.as_str()) {
            return None;
        }
    }
    let is_from_bot = msg.author.bot
        || msg.webhook_id.is_some()
        || info.self_user_id.as_deref() == Some(msg.author.id.as_str());
    let sender_display_name = msg
        .author
        .global_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(msg.author.username);
    Some(InboundEvent {
        source_platform: Platform::Discord,
        sender_display_name,
        body_text: msg.content,
        source_channel_id: msg.channel_id,
        is_from_bot,
    })
}

fn identify_payload(token: &str) -> Value {
    json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": token,
            "intents": GATEWAY_INTENTS,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "chatbridge",
                "device": "chatbridge"
            }
        }
    })
}

fn heartbeat_payload(seq: &AtomicI64) -> Value {
    let s = seq.load(Ordering::SeqCst);
    json!({ "op": OP_HEARTBEAT, "d": if s == NO_SEQUENCE { Value::Null } else { Value::from(s) } })
}

fn close_error(code: u16, reason: &str) -> ConnectError {
    match code {
        CLOSE_AUTHENTICATION_FAILED => {
            ConnectError::Auth(format!("gateway closed {}: {}", code, reason))
        }
        CLOSE_DISALLOWED_INTENTS => ConnectError::Auth(format!(
            "gateway closed {}: message content intent not enabled for this bot",
            code
        )),
        _ => ConnectError::Transport(format!("gateway closed {}: {}", code, reason)),
    }
}

/// Read frames until a JSON text payload arrives.
async fn next_payload(reader: &mut WsReader) -> Result<GatewayPayload, ConnectError> {
    loop {
        let frame = reader
            .next()
            .await
            .ok_or_else(|| ConnectError::Transport("gateway closed during handshake".to_string()))?
            .map_err(|e| ConnectError::Transport(format!("gateway read: {}", e)))?;
        match frame {
            Message::Text(text) => {
                return serde_json::from_str(&text)
                    .map_err(|e| ConnectError::Transport(format!("gateway payload: {}", e)));
            }
            Message::Close(Some(frame)) => {
                return Err(close_error(u16::from(frame.code), &frame.reason));
            }
            Message::Close(None) => {
                return Err(ConnectError::Transport("gateway closed".to_string()));
            }
            _ => continue,
        }
    }
}

struct GatewaySession {
    reader: Option<WsReader>,
    writer: WsWriter,
    /// Set when a heartbeat goes out, cleared by the gateway's ACK.
    ack_pending: Arc<AtomicBool>,
    cancel: CancellationToken,
}

pub struct DiscordConnection {
    token: String,
    api_base: String,
    guild_id: Option<String>,
    client: reqwest::Client,
    request_timeout: Duration,
    state: StateCell,
    info: RwLock<SessionInfo>,
    seq: Arc<AtomicI64>,
    session: Mutex<Option<GatewaySession>>,
}

impl DiscordConnection {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base: DISCORD_API_BASE.to_string(),
            guild_id: None,
            client: reqwest::Client::new(),
            request_timeout: REQUEST_TIMEOUT,
            state: StateCell::new(),
            info: RwLock::new(SessionInfo::default()),
            seq: Arc::new(AtomicI64::new(NO_SEQUENCE)),
            session: Mutex::new(None),
        }
    }

    /// Override the REST API base URL (for tests).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Only accept messages from this guild.
    pub fn with_guild(mut self, guild_id: Option<String>) -> Self {
        self.guild_id = guild_id;
        self
    }

    /// Per-request timeout for REST calls (default 15s).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.token)
    }

    /// GET /gateway/bot. Also the credential check.
    async fn fetch_gateway_url(&self) -> Result<String, ConnectError> {
        let res = self
            .client
            .get(format!("{}/gateway/bot", self.api_base))
            .header("Authorization", self.auth_header())
            .timeout(self.request_timeout)
            .send()
            .await?;
        let status = res.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ConnectError::Auth("discord rejected bot token".to_string()));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ConnectError::Transport(format!(
                "gateway/bot failed: {} {}",
                status, body
            )));
        }
        let body: Value = res.json().await?;
        let url = body["url"].as_str().ok_or_else(|| {
            ConnectError::Transport("missing url in gateway/bot response".to_string())
        })?;
        Ok(format!("{}/?{}", url.trim_end_matches('/'), GATEWAY_QUERY))
    }

    async fn open_session(&self) -> Result<GatewaySession, ConnectError> {
        let url = self.fetch_gateway_url().await?;
        log::debug!("discord: connecting to gateway {}", url);
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ConnectError::Transport(format!("gateway connect: {}", e)))?;
        let (mut writer, mut reader) = ws.split();

        let hello = next_payload(&mut reader).await?;
        if hello.op != OP_HELLO {
            return Err(ConnectError::Transport(format!(
                "expected Hello (op 10), got op {}",
                hello.op
            )));
        }
        let heartbeat_ms = hello.d["heartbeat_interval"]
            .as_u64()
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_HEARTBEAT_MS);

        writer
            .send(Message::Text(identify_payload(&self.token).to_string()))
            .await
            .map_err(|e| ConnectError::Transport(format!("send identify: {}", e)))?;

        let self_user_id = loop {
            let p = next_payload(&mut reader).await?;
            if let Some(s) = p.s {
                self.seq.store(s, Ordering::SeqCst);
            }
            match p.op {
                OP_DISPATCH if p.t.as_deref() == Some("READY") => {
                    break p.d["user"]["id"].as_str().map(str::to_string);
                }
                OP_INVALID_SESSION => {
                    return Err(ConnectError::Auth("gateway rejected identify".to_string()));
                }
                _ => continue,
            }
        };
        if let Ok(mut info) = self.info.write() {
            *info = SessionInfo {
                self_user_id,
                guild_id: self.guild_id.clone(),
            };
        }

        let writer: WsWriter = Arc::new(tokio::sync::Mutex::new(writer));
        let cancel = CancellationToken::new();
        let ack_pending = Arc::new(AtomicBool::new(false));
        tokio::spawn(run_heartbeat(
            writer.clone(),
            self.seq.clone(),
            ack_pending.clone(),
            self.state.clone(),
            Duration::from_millis(heartbeat_ms),
            cancel.clone(),
        ));
        Ok(GatewaySession {
            reader: Some(reader),
            writer,
            ack_pending,
            cancel,
        })
    }

    async fn close_session(&self) -> bool {
        let session = self.session.lock().ok().and_then(|mut g| g.take());
        let Some(session) = session else {
            return false;
        };
        session.cancel.cancel();
        let close = async {
            let mut writer = session.writer.lock().await;
            writer.send(Message::Close(None)).await
        };
        // A dead socket may never drain the close frame.
        match tokio::time::timeout(CLOSE_TIMEOUT, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("discord: close frame: {}", e),
            Err(_) => log::debug!("discord: close frame timed out"),
        }
        true
    }
}

#[async_trait]
impl PlatformConnection for DiscordConnection {
    fn platform(&self) -> Platform {
        Platform::Discord
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        self.close_session().await;
        self.state.set(ConnectionState::Connecting);
        self.seq.store(NO_SEQUENCE, Ordering::SeqCst);
        let opened = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.open_session())
            .await
            .unwrap_or_else(|_| {
                Err(ConnectError::Transport(
                    "gateway handshake timed out".to_string(),
                ))
            });
        match opened {
            Ok(session) => {
                if let Ok(mut g) = self.session.lock() {
                    *g = Some(session);
                }
                self.state.set(ConnectionState::Connected);
                log::info!("discord: connected to gateway");
                Ok(())
            }
            Err(e) => {
                self.state.set(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    fn inbound_stream(&self) -> Result<InboundStream, ConnectError> {
        let mut guard = self
            .session
            .lock()
            .map_err(|_| ConnectError::Transport("discord session lock poisoned".to_string()))?;
        let session = guard
            .as_mut()
            .ok_or_else(|| ConnectError::Transport("discord not connected".to_string()))?;
        let reader = session
            .reader
            .take()
            .ok_or_else(|| ConnectError::Transport("discord stream already taken".to_string()))?;
        let info = self.info.read().map(|g| g.clone()).unwrap_or_default();
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        tokio::spawn(run_gateway_reader(
            reader,
            session.writer.clone(),
            self.seq.clone(),
            session.ack_pending.clone(),
            info,
            self.state.clone(),
            tx,
            session.cancel.clone(),
        ));
        Ok(receiver_stream(rx))
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<(), SendError> {
        let res = self
            .client
            .post(format!("{}/channels/{}/messages", self.api_base, channel_id))
            .header("Authorization", self.auth_header())
            .timeout(self.request_timeout)
            .json(&json!({ "content": text, "allowed_mentions": { "parse": [] } }))
            .send()
            .await?;
        let status = res.status();
        if status.is_success() {
            return Ok(());
        }
        let body = res.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            401 => SendError::Unauthorized(body),
            429 => SendError::RateLimited {
                retry_after_secs: serde_json::from_str::<Value>(&body)
                    .ok()
                    .and_then(|v| v["retry_after"].as_f64()),
            },
            _ => SendError::Rejected(format!("{} {}", status, body)),
        })
    }

    async fn disconnect(&self) {
        let had_session = self.close_session().await;
        self.state.set(ConnectionState::Disconnected);
        if had_session {
            log::info!("discord: disconnected");
        }
    }
}

/// Sends a heartbeat every `every`. A heartbeat still unacknowledged at the next tick means
/// the socket is dead: the connection is marked failed and the session cancelled, which ends
/// the inbound stream.
async fn run_heartbeat(
    writer: WsWriter,
    seq: Arc<AtomicI64>,
    ack_pending: Arc<AtomicBool>,
    state: StateCell,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; Identify already went out.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if ack_pending.swap(true, Ordering::SeqCst) {
            log::warn!("discord: heartbeat not acknowledged, dropping session");
            state.transition(ConnectionState::Connected, ConnectionState::Failed);
            cancel.cancel();
            break;
        }
        let frame = Message::Text(heartbeat_payload(&seq).to_string());
        if let Err(e) = writer.lock().await.send(frame).await {
            log::warn!("discord: heartbeat failed: {}", e);
            state.transition(ConnectionState::Connected, ConnectionState::Failed);
            cancel.cancel();
            break;
        }
    }
    log::debug!("discord: heartbeat stopped");
}

async fn run_gateway_reader(
    mut reader: WsReader,
    writer: WsWriter,
    seq: Arc<AtomicI64>,
    ack_pending: Arc<AtomicBool>,
    info: SessionInfo,
    state: StateCell,
    inbound_tx: mpsc::Sender<InboundEvent>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            f = reader.next() => f,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                match frame {
                    Some(f) => {
                        log::warn!("discord: {}", close_error(u16::from(f.code), &f.reason))
                    }
                    None => log::warn!("discord: gateway closed"),
                }
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                log::warn!("discord: gateway read error: {}", e);
                break;
            }
            None => {
                log::warn!("discord: gateway stream ended");
                break;
            }
        };
        let payload: GatewayPayload = match serde_json::from_str(&text) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("discord: skipping unparseable frame: {}", e);
                continue;
            }
        };
        if let Some(s) = payload.s {
            seq.store(s, Ordering::SeqCst);
        }
        match payload.op {
            OP_DISPATCH if payload.t.as_deref() == Some("MESSAGE_CREATE") => {
                let Some(event) = parse_message_create(&payload.d, &info) else {
                    continue;
                };
                if inbound_tx.send(event).await.is_err() {
                    log::debug!("discord: inbound stream dropped, stopping reader");
                    break;
                }
            }
            OP_HEARTBEAT => {
                let frame = Message::Text(heartbeat_payload(&seq).to_string());
                if let Err(e) = writer.lock().await.send(frame).await {
                    log::warn!("discord: heartbeat reply failed: {}", e);
                    break;
                }
            }
            OP_HEARTBEAT_ACK => ack_pending.store(false, Ordering::SeqCst),
            OP_RECONNECT => {
                log::info!("discord: gateway requested reconnect");
                break;
            }
            OP_INVALID_SESSION => {
                log::warn!("discord: gateway invalidated session");
                break;
            }
            _ => {}
        }
    }
    cancel.cancel();
    state.transition(ConnectionState::Connected, ConnectionState::Failed);
}
