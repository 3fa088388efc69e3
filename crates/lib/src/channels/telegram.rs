//! Telegram connection: getMe on connect, long-poll getUpdates (or webhook delivery), sendMessage.

use crate::channels::connection::{receiver_stream, InboundStream, PlatformConnection};
use crate::channels::inbound::{InboundEvent, Platform};
use crate::channels::state::{ConnectionState, StateCell};
use crate::error::{ConnectError, SendError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const DEFAULT_LONG_POLL_TIMEOUT: u64 = 30;
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const INBOUND_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Telegram update payload (getUpdates result item or webhook POST body).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl TelegramUser {
    /// Username when set, otherwise "first last".
    pub fn display_name(&self) -> String {
        if let Some(u) = self.username.as_deref().filter(|u| !u.is_empty()) {
            return u.to_string();
        }
        let full = match self.last_name.as_deref() {
            Some(last) if !last.is_empty() => format!("{} {}", self.first_name, last),
            _ => self.first_name.clone(),
        };
        let full = full.trim().to_string();
        if full.is_empty() {
            "unknown".to_string()
        } else {
            full
        }
    }
}

impl TelegramUpdate {
    /// Convert a text message update into an inbound event. `bot_id` is this bot's own user id.
    pub fn into_event(self, bot_id: Option<i64>) -> Option<InboundEvent> {
        let msg = self.message?;
        let text = msg.text?;
        let (sender_display_name, is_from_bot) = match msg.from {
            Some(ref user) => (
                user.display_name(),
                user.is_bot || Some(user.id) == bot_id,
            ),
            None => ("unknown".to_string(), false),
        };
        Some(InboundEvent {
            source_platform: Platform::Telegram,
            sender_display_name,
            body_text: text,
            source_channel_id: msg.chat.id.to_string(),
            is_from_bot,
        })
    }
}

/// Bot API failure: HTTP transport or a non-ok API response.
#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("telegram request failed: {0}")]
    Request(reqwest::Error),
    #[error("telegram {method} failed: {status} {description}")]
    Api {
        method: &'static str,
        status: u16,
        description: String,
        retry_after: Option<u64>,
    },
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        // The request URL embeds the bot token.
        ApiError::Request(e.without_url())
    }
}

impl ApiError {
    fn status(&self) -> Option<u16> {
        match self {
            ApiError::Api { status, .. } => Some(*status),
            ApiError::Request(_) => None,
        }
    }
}

impl From<ApiError> for ConnectError {
    fn from(e: ApiError) -> Self {
        match e.status() {
            Some(401) | Some(404) => ConnectError::Auth(e.to_string()),
            _ => ConnectError::Transport(e.to_string()),
        }
    }
}

impl From<ApiError> for SendError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Request(e) => SendError::Transport(e.to_string()),
            ApiError::Api {
                status: 401,
                description,
                ..
            } => SendError::Unauthorized(description),
            ApiError::Api {
                status: 429,
                retry_after,
                ..
            } => SendError::RateLimited {
                retry_after_secs: retry_after.map(|s| s as f64),
            },
            ApiError::Api {
                status,
                description,
                ..
            } => SendError::Rejected(format!("{} {}", status, description)),
        }
    }
}

/// Bot API client bound to one token. Cheap to clone into background tasks.
#[derive(Clone)]
struct BotApi {
    client: reqwest::Client,
    base: String,
    token: String,
}

impl BotApi {
    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<T, ApiError> {
        let url = format!("{}/bot{}/{}", self.base, self.token, method);
        let res = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await?;
        let status = res.status();
        let text = res.text().await?;
        let parsed: Option<ApiResponse<T>> = serde_json::from_str(&text).ok();
        match parsed {
            Some(ApiResponse {
                ok: true,
                result: Some(result),
                ..
            }) if status.is_success() => Ok(result),
            Some(resp) => Err(ApiError::Api {
                method,
                status: status.as_u16(),
                description: resp.description.unwrap_or_else(|| "ok: false".to_string()),
                retry_after: resp.parameters.and_then(|p| p.retry_after),
            }),
            None => Err(ApiError::Api {
                method,
                status: status.as_u16(),
                description: text,
                retry_after: None,
            }),
        }
    }

    async fn get_updates(
        &self,
        offset: Option<i64>,
        poll_timeout: u64,
    ) -> Result<Vec<TelegramUpdate>, ApiError> {
        let mut body = serde_json::json!({
            "timeout": poll_timeout,
            "allowed_updates": ["message"],
        });
        if let Some(off) = offset {
            body["offset"] = serde_json::Value::from(off);
        }
        // HTTP timeout must outlast the server-side long poll.
        let timeout = Duration::from_secs(poll_timeout) + REQUEST_TIMEOUT;
        self.call("getUpdates", body, timeout).await
    }
}

/// Webhook settings; when present, updates arrive via [`TelegramConnection::deliver_update`].
#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub url: String,
    pub secret: Option<String>,
}

pub struct TelegramConnection {
    api: BotApi,
    poll_timeout: u64,
    webhook: Option<WebhookSettings>,
    state: StateCell,
    me: RwLock<Option<TelegramUser>>,
    /// Cancels the current session's poller.
    session: Mutex<Option<CancellationToken>>,
    /// Webhook mode: sender into the current inbound stream.
    webhook_sink: Mutex<Option<mpsc::Sender<InboundEvent>>>,
}

impl TelegramConnection {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api: BotApi {
                client: reqwest::Client::new(),
                base: TELEGRAM_API_BASE.to_string(),
                token: token.into(),
            },
            poll_timeout: DEFAULT_LONG_POLL_TIMEOUT,
            webhook: None,
            state: StateCell::new(),
            me: RwLock::new(None),
            session: Mutex::new(None),
            webhook_sink: Mutex::new(None),
        }
    }

    /// Override the Bot API base URL (for tests or self-hosted Bot API servers).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api.base = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_poll_timeout(mut self, secs: u64) -> Self {
        self.poll_timeout = secs;
        self
    }

    pub fn with_webhook(mut self, webhook: WebhookSettings) -> Self {
        self.webhook = Some(webhook);
        self
    }

    pub fn webhook(&self) -> Option<&WebhookSettings> {
        self.webhook.as_ref()
    }

    /// The bot account reported by getMe on the last successful connect.
    pub fn me(&self) -> Option<TelegramUser> {
        self.me.read().ok().and_then(|g| g.clone())
    }

    fn bot_id(&self) -> Option<i64> {
        self.me().map(|u| u.id)
    }

    /// Webhook mode: hand an update POSTed by Telegram to the current stream.
    /// Returns false when no stream is active.
    pub async fn deliver_update(&self, update: TelegramUpdate) -> bool {
        let sink = self.webhook_sink.lock().ok().and_then(|g| g.clone());
        let Some(tx) = sink else {
            return false;
        };
        match update.into_event(self.bot_id()) {
            Some(event) => tx.send(event).await.is_ok(),
            None => true,
        }
    }

    async fn set_webhook(&self, webhook: &WebhookSettings) -> Result<(), ApiError> {
        let mut body = serde_json::json!({
            "url": webhook.url,
            "allowed_updates": ["message"],
        });
        if let Some(ref s) = webhook.secret {
            body["secret_token"] = serde_json::Value::String(s.clone());
        }
        self.api
            .call::<bool>("setWebhook", body, REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn delete_webhook(&self) -> Result<(), ApiError> {
        self.api
            .call::<bool>("deleteWebhook", serde_json::json!({}), REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    fn cancel_session(&self) {
        if let Some(token) = self.session.lock().ok().and_then(|mut g| g.take()) {
            token.cancel();
        }
        if let Ok(mut g) = self.webhook_sink.lock() {
            g.take();
        }
    }
}

#[async_trait]
impl PlatformConnection for TelegramConnection {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        self.cancel_session();
        self.state.set(ConnectionState::Connecting);
        let me: TelegramUser = match self
            .api
            .call("getMe", serde_json::json!({}), REQUEST_TIMEOUT)
            .await
        {
            Ok(me) => me,
            Err(e) => {
                self.state.set(ConnectionState::Failed);
                return Err(e.into());
            }
        };
        if let Some(ref webhook) = self.webhook {
            if let Err(e) = self.set_webhook(webhook).await {
                self.state.set(ConnectionState::Failed);
                return Err(e.into());
            }
            log::info!("telegram: webhook registered url={}", webhook.url);
        }
        log::info!("telegram: connected as @{}", me.display_name());
        if let Ok(mut g) = self.me.write() {
            *g = Some(me);
        }
        if let Ok(mut g) = self.session.lock() {
            *g = Some(CancellationToken::new());
        }
        self.state.set(ConnectionState::Connected);
        Ok(())
    }

    fn inbound_stream(&self) -> Result<InboundStream, ConnectError> {
        let token = self
            .session
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .ok_or_else(|| ConnectError::Transport("telegram not connected".to_string()))?;
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        if self.webhook.is_some() {
            if let Ok(mut g) = self.webhook_sink.lock() {
                *g = Some(tx);
            }
            log::debug!("telegram: inbound stream fed by webhook");
        } else {
            log::info!("telegram: starting getUpdates long-poll loop");
            tokio::spawn(run_get_updates_loop(
                self.api.clone(),
                self.poll_timeout,
                self.bot_id(),
                self.state.clone(),
                tx,
                token,
            ));
        }
        Ok(receiver_stream(rx))
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<(), SendError> {
        let body = serde_json::json!({ "chat_id": channel_id, "text": text });
        self.api
            .call::<serde_json::Value>("sendMessage", body, REQUEST_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(SendError::from)
    }

    async fn disconnect(&self) {
        self.cancel_session();
        let was = self.state.get();
        self.state.set(ConnectionState::Disconnected);
        if was == ConnectionState::Disconnected {
            return;
        }
        if self.webhook.is_some() {
            if let Err(e) = self.delete_webhook().await {
                log::debug!("telegram: deleteWebhook on disconnect: {}", e);
            }
        }
        log::info!("telegram: disconnected");
    }
}

async fn run_get_updates_loop(
    api: BotApi,
    poll_timeout: u64,
    bot_id: Option<i64>,
    state: StateCell,
    inbound_tx: mpsc::Sender<InboundEvent>,
    cancel: CancellationToken,
) {
    let mut offset: Option<i64> = None;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            r = api.get_updates(offset, poll_timeout) => r,
        };
        match result {
            Ok(updates) => {
                if let Some(max) = updates.iter().map(|u| u.update_id).max() {
                    offset = Some(max + 1);
                }
                for u in updates {
                    let Some(event) = u.into_event(bot_id) else {
                        continue;
                    };
                    if inbound_tx.send(event).await.is_err() {
                        log::debug!("telegram: inbound stream dropped, stopping loop");
                        return;
                    }
                }
            }
            Err(e) if matches!(e.status(), Some(401) | Some(404) | Some(409)) => {
                // 409: a webhook is set or another poller holds the token.
                log::error!("telegram: getUpdates cannot continue: {}", e);
                state.transition(ConnectionState::Connected, ConnectionState::Failed);
                return;
            }
            Err(e) => {
                log::warn!("telegram: getUpdates error: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    log::info!("telegram: getUpdates loop stopped");
}
