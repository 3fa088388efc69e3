//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.chatbridge/config.json`) and environment.
//! Bot tokens may come from `TELEGRAM_BOT_TOKEN` / `DISCORD_BOT_TOKEN` instead of the file.

use crate::error::ConfigError;
use crate::routing::RouteTable;
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub discord: DiscordConfig,

    /// Bridged channel pairs.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// HTTP server for health and the Telegram webhook.
    #[serde(default)]
    pub server: ServerConfig,
}

/// Telegram bot settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// When set, use webhook mode: Telegram POSTs updates to this URL. If unset, long-poll getUpdates is used.
    pub webhook_url: Option<String>,
    /// Optional secret for webhook verification (X-Telegram-Bot-Api-Secret-Token). Used only when webhook_url is set.
    pub webhook_secret: Option<String>,
    /// Bot API base URL (default https://api.telegram.org).
    pub api_base: Option<String>,
    /// getUpdates long-poll timeout in seconds (default 30).
    pub poll_timeout_secs: Option<u64>,
}

/// Discord bot settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordConfig {
    /// Bot token from the developer portal. Overridden by DISCORD_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// When set, messages from other guilds are ignored.
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub guild_id: Option<String>,
    /// REST API base URL (default https://discord.com/api/v10).
    pub api_base: Option<String>,
}

/// Which way messages flow across a route pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RouteDirection {
    #[default]
    Both,
    TelegramToDiscord,
    DiscordToTelegram,
}

/// A Telegram chat bridged with a Discord channel. Ids may be JSON numbers or strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    #[serde(deserialize_with = "deserialize_id")]
    pub telegram_chat_id: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub discord_channel_id: String,
    #[serde(default)]
    pub direction: RouteDirection,
}

/// Reconnect backoff. Startup gives up after `startup_max_attempts`; runtime reconnects never give up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_startup_max_attempts")]
    pub startup_max_attempts: u32,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_startup_max_attempts() -> u32 {
    5
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            startup_max_attempts: default_startup_max_attempts(),
        }
    }
}

/// HTTP server bind and port settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Serve the health endpoint even without a webhook (default false).
    #[serde(default)]
    pub enabled: bool,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_server_bind")]
    pub bind: String,

    /// Port (default 15152).
    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    15152
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_server_bind(),
            port: default_server_port(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Signed(i64),
    Unsigned(u64),
    Text(String),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Signed(n) => n.to_string(),
            RawId::Unsigned(n) => n.to_string(),
            RawId::Text(s) => s.trim().to_string(),
        }
    }
}

fn deserialize_id<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    RawId::deserialize(d).map(RawId::into_string)
}

fn deserialize_opt_id<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<String>, D::Error> {
    Ok(Option::<RawId>::deserialize(d)?
        .map(RawId::into_string)
        .filter(|s| !s.is_empty()))
}

/// Everything the runtime needs, with credentials resolved and routes checked.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub telegram_token: String,
    pub discord_token: String,
    pub routes: RouteTable,
}

/// Trimmed env value when non-empty, else the trimmed config value when non-empty.
fn pick_token(env_value: Option<String>, config_value: Option<&String>) -> Option<String> {
    env_value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            config_value
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    pick_token(
        std::env::var("TELEGRAM_BOT_TOKEN").ok(),
        config.telegram.bot_token.as_ref(),
    )
}

/// Resolve the Discord bot token: env DISCORD_BOT_TOKEN overrides config.
pub fn resolve_discord_token(config: &Config) -> Option<String> {
    pick_token(
        std::env::var("DISCORD_BOT_TOKEN").ok(),
        config.discord.bot_token.as_ref(),
    )
}

impl Config {
    /// True when the HTTP server should run (explicitly enabled or needed for the webhook).
    pub fn server_enabled(&self) -> bool {
        self.server.enabled || self.telegram.webhook_url.is_some()
    }

    pub fn validate(&self) -> Result<BridgeSettings, ConfigError> {
        let telegram_token = resolve_telegram_token(self)
            .ok_or_else(|| ConfigError::Missing("telegram bot token".to_string()))?;
        let discord_token = resolve_discord_token(self)
            .ok_or_else(|| ConfigError::Missing("discord bot token".to_string()))?;
        self.validate_with_tokens(telegram_token, discord_token)
    }

    fn validate_with_tokens(
        &self,
        telegram_token: String,
        discord_token: String,
    ) -> Result<BridgeSettings, ConfigError> {
        if let Some(ref url) = self.telegram.webhook_url {
            if !url.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "telegram.webhookUrl must be https: {}",
                    url
                )));
            }
        }
        let r = &self.reconnect;
        if r.initial_delay_ms == 0 || r.max_delay_ms < r.initial_delay_ms || r.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "reconnect needs 0 < initialDelayMs <= maxDelayMs and multiplier >= 1".to_string(),
            ));
        }
        let routes = RouteTable::from_config(&self.routes)?;
        Ok(BridgeSettings {
            telegram_token,
            discord_token,
            routes,
        })
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CHATBRIDGE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".chatbridge").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, or the default path. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
