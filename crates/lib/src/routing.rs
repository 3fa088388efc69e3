//! Route table: source (platform, channel) -> destination (platform, channel).
//!
//! Built once at startup from config and read-only afterwards. A route never points back at
//! its own platform, and each source channel has exactly one destination.

use crate::channels::Platform;
use crate::config::{RouteConfig, RouteDirection};
use crate::error::ConfigError;
use std::collections::HashMap;

/// One channel on one platform.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct Endpoint {
    pub platform: Platform,
    pub channel_id: String,
}

impl Endpoint {
    pub fn new(platform: Platform, channel_id: impl Into<String>) -> Self {
        Self {
            platform,
            channel_id: channel_id.into(),
        }
    }

    pub fn telegram(chat_id: impl Into<String>) -> Self {
        Self::new(Platform::Telegram, chat_id)
    }

    pub fn discord(channel_id: impl Into<String>) -> Self {
        Self::new(Platform::Discord, channel_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<Endpoint, Endpoint>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a one-way route. Rejects same-platform endpoints and a second route from the same source.
    pub fn add(&mut self, source: Endpoint, destination: Endpoint) -> Result<(), ConfigError> {
        if source.platform == destination.platform {
            return Err(ConfigError::SamePlatform(source.platform));
        }
        if source.channel_id.trim().is_empty() || destination.channel_id.trim().is_empty() {
            return Err(ConfigError::Invalid("route channel id is empty".to_string()));
        }
        if self.routes.contains_key(&source) {
            return Err(ConfigError::DuplicateRoute {
                platform: source.platform,
                channel_id: source.channel_id,
            });
        }
        self.routes.insert(source, destination);
        Ok(())
    }

    /// Expand configured route pairs into one-way routes.
    pub fn from_config(routes: &[RouteConfig]) -> Result<Self, ConfigError> {
        let mut table = Self::new();
        for r in routes {
            let tg = Endpoint::telegram(r.telegram_chat_id.trim());
            let dc = Endpoint::discord(r.discord_channel_id.trim());
            match r.direction {
                RouteDirection::Both => {
                    table.add(tg.clone(), dc.clone())?;
                    table.add(dc, tg)?;
                }
                RouteDirection::TelegramToDiscord => table.add(tg, dc)?,
                RouteDirection::DiscordToTelegram => table.add(dc, tg)?,
            }
        }
        if table.is_empty() {
            return Err(ConfigError::Missing("at least one route".to_string()));
        }
        Ok(table)
    }

    /// Destination for messages arriving on (platform, channel_id), if bridged.
    pub fn resolve(&self, platform: Platform, channel_id: &str) -> Option<&Endpoint> {
        self.routes.get(&Endpoint::new(platform, channel_id))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routes sorted by source, for display.
    pub fn entries(&self) -> Vec<(&Endpoint, &Endpoint)> {
        let mut v: Vec<_> = self.routes.iter().collect();
        v.sort_by(|a, b| {
            (a.0.platform.as_str(), &a.0.channel_id).cmp(&(b.0.platform.as_str(), &b.0.channel_id))
        });
        v
    }
}
