//! Messages flowing through the relay: inbound events from a platform and outbound send requests.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One side of the bridge.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Telegram,
    Discord,
}

impl Platform {
    pub fn opposite(self) -> Self {
        match self {
            Platform::Telegram => Platform::Discord,
            Platform::Discord => Platform::Telegram,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Telegram => "telegram",
            Platform::Discord => "discord",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat message received on one platform. Consumed once by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub source_platform: Platform,
    pub sender_display_name: String,
    pub body_text: String,
    /// Telegram chat id or Discord channel id, as a string.
    pub source_channel_id: String,
    /// Set for messages authored by any bot, including this relay.
    pub is_from_bot: bool,
}

/// A text to deliver to one channel on the destination platform. Fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub destination_platform: Platform,
    pub destination_channel_id: String,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opposite_flips_platform() {
        assert_eq!(Platform::Telegram.opposite(), Platform::Discord);
        assert_eq!(Platform::Discord.opposite(), Platform::Telegram);
    }

    #[test]
    fn platform_displays_lowercase() {
        assert_eq!(Platform::Discord.to_string(), "discord");
        assert_eq!(
            serde_json::to_string(&Platform::Telegram).unwrap(),
            "\"telegram\""
        );
    }
}
