//! Platform connections (Telegram, Discord, in-memory).
//!
//! Each connection owns one bot session and exposes connect / inbound stream / send /
//! disconnect. The relay router and supervisor only see the `PlatformConnection` trait.
//! `MemoryConnection` is built for tests and with the `test-utils` feature.

mod connection;
mod discord;
mod inbound;
#[cfg(any(test, feature = "test-utils"))]
mod memory;
mod state;
mod telegram;

pub use connection::{receiver_stream, InboundStream, PlatformConnection};
pub use discord::{DiscordConnection, DISCORD_API_BASE};
pub use inbound::{InboundEvent, OutboundRequest, Platform};
#[cfg(any(test, feature = "test-utils"))]
pub use memory::{MemoryConnection, ECHO_SENDER};
pub use state::{ConnectionState, StateCell};
pub use telegram::{
    TelegramConnection, TelegramUpdate, TelegramUser, WebhookSettings, TELEGRAM_API_BASE,
};
