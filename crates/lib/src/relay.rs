//! Relay router: turns an inbound event into a send on the opposite platform.
//!
//! Stateless between calls apart from the route table. A failed send is logged and the
//! message dropped; nothing here returns an error to the caller.

use crate::channels::{InboundEvent, OutboundRequest, Platform, PlatformConnection};
use crate::error::SendError;
use crate::routing::RouteTable;
use std::fmt;
use std::sync::Arc;

/// Why an event produced no outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Authored by a bot, including this relay's own forwarded messages.
    FromBot,
    EmptyBody,
    /// Source channel is not a configured route endpoint.
    Unrouted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::FromBot => "from_bot",
            SkipReason::EmptyBody => "empty_body",
            SkipReason::Unrouted => "unrouted",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    Relayed(OutboundRequest),
    Skipped(SkipReason),
    Failed(OutboundRequest, SendError),
}

/// Relay text: "{sender}: {body}".
pub fn format_relay_text(sender_display_name: &str, body_text: &str) -> String {
    format!("{}: {}", sender_display_name, body_text)
}

/// Decide what to send for an event, without sending it.
pub fn plan(routes: &RouteTable, event: &InboundEvent) -> Result<OutboundRequest, SkipReason> {
    if event.is_from_bot {
        return Err(SkipReason::FromBot);
    }
    if event.body_text.trim().is_empty() {
        return Err(SkipReason::EmptyBody);
    }
    let dest = routes
        .resolve(event.source_platform, &event.source_channel_id)
        .ok_or(SkipReason::Unrouted)?;
    Ok(OutboundRequest {
        destination_platform: dest.platform,
        destination_channel_id: dest.channel_id.clone(),
        text: format_relay_text(&event.sender_display_name, &event.body_text),
    })
}

pub struct RelayRouter {
    routes: Arc<RouteTable>,
    telegram: Arc<dyn PlatformConnection>,
    discord: Arc<dyn PlatformConnection>,
}

impl RelayRouter {
    pub fn new(
        routes: Arc<RouteTable>,
        telegram: Arc<dyn PlatformConnection>,
        discord: Arc<dyn PlatformConnection>,
    ) -> Self {
        Self {
            routes,
            telegram,
            discord,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    fn connection(&self, platform: Platform) -> &Arc<dyn PlatformConnection> {
        match platform {
            Platform::Telegram => &self.telegram,
            Platform::Discord => &self.discord,
        }
    }

    /// Route one event. Completes (including the send) before returning.
    pub async fn handle(&self, event: InboundEvent) -> RelayOutcome {
        let request = match plan(&self.routes, &event) {
            Ok(r) => r,
            Err(reason) => {
                log::debug!(
                    "relay: skipped source={} channel={} reason={}",
                    event.source_platform,
                    event.source_channel_id,
                    reason
                );
                return RelayOutcome::Skipped(reason);
            }
        };
        let conn = self.connection(request.destination_platform);
        match conn
            .send(&request.destination_channel_id, &request.text)
            .await
        {
            Ok(()) => {
                log::debug!(
                    "relay: relayed source={} channel={} destination={} channel={}",
                    event.source_platform,
                    event.source_channel_id,
                    request.destination_platform,
                    request.destination_channel_id
                );
                RelayOutcome::Relayed(request)
            }
            Err(e) => {
                log::warn!(
                    "relay: dropped message source={} channel={} destination={} channel={} error={}",
                    event.source_platform,
                    event.source_channel_id,
                    request.destination_platform,
                    request.destination_channel_id,
                    e
                );
                RelayOutcome::Failed(request, e)
            }
        }
    }
}
