//! Error taxonomy for connections, sends, configuration and supervision.

use crate::channels::Platform;

/// Failure to establish (or keep) a platform session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// Credential rejected by the platform. Fatal at startup.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Network or protocol failure; recoverable by reconnecting.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ConnectError::Auth(_))
    }
}

/// Request URLs are dropped: the Telegram Bot API carries the token in the path.
impl From<reqwest::Error> for ConnectError {
    fn from(e: reqwest::Error) -> Self {
        ConnectError::Transport(e.without_url().to_string())
    }
}

/// A single outbound message could not be delivered. Never retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SendError {
    #[error("send unauthorized: {0}")]
    Unauthorized(String),
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<f64> },
    #[error("destination rejected message: {0}")]
    Rejected(String),
    #[error("send transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for SendError {
    fn from(e: reqwest::Error) -> Self {
        SendError::Transport(e.without_url().to_string())
    }
}

/// Missing or invalid configuration. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing {0}")]
    Missing(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("duplicate route source {platform} channel {channel_id}")]
    DuplicateRoute { platform: Platform, channel_id: String },
    #[error("route endpoints are both on {0}")]
    SamePlatform(Platform),
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("{platform} failed to start: {source}")]
    Startup {
        platform: Platform,
        #[source]
        source: ConnectError,
    },
}
