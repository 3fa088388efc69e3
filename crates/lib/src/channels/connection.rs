//! Platform connection trait: connect, stream inbound messages, send text, disconnect.

use crate::channels::inbound::{InboundEvent, Platform};
use crate::channels::state::ConnectionState;
use crate::error::{ConnectError, SendError};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

/// Inbound events from one session. Ends when the session fails or is disconnected.
pub type InboundStream = BoxStream<'static, InboundEvent>;

/// One platform's bot session.
#[async_trait]
pub trait PlatformConnection: Send + Sync {
    fn platform(&self) -> Platform;

    fn state(&self) -> ConnectionState;

    /// Establish the transport session (login, gateway handshake or poller start).
    async fn connect(&self) -> Result<(), ConnectError>;

    /// Stream of messages received by the current session. Call once per successful `connect`.
    fn inbound_stream(&self) -> Result<InboundStream, ConnectError>;

    /// Send a text message to a channel. Best-effort; callers do not retry.
    async fn send(&self, channel_id: &str, text: &str) -> Result<(), SendError>;

    /// Release the session. Idempotent.
    async fn disconnect(&self);
}

/// Adapt an mpsc receiver fed by a background task into an `InboundStream`.
pub fn receiver_stream(rx: mpsc::Receiver<InboundEvent>) -> InboundStream {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) }).boxed()
}
