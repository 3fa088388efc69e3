//! In-process connection: events are injected by the caller and sends are recorded.
//! Connect outcomes, send failures and echo of sent messages can be scripted.

use crate::channels::connection::{receiver_stream, InboundStream, PlatformConnection};
use crate::channels::inbound::{InboundEvent, OutboundRequest, Platform};
use crate::channels::state::{ConnectionState, StateCell};
use crate::error::{ConnectError, SendError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

const BUFFER: usize = 1024;

/// Display name used for echoed messages.
pub const ECHO_SENDER: &str = "chatbridge";

pub struct MemoryConnection {
    platform: Platform,
    state: StateCell,
    sink: Mutex<Option<mpsc::Sender<InboundEvent>>>,
    pending: Mutex<Option<mpsc::Receiver<InboundEvent>>>,
    sent: Mutex<Vec<OutboundRequest>>,
    connect_results: Mutex<VecDeque<Result<(), ConnectError>>>,
    connect_delay: Mutex<Option<Duration>>,
    fail_sends: AtomicBool,
    echo: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl MemoryConnection {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            state: StateCell::new(),
            sink: Mutex::new(None),
            pending: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            connect_results: Mutex::new(VecDeque::new()),
            connect_delay: Mutex::new(None),
            fail_sends: AtomicBool::new(false),
            echo: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    /// Queue the outcome of a future `connect` call. With an empty queue `connect` succeeds.
    pub fn push_connect_result(&self, result: Result<(), ConnectError>) {
        lock(&self.connect_results).push_back(result);
    }

    /// Make every `connect` wait before resolving.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *lock(&self.connect_delay) = delay;
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// When set, every successful send is delivered back as a bot-authored inbound event,
    /// the way a platform shows the relay its own messages.
    pub fn set_echo(&self, echo: bool) {
        self.echo.store(echo, Ordering::SeqCst);
    }

    /// Deliver an event to the current session. False when not connected.
    pub fn inject(&self, event: InboundEvent) -> bool {
        match lock(&self.sink).as_ref() {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Simulate a dropped session: the current stream ends after draining and state becomes `Failed`.
    pub fn fail_session(&self) {
        lock(&self.sink).take();
        self.state.set(ConnectionState::Failed);
    }

    pub fn sent(&self) -> Vec<OutboundRequest> {
        lock(&self.sent).clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl PlatformConnection for MemoryConnection {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.state.set(ConnectionState::Connecting);
        let delay = *lock(&self.connect_delay);
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let result = lock(&self.connect_results).pop_front().unwrap_or(Ok(()));
        match result {
            Ok(()) => {
                let (tx, rx) = mpsc::channel(BUFFER);
                *lock(&self.sink) = Some(tx);
                *lock(&self.pending) = Some(rx);
                self.state.set(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.state.set(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    fn inbound_stream(&self) -> Result<InboundStream, ConnectError> {
        lock(&self.pending)
            .take()
            .map(receiver_stream)
            .ok_or_else(|| ConnectError::Transport(format!("{} not connected", self.platform)))
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<(), SendError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SendError::Transport("simulated send failure".to_string()));
        }
        lock(&self.sent).push(OutboundRequest {
            destination_platform: self.platform,
            destination_channel_id: channel_id.to_string(),
            text: text.to_string(),
        });
        if self.echo.load(Ordering::SeqCst) {
            self.inject(InboundEvent {
                source_platform: self.platform,
                sender_display_name: ECHO_SENDER.to_string(),
                body_text: text.to_string(),
                source_channel_id: channel_id.to_string(),
                is_from_bot: true,
            });
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        lock(&self.sink).take();
        lock(&self.pending).take();
        self.state.set(ConnectionState::Disconnected);
    }
}
