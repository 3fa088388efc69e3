//! Connection lifecycle state, shared between a connection and its background tasks.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Failed => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Failed,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free state cell. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct StateCell {
    inner: Arc<AtomicU8>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    /// Starts in `Disconnected`.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AtomicU8::new(ConnectionState::Disconnected.to_u8())),
        }
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: ConnectionState) {
        self.inner.store(state.to_u8(), Ordering::SeqCst);
    }

    /// Moves `from` to `to` only if the cell still holds `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.inner
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected_and_is_shared_by_clones() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ConnectionState::Disconnected);
        let other = cell.clone();
        other.set(ConnectionState::Connected);
        assert_eq!(cell.get(), ConnectionState::Connected);
    }

    #[test]
    fn transition_only_from_expected_state() {
        let cell = StateCell::new();
        cell.set(ConnectionState::Connected);
        assert!(!cell.transition(ConnectionState::Connecting, ConnectionState::Failed));
        assert_eq!(cell.get(), ConnectionState::Connected);
        assert!(cell.transition(ConnectionState::Connected, ConnectionState::Failed));
        assert_eq!(cell.get(), ConnectionState::Failed);
    }
}
