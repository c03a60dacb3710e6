//! Connection state machine.

use std::fmt;

/// Lifecycle state of the client's single socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Gave up: auth was rejected or reconnect attempts ran out. Left only
    /// through an explicit `connect()` or `disconnect()`.
    Error,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal transition.
    ///
    /// ```text
    /// Disconnected | Error  -> Connecting
    /// Connecting            -> Connected | Reconnecting | Error
    /// Connected             -> Reconnecting | Error
    /// Reconnecting          -> Connecting | Error
    /// any                   -> Disconnected
    /// ```
    #[must_use]
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (_, Disconnected) => true,
            (Disconnected | Error, Connecting) => true,
            (Connecting, Connected | Reconnecting | Error) => true,
            (Connected, Reconnecting | Error) => true,
            (Reconnecting, Connecting | Error) => true,
            _ => false,
        }
    }

    /// Frames submitted in this state are sent or queued rather than refused.
    #[must_use]
    pub fn accepts_outbound(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }

    #[must_use]
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
