//! Transport abstraction traits for murmur.
//!
//! The connection manager dials through a [`Connector`] and then owns the
//! resulting [`Socket`] exclusively, so it never needs to know which
//! transport carries the frames.

use async_trait::async_trait;
use murmur_protocol::{ProtocolError, WireMessage};
use thiserror::Error;
use url::Url;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// No close frame was received.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Policy violation; servers use it for rejected credentials.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Application code for an invalid or expired token.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

/// Close code and reason of a finished socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// A normal (code 1000) closure.
    #[must_use]
    pub fn normal() -> Self {
        Self::new(CLOSE_NORMAL, "")
    }

    /// A closure with no close handshake.
    #[must_use]
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_ABNORMAL, reason)
    }

    /// Only code 1000 counts as normal; everything else warrants a reconnect.
    #[must_use]
    pub fn is_normal(&self) -> bool {
        self.code == CLOSE_NORMAL
    }

    /// The server closed because the credentials were rejected.
    #[must_use]
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self.code, CLOSE_UNAUTHORIZED | CLOSE_POLICY_VIOLATION)
    }
}

impl std::fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.reason.is_empty() {
            write!(f, "code {}", self.code)
        } else {
            write!(f, "code {} ({})", self.code, self.reason)
        }
    }
}

/// Something that happened on an open socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// A data message arrived.
    Message(WireMessage),
    /// The socket closed. No further events follow.
    Closed(CloseInfo),
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The handshake did not finish in time.
    #[error("Connection timed out")]
    Timeout,

    /// The endpoint refused the credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Failed to establish the connection.
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// The endpoint URL is not usable.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the failure means the credentials were rejected.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TransportError::Unauthorized(_))
    }
}

/// Dials sockets.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a socket to `url`.
    ///
    /// Resolves once the socket is open and ready to carry frames.
    async fn connect(&self, url: &Url) -> Result<Box<dyn Socket>, TransportError>;

    /// Get the transport name (e.g., "websocket", "memory").
    fn name(&self) -> &'static str;
}

/// An open, bidirectional message socket.
///
/// `recv` must be cancel-safe: the connection manager polls it inside
/// `tokio::select!` alongside its timers and command queue.
#[async_trait]
pub trait Socket: Send {
    /// Wait for the next event.
    ///
    /// Returns `Ok(SocketEvent::Closed(_))` once when the socket closes.
    async fn recv(&mut self) -> Result<SocketEvent, TransportError>;

    /// Send one message.
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError>;

    /// Close the socket with the given code and reason.
    async fn close(&mut self, close: CloseInfo) -> Result<(), TransportError>;

    /// Check if the socket is still open.
    fn is_open(&self) -> bool;
}
