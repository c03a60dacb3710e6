//! Client error taxonomy.

use murmur_protocol::ProtocolError;
use murmur_transport::TransportError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the realtime client.
///
/// Cloneable so one connection-level failure can reject every waiter.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Socket-level failure: dial refused, handshake failed, socket reset.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection went away before the call was answered.
    #[error("Connection lost")]
    ConnectionLost,

    /// The server rejected the auth token. Terminal: no reconnect follows.
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// Malformed or undecodable frame.
    #[error("Protocol error: {0}")]
    Protocol(Arc<ProtocolError>),

    /// No response within the call's deadline.
    #[error("RPC `{method}` timed out after {timeout:?}")]
    RpcTimeout { method: String, timeout: Duration },

    /// The server answered with `success: false`.
    #[error("RPC `{method}` failed: {message}")]
    Rpc { method: String, message: String },

    /// The client is Disconnected or in Error; call `connect()` first.
    #[error("Not connected")]
    NotConnected,

    /// Params or result did not (de)serialize.
    #[error("Serialization error: {0}")]
    Serialization(Arc<serde_json::Error>),

    /// The endpoint URL is not usable.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The connection driver has stopped.
    #[error("Client shut down")]
    Shutdown,
}

impl ClientError {
    /// Whether the error concerns the connection as a whole rather than a
    /// single call.
    #[must_use]
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            ClientError::Connection(_) | ClientError::ConnectionLost | ClientError::Auth(_)
        )
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        ClientError::Protocol(Arc::new(err))
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serialization(Arc::new(err))
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        ClientError::InvalidUrl(err.to_string())
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized(reason) => ClientError::Auth(reason),
            TransportError::InvalidUrl(reason) => ClientError::InvalidUrl(reason),
            TransportError::Protocol(err) => err.into(),
            TransportError::ConnectionClosed => ClientError::ConnectionLost,
            other => ClientError::Connection(other.to_string()),
        }
    }
}

/// Convenience type alias for `Result<T, ClientError>`.
pub type Result<T> = std::result::Result<T, ClientError>;
