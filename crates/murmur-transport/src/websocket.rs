//! WebSocket transport implementation.
//!
//! This module provides a WebSocket connector using tokio-tungstenite.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use murmur_protocol::{ProtocolError, WireMessage, MAX_FRAME_SIZE};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame, WebSocketConfig as TungsteniteConfig},
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};
use url::Url;

use crate::traits::{CloseInfo, Connector, Socket, SocketEvent, TransportError, CLOSE_NO_STATUS};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Largest inbound message handed to the client, in bytes. Larger
    /// messages are dropped; the connection stays up.
    pub max_message_size: usize,
    /// How long the TCP + WebSocket handshake may take.
    pub connect_timeout: Duration,
}

impl WebSocketConfig {
    /// Limits for tungstenite itself. A single frame may not exceed
    /// `max_message_size`; a fragmented message may reach four times that so
    /// it can be read off the wire and dropped instead of killing the stream.
    fn tungstenite(&self) -> TungsteniteConfig {
        let mut config = TungsteniteConfig::default();
        config.max_frame_size = Some(self.max_message_size);
        config.max_message_size = Some(self.max_message_size.saturating_mul(4));
        config
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_FRAME_SIZE,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Dials WebSocket endpoints.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    /// Create a new connector.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Socket>, TransportError> {
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }

        let dialing =
            connect_async_with_config(url.as_str(), Some(self.config.tungstenite()), false);
        let (stream, response) = tokio::time::timeout(self.config.connect_timeout, dialing)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(map_handshake_error)?;

        debug!(
            host = url.host_str().unwrap_or_default(),
            status = %response.status(),
            "WebSocket handshake completed"
        );

        Ok(Box::new(WebSocketSocket::new(
            stream,
            self.config.max_message_size,
        )))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

fn map_handshake_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            TransportError::Unauthorized(format!(
                "handshake rejected with HTTP {}",
                response.status()
            ))
        }
        WsError::Url(e) => TransportError::InvalidUrl(e.to_string()),
        WsError::Io(e) => TransportError::Io(e),
        other => {
            error!("WebSocket handshake failed: {}", other);
            TransportError::Connect(other.to_string())
        }
    }
}

/// A client-side WebSocket.
pub struct WebSocketSocket {
    stream: WsStream,
    is_open: bool,
    max_message_size: usize,
}

impl WebSocketSocket {
    fn new(stream: WsStream, max_message_size: usize) -> Self {
        Self {
            stream,
            is_open: true,
            max_message_size,
        }
    }

    fn fits(&self, len: usize) -> bool {
        if len > self.max_message_size {
            warn!(
                error = %ProtocolError::FrameTooLarge(len),
                limit = self.max_message_size,
                "Dropping oversize message"
            );
            return false;
        }
        true
    }
}

#[async_trait]
impl Socket for WebSocketSocket {
    async fn recv(&mut self) -> Result<SocketEvent, TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if self.fits(text.len()) {
                        return Ok(SocketEvent::Message(WireMessage::Text(text)));
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if self.fits(data.len()) {
                        return Ok(SocketEvent::Message(WireMessage::Binary(Bytes::from(data))));
                    }
                }
                // tungstenite queues the pong reply itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    self.is_open = false;
                    let close = frame.map_or_else(
                        || CloseInfo::new(CLOSE_NO_STATUS, ""),
                        |f| CloseInfo::new(u16::from(f.code), f.reason.into_owned()),
                    );
                    debug!(%close, "Received close frame");
                    return Ok(SocketEvent::Closed(close));
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("WebSocket stream ended");
                    self.is_open = false;
                    return Ok(SocketEvent::Closed(CloseInfo::abnormal("stream ended")));
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match message {
            WireMessage::Text(text) => Message::Text(text),
            WireMessage::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self, close: CloseInfo) -> Result<(), TransportError> {
        if !self.is_open {
            return Ok(()); // Already closed
        }
        self.is_open = false;

        let frame = CloseFrame {
            code: CloseCode::from(close.code),
            reason: close.reason.into(),
        };
        self.stream
            .close(Some(frame))
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
