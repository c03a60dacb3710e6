//! # murmur-transport
//!
//! Socket abstraction for the murmur realtime client.
//!
//! - **WebSocket** - tokio-tungstenite client connector (`websocket` feature)
//! - **Memory** - in-process connector/server pair
//!
//! ## Transport Abstraction
//!
//! Transports implement [`Connector`] and [`Socket`], so the connection
//! manager stays transport-agnostic.
//!
//! ```rust,ignore
//! use murmur_transport::{Connector, Socket, SocketEvent};
//!
//! async fn pump(connector: &dyn Connector, url: &url::Url) -> Result<(), TransportError> {
//!     let mut socket = connector.connect(url).await?;
//!     while let SocketEvent::Message(message) = socket.recv().await? {
//!         // Decode and route the message
//!     }
//!     Ok(())
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{
    CloseInfo, Connector, Socket, SocketEvent, TransportError, CLOSE_ABNORMAL, CLOSE_GOING_AWAY,
    CLOSE_NORMAL, CLOSE_NO_STATUS, CLOSE_POLICY_VIOLATION, CLOSE_UNAUTHORIZED,
};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnector};
