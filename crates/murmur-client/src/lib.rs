//! # murmur-client
//!
//! Realtime client for chat-style backends: one socket carrying pub/sub
//! events and request/response RPC.
//!
//! This crate provides:
//!
//! - **ConnectionManager** - Dial, heartbeat, reconnect with backoff, outbound queue
//! - **EventDispatcher** - Route inbound events to subscribers by kind
//! - **RpcMultiplexer** - Correlate responses to in-flight calls
//! - **Presence** - Derived presence and typing state
//! - **RealtimeClient** - The facade tying them together
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  Command   ┌──────────────┐     ┌──────────────┐
//! │  RealtimeClient  │───────────▶│ driver task  │◀───▶│    Socket    │
//! └──────────────────┘            └──────────────┘     └──────────────┘
//!     │          │                       │
//!     │          │                       ▼
//!     │          │                ┌──────────────┐
//!     │          │                │    Router    │
//!     │          │                └──────────────┘
//!     │          │                   │        │
//!     ▼          ▼                   ▼        ▼
//! ┌───────────────┐  Response  ┌─────────────────┐
//! │ RpcMultiplexer│◀───────────│ EventDispatcher │──▶ subscribers
//! └───────────────┘            └─────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use murmur_client::{ClientConfig, RealtimeClient, StaticToken};
//!
//! let client = RealtimeClient::builder(ClientConfig::new("wss://chat.example.com/ws"))
//!     .token_provider(StaticToken::new("secret"))
//!     .build()?;
//!
//! client.on_connection_change(|state| println!("connection: {state}"));
//! client.connect().await?;
//! client.join_room("general")?;
//! let profile = client.call("users.me", serde_json::Value::Null).await?;
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod presence;
pub mod router;
pub mod rpc;
pub mod state;

pub use backoff::{Backoff, ReconnectPolicy};
pub use client::{RealtimeClient, RealtimeClientBuilder};
pub use config::ClientConfig;
pub use connection::{ConnectionManager, ConnectionSettings, InboundHandler};
pub use credentials::{EnvToken, FileTokenStore, StaticToken, TokenProvider};
pub use dispatcher::{EventDispatcher, Subscription, SubscriptionId};
pub use error::{ClientError, Result};
pub use presence::{PresenceMap, TypingKey, TypingMap};
pub use router::Router;
pub use rpc::{IdSource, PendingResponse, RpcMultiplexer, SequentialIds};
pub use state::ConnectionState;

pub use murmur_protocol as protocol;
pub use murmur_transport as transport;
