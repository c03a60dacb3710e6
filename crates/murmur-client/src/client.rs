//! The client facade owned by the application.

use murmur_protocol::{
    now_millis, ChatMessage, Codec, Frame, FrameKind, PresenceStatus, PresenceUpdate, RoomEvent,
    TypingEvent,
};
use murmur_transport::{Connector, WebSocketConnector};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionSettings};
use crate::credentials::{StaticToken, TokenProvider};
use crate::dispatcher::{EventDispatcher, Subscription};
use crate::error::{ClientError, Result};
use crate::presence::{PresenceMap, TypingMap};
use crate::router::Router;
use crate::rpc::{IdSource, RpcMultiplexer, SequentialIds};
use crate::state::ConnectionState;

/// Builder for [`RealtimeClient`].
pub struct RealtimeClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    codec: Option<Arc<dyn Codec>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    ids: Option<Box<dyn IdSource>>,
}

impl RealtimeClientBuilder {
    /// Transport to dial through. Defaults to WebSocket.
    #[must_use]
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Codec override. Defaults to the one named in the config.
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Auth token source. Defaults to anonymous.
    #[must_use]
    pub fn token_provider(mut self, tokens: impl TokenProvider + 'static) -> Self {
        self.tokens = Some(Arc::new(tokens));
        self
    }

    /// Correlation id source. Defaults to [`SequentialIds`].
    #[must_use]
    pub fn id_source(mut self, ids: impl IdSource + 'static) -> Self {
        self.ids = Some(Box::new(ids));
        self
    }

    /// Build the client and spawn its connection driver, Disconnected.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn build(self) -> Result<RealtimeClient> {
        let settings = ConnectionSettings::from_config(&self.config)?;

        let rpc = Arc::new(RpcMultiplexer::with_id_source(
            self.config.rpc_timeout(),
            self.ids.unwrap_or_else(|| Box::new(SequentialIds::new())),
        ));
        let dispatcher = Arc::new(EventDispatcher::new(self.config.typing_expiry()));
        let router = Router::new(Arc::clone(&rpc), Arc::clone(&dispatcher));

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector::default()));
        let codec = self.codec.unwrap_or_else(|| self.config.codec.codec());
        let tokens = self
            .tokens
            .unwrap_or_else(|| Arc::new(StaticToken::anonymous()));

        debug!(
            endpoint = %settings.endpoint,
            transport = connector.name(),
            codec = codec.name(),
            "Building realtime client"
        );

        let connection = ConnectionManager::spawn(settings, connector, codec, tokens, Arc::new(router));

        Ok(RealtimeClient {
            config: self.config,
            connection,
            rpc,
            dispatcher,
        })
    }
}

/// A realtime session: one socket shared by events and RPC calls.
///
/// Construct one per session at the application's composition root and hand
/// references to whoever needs it.
///
/// ```rust,ignore
/// let client = RealtimeClient::builder(ClientConfig::load()?)
///     .token_provider(FileTokenStore::new("~/.config/murmur/token"))
///     .build()?;
///
/// client.on_chat_message(|message| println!("{}: {}", message.sender_name, message.content));
/// client.connect().await?;
/// client.join_room("general")?;
///
/// let rooms: Vec<String> = client.call_typed("rooms.list", &()).await?;
/// ```
pub struct RealtimeClient {
    config: ClientConfig,
    connection: ConnectionManager,
    rpc: Arc<RpcMultiplexer>,
    dispatcher: Arc<EventDispatcher>,
}

impl RealtimeClient {
    #[must_use]
    pub fn builder(config: ClientConfig) -> RealtimeClientBuilder {
        RealtimeClientBuilder {
            config,
            connector: None,
            codec: None,
            tokens: None,
            ids: None,
        }
    }

    /// Build with defaults: WebSocket transport, anonymous.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // Connection lifecycle

    /// Connect and wait until Connected.
    ///
    /// # Errors
    ///
    /// The first dial error; see [`ConnectionManager::connect`].
    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Close normally. Pending calls fail with `ConnectionLost`.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    /// Replace the connection state observer.
    pub fn on_connection_change<F>(&self, observer: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.connection.on_connection_change(observer);
    }

    /// Replace the connection-level error observer.
    pub fn on_error<F>(&self, observer: F)
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.connection.on_error(observer);
    }

    /// Send a raw frame.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotConnected`] while Disconnected or in Error.
    pub fn send(&self, frame: Frame) -> Result<()> {
        self.connection.send(frame)
    }

    // RPC

    /// Call `method` with the configured default timeout.
    ///
    /// # Errors
    ///
    /// [`ClientError::RpcTimeout`], [`ClientError::Rpc`],
    /// [`ClientError::ConnectionLost`] or [`ClientError::NotConnected`].
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.call_with_timeout(method, params, self.rpc.default_timeout())
            .await
    }

    /// Call `method`, failing after `timeout`.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let (frame, pending) = self.rpc.register(method, params, Some(timeout))?;
        debug!(id = %pending.id(), %method, "Calling");

        // On refusal `pending` drops here and unregisters the call
        self.connection.send(frame)?;
        pending.wait().await
    }

    /// Call with serialized params and a deserialized result.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call), plus [`ClientError::Serialization`].
    pub async fn call_typed<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.call(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Calls awaiting a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.rpc.pending_count()
    }

    // Events

    /// Subscribe to raw frames of one kind.
    pub fn subscribe<F>(&self, kind: FrameKind, handler: F) -> Subscription
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(kind, handler)
    }

    pub fn on_chat_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChatMessage) + Send + Sync + 'static,
    {
        self.subscribe(FrameKind::ChatMessage, move |frame| {
            if let Frame::ChatMessage(message) = frame {
                handler(message);
            }
        })
    }

    pub fn on_presence<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&PresenceUpdate) + Send + Sync + 'static,
    {
        self.subscribe(FrameKind::PresenceUpdate, move |frame| {
            if let Frame::PresenceUpdate(update) = frame {
                handler(update);
            }
        })
    }

    /// Typing events, including the `is_typing: false` synthesized when an
    /// indicator expires locally.
    pub fn on_typing<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&TypingEvent) + Send + Sync + 'static,
    {
        self.subscribe(FrameKind::Typing, move |frame| {
            if let Frame::Typing(event) = frame {
                handler(event);
            }
        })
    }

    pub fn on_room_event<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        self.subscribe(FrameKind::RoomEvent, move |frame| {
            if let Frame::RoomEvent(event) = frame {
                handler(event);
            }
        })
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceMap {
        self.dispatcher.presence()
    }

    #[must_use]
    pub fn typing(&self) -> &TypingMap {
        self.dispatcher.typing()
    }

    // Rooms and outbound events

    /// Join a room now and after every reconnect.
    ///
    /// # Errors
    ///
    /// Fails for an empty room id.
    pub fn join_room(&self, room_id: &str) -> Result<()> {
        self.connection.join_room(room_id)
    }

    /// # Errors
    ///
    /// Fails for an empty room id.
    pub fn leave_room(&self, room_id: &str) -> Result<()> {
        self.connection.leave_room(room_id)
    }

    #[must_use]
    pub fn rooms(&self) -> Vec<String> {
        self.connection.rooms()
    }

    /// # Errors
    ///
    /// [`ClientError::NotConnected`] while Disconnected or in Error.
    pub fn send_chat_message(&self, message: ChatMessage) -> Result<()> {
        self.send(Frame::ChatMessage(message))
    }

    /// # Errors
    ///
    /// [`ClientError::NotConnected`] while Disconnected or in Error.
    pub fn send_typing(&self, user_id: &str, room_id: &str, is_typing: bool) -> Result<()> {
        self.send(Frame::Typing(TypingEvent {
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            is_typing,
            timestamp: now_millis(),
        }))
    }

    /// # Errors
    ///
    /// [`ClientError::NotConnected`] while Disconnected or in Error.
    pub fn update_presence(&self, user_id: &str, status: PresenceStatus) -> Result<()> {
        self.send(Frame::PresenceUpdate(PresenceUpdate {
            user_id: user_id.to_string(),
            status,
            last_seen: now_millis(),
        }))
    }

    // Diagnostics

    #[must_use]
    pub fn last_seen(&self) -> Option<tokio::time::Instant> {
        self.connection.last_seen()
    }

    #[must_use]
    pub fn reconnect_attempt(&self) -> u32 {
        self.connection.reconnect_attempt()
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("url", &self.config.url)
            .field("connection", &self.connection)
            .field("rpc", &self.rpc)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_transport::memory;

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let config = ClientConfig::new("http://localhost/ws");
        assert!(matches!(
            RealtimeClient::new(config),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_call_while_disconnected() {
        let (connector, _server) = memory::pair();
        let client = RealtimeClient::builder(ClientConfig::new("ws://memory/ws"))
            .connector(connector)
            .build()
            .unwrap();

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(
            client.call("rooms.list", Value::Null).await,
            Err(ClientError::NotConnected)
        ));
        assert_eq!(client.pending_calls(), 0);
        assert!(matches!(
            client.send_typing("u1", "r1", true),
            Err(ClientError::NotConnected)
        ));
    }
}
