//! Connection lifecycle: dial, heartbeat, reconnect, outbound queue.
//!
//! ```text
//!   ConnectionManager ──Command (mpsc)──► driver task ──► Box<dyn Socket>
//!          ▲                               │  owns: socket, outbound queue,
//!          │                               │        attempt counter
//!          └──── watch<ConnectionState> ◄──┤
//!                                          └──► InboundHandler (Router)
//! ```
//!
//! The driver task is the only owner of the socket, so inbound frames reach
//! the handler in exactly the order the socket yields them.

use murmur_protocol::{Codec, Frame, WireMessage};
use murmur_transport::{CloseInfo, Connector, Socket, SocketEvent, TransportError, CLOSE_NORMAL};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::backoff::{Backoff, ReconnectPolicy};
use crate::config::ClientConfig;
use crate::credentials::TokenProvider;
use crate::error::{ClientError, Result};
use crate::metrics;
use crate::state::ConnectionState;

/// Receives decoded inbound frames from the driver task.
///
/// Heartbeats are handled by the driver and never reach the handler.
pub trait InboundHandler: Send + Sync {
    /// One frame, in socket order. Must not block.
    fn on_frame(&self, frame: Frame);

    /// The connection is gone: fail pending work and drop derived state.
    fn on_connection_lost(&self);
}

/// Connection state observer.
pub type StateObserver = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Connection-level error observer.
pub type ErrorObserver = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// What the driver needs from [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub endpoint: Url,
    pub token_param: String,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    pub max_queued_frames: usize,
}

impl ConnectionSettings {
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            endpoint: config.endpoint()?,
            token_param: config.token_param.clone(),
            reconnect: config.reconnect_policy(),
            heartbeat_interval: config.heartbeat_interval(),
            max_queued_frames: config.queue.max_queued_frames,
        })
    }
}

/// The endpoint with `param=token` in its query, replacing any stale value.
#[must_use]
pub fn endpoint_with_token(endpoint: &Url, param: &str, token: Option<String>) -> Url {
    let mut url = endpoint.clone();
    let Some(token) = token.filter(|token| !token.is_empty()) else {
        return url;
    };

    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != param)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair(param, &token);
    url
}

enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
    Send(Frame),
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the manager handle and the driver task.
struct Shared {
    state: watch::Sender<ConnectionState>,
    state_observer: RwLock<Option<StateObserver>>,
    error_observer: RwLock<Option<ErrorObserver>>,
    rooms: Mutex<BTreeSet<String>>,
    last_seen: Mutex<Option<Instant>>,
    attempt: AtomicU32,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn rooms(&self) -> Vec<String> {
        lock(&self.rooms).iter().cloned().collect()
    }

    fn touch(&self) {
        *lock(&self.last_seen) = Some(Instant::now());
    }
}

/// Handle to the connection driver.
///
/// Dropping the manager aborts the driver task.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Spawn the driver task in state Disconnected.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(
        settings: ConnectionSettings,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn Codec>,
        tokens: Arc<dyn TokenProvider>,
        handler: Arc<dyn InboundHandler>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            state,
            state_observer: RwLock::new(None),
            error_observer: RwLock::new(None),
            rooms: Mutex::new(BTreeSet::new()),
            last_seen: Mutex::new(None),
            attempt: AtomicU32::new(0),
        });

        let (commands, rx) = mpsc::unbounded_channel();
        let driver = Driver {
            shared: Arc::clone(&shared),
            commands: rx,
            connector,
            codec,
            tokens,
            handler,
            backoff: Backoff::new(settings.reconnect),
            settings,
            queue: VecDeque::new(),
            waiters: Vec::new(),
        };
        let task = tokio::spawn(driver.run());

        Self {
            shared,
            commands,
            task,
        }
    }

    /// Dial and wait until Connected.
    ///
    /// Resolves at once if already Connected, joins a dial already in flight.
    ///
    /// # Errors
    ///
    /// The first dial error: [`ClientError::Connection`] (reconnecting
    /// continues in the background if enabled) or [`ClientError::Auth`].
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect(tx))
            .map_err(|_| ClientError::Shutdown)?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    /// Close with code 1000, reject pending calls, stop reconnecting.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Send a frame, or queue it while (re)connecting.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotConnected`] while Disconnected or in Error, and
    /// [`ClientError::Protocol`] for frames that fail validation.
    pub fn send(&self, frame: Frame) -> Result<()> {
        if !self.state().accepts_outbound() {
            return Err(ClientError::NotConnected);
        }
        frame.validate()?;
        self.commands
            .send(Command::Send(frame))
            .map_err(|_| ClientError::Shutdown)
    }

    /// Remember the room and join it now if a connection is (being) set up.
    /// Joins are replayed after every reconnect.
    ///
    /// # Errors
    ///
    /// Fails for an empty room id.
    pub fn join_room(&self, room_id: &str) -> Result<()> {
        let frame = Frame::join_room(room_id);
        frame.validate()?;

        let added = lock(&self.shared.rooms).insert(room_id.to_string());
        if added && self.state().accepts_outbound() {
            self.send(frame)?;
        }
        debug!(room = %room_id, added, "Joined room");
        Ok(())
    }

    /// Forget the room and leave it if connected.
    ///
    /// # Errors
    ///
    /// Fails for an empty room id.
    pub fn leave_room(&self, room_id: &str) -> Result<()> {
        let frame = Frame::leave_room(room_id);
        frame.validate()?;

        let removed = lock(&self.shared.rooms).remove(room_id);
        if removed && self.state().accepts_outbound() {
            self.send(frame)?;
        }
        debug!(room = %room_id, removed, "Left room");
        Ok(())
    }

    /// Rooms replayed on reconnect, sorted.
    #[must_use]
    pub fn rooms(&self) -> Vec<String> {
        self.shared.rooms()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Replace the state observer. Called on the driver task; must not block.
    pub fn on_connection_change<F>(&self, observer: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        *write(&self.shared.state_observer) = Some(Arc::new(observer));
    }

    /// Replace the connection-level error observer.
    pub fn on_error<F>(&self, observer: F)
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        *write(&self.shared.error_observer) = Some(Arc::new(observer));
    }

    /// When the last inbound frame arrived.
    #[must_use]
    pub fn last_seen(&self) -> Option<Instant> {
        *lock(&self.shared.last_seen)
    }

    /// Reconnect attempts since the last Connected transition.
    #[must_use]
    pub fn reconnect_attempt(&self) -> u32 {
        self.shared.attempt.load(Ordering::Relaxed)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("rooms", &self.rooms())
            .finish()
    }
}

async fn send_frame(codec: &dyn Codec, socket: &mut dyn Socket, frame: &Frame) -> Result<()> {
    let message: WireMessage = match codec.encode(frame) {
        Ok(message) => message,
        Err(e) => {
            warn!(kind = %frame.kind(), error = %e, "Dropping frame that failed to encode");
            metrics::record_frame_dropped("encode");
            return Ok(());
        }
    };

    socket.send(message).await?;
    metrics::record_frame_sent(frame.kind());
    trace!(kind = %frame.kind(), "Sent frame");
    Ok(())
}

enum Phase {
    Idle,
    Dial,
    Open(Box<dyn Socket>),
    Backoff(Duration),
    Shutdown,
}

struct Driver {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn Codec>,
    tokens: Arc<dyn TokenProvider>,
    handler: Arc<dyn InboundHandler>,
    settings: ConnectionSettings,
    backoff: Backoff,
    queue: VecDeque<Frame>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl Driver {
    async fn run(mut self) {
        let mut phase = Phase::Idle;
        loop {
            phase = match phase {
                Phase::Idle => self.idle().await,
                Phase::Dial => self.dial().await,
                Phase::Open(socket) => self.pump(socket).await,
                Phase::Backoff(delay) => self.wait_backoff(delay).await,
                Phase::Shutdown => break,
            };
        }
        debug!("Connection driver stopped");
    }

    /// Disconnected or Error: wait for `connect()`.
    async fn idle(&mut self) -> Phase {
        loop {
            match self.commands.recv().await {
                None => return Phase::Shutdown,
                Some(Command::Connect(reply)) => {
                    self.waiters.push(reply);
                    self.backoff.reset();
                    self.publish_attempt();
                    self.transition(ConnectionState::Connecting);
                    return Phase::Dial;
                }
                Some(Command::Disconnect(ack)) => {
                    self.transition(ConnectionState::Disconnected);
                    let _ = ack.send(());
                }
                Some(Command::Send(frame)) => {
                    warn!(kind = %frame.kind(), "Dropping frame submitted while offline");
                    metrics::record_frame_dropped("offline");
                    // Raced a transition to Disconnected or Error: its call
                    // must not wait out the timeout
                    if matches!(frame, Frame::Request(_)) {
                        self.handler.on_connection_lost();
                    }
                }
            }
        }
    }

    async fn dial(&mut self) -> Phase {
        let url = endpoint_with_token(
            &self.settings.endpoint,
            &self.settings.token_param,
            self.tokens.token(),
        );
        info!(
            transport = self.connector.name(),
            endpoint = %self.settings.endpoint,
            attempt = self.backoff.attempt(),
            "Connecting"
        );

        let connector = Arc::clone(&self.connector);
        let dialing = connector.connect(&url);
        tokio::pin!(dialing);

        loop {
            tokio::select! {
                result = &mut dialing => {
                    return match result {
                        Ok(socket) => self.on_open(socket).await,
                        Err(e) => self.on_dial_error(e),
                    };
                }
                command = self.commands.recv() => match command {
                    None => return Phase::Shutdown,
                    Some(Command::Connect(reply)) => self.waiters.push(reply),
                    Some(Command::Disconnect(ack)) => {
                        self.disconnected();
                        let _ = ack.send(());
                        return Phase::Idle;
                    }
                    Some(Command::Send(frame)) => self.enqueue(frame),
                },
            }
        }
    }

    /// Connected: flush the queue in FIFO order, then replay room joins.
    async fn on_open(&mut self, mut socket: Box<dyn Socket>) -> Phase {
        self.transition(ConnectionState::Connected);
        self.backoff.reset();
        self.publish_attempt();
        self.shared.touch();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        let codec = Arc::clone(&self.codec);
        let queued = self.queue.len();
        let mut flushed_joins = HashSet::new();
        while let Some(frame) = self.queue.pop_front() {
            if let Frame::JoinRoom(room) = &frame {
                flushed_joins.insert(room.room_id.clone());
            }
            if let Err(e) = send_frame(codec.as_ref(), socket.as_mut(), &frame).await {
                self.requeue(frame);
                return self.on_socket_lost(e);
            }
        }

        let mut replayed = 0;
        for room_id in self.shared.rooms() {
            if flushed_joins.contains(&room_id) {
                continue;
            }
            if let Err(e) = send_frame(codec.as_ref(), socket.as_mut(), &Frame::join_room(room_id)).await {
                return self.on_socket_lost(e);
            }
            replayed += 1;
        }

        if queued > 0 || replayed > 0 {
            info!(queued, replayed, "Replayed outbound frames");
        }
        Phase::Open(socket)
    }

    fn on_dial_error(&mut self, err: TransportError) -> Phase {
        let error = ClientError::from(err);
        if matches!(error, ClientError::Auth(_) | ClientError::InvalidUrl(_)) {
            return self.fail(error);
        }

        warn!(error = %error, "Connection attempt failed");
        self.report(&error);
        let phase = self.schedule_reconnect();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        phase
    }

    /// Connected: route inbound frames, heartbeat, write outbound frames.
    async fn pump(&mut self, mut socket: Box<dyn Socket>) -> Phase {
        let period = self.settings.heartbeat_interval;
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let codec = Arc::clone(&self.codec);

        loop {
            tokio::select! {
                event = socket.recv() => match event {
                    Ok(SocketEvent::Message(message)) => {
                        if let Err(e) = self.on_message(codec.as_ref(), socket.as_mut(), message).await {
                            return self.on_socket_lost(e);
                        }
                    }
                    Ok(SocketEvent::Closed(close)) => return self.on_close(close),
                    Err(e) => return self.on_socket_lost(e.into()),
                },
                _ = heartbeat.tick() => {
                    trace!("Sending heartbeat");
                    if let Err(e) = send_frame(codec.as_ref(), socket.as_mut(), &Frame::ping()).await {
                        return self.on_socket_lost(e);
                    }
                }
                command = self.commands.recv() => match command {
                    None => {
                        let _ = socket.close(CloseInfo::normal()).await;
                        return Phase::Shutdown;
                    }
                    Some(Command::Connect(reply)) => {
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Disconnect(ack)) => {
                        let close = CloseInfo::new(CLOSE_NORMAL, "client disconnect");
                        if let Err(e) = socket.close(close).await {
                            debug!(error = %e, "Close handshake failed");
                        }
                        self.disconnected();
                        let _ = ack.send(());
                        return Phase::Idle;
                    }
                    Some(Command::Send(frame)) => {
                        if let Err(e) = send_frame(codec.as_ref(), socket.as_mut(), &frame).await {
                            self.requeue(frame);
                            return self.on_socket_lost(e);
                        }
                    }
                },
            }
        }
    }

    async fn on_message(
        &mut self,
        codec: &dyn Codec,
        socket: &mut dyn Socket,
        message: WireMessage,
    ) -> Result<()> {
        self.shared.touch();

        let frame = match codec.decode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(codec = codec.name(), bytes = message.len(), error = %e, "Dropping undecodable frame");
                metrics::record_frame_dropped("decode");
                self.report(&ClientError::from(e));
                return Ok(());
            }
        };

        metrics::record_frame_received(frame.kind());
        trace!(kind = %frame.kind(), "Received frame");

        match frame {
            Frame::Ping(ping) => send_frame(codec, socket, &Frame::pong(ping.timestamp)).await,
            Frame::Pong(_) => Ok(()),
            frame => {
                self.handler.on_frame(frame);
                Ok(())
            }
        }
    }

    fn on_close(&mut self, close: CloseInfo) -> Phase {
        if close.is_auth_rejection() {
            return self.fail(ClientError::Auth(close.to_string()));
        }

        if close.is_normal() {
            info!(%close, "Server closed the connection");
            self.transition(ConnectionState::Disconnected);
            self.abandon();
            return Phase::Idle;
        }

        warn!(%close, "Connection closed abnormally");
        self.on_socket_lost(ClientError::Connection(format!("socket closed with {close}")))
    }

    fn on_socket_lost(&mut self, error: ClientError) -> Phase {
        error!(error = %error, "Connection lost");
        self.report(&error);
        self.connection_lost();
        self.schedule_reconnect()
    }

    /// Reconnecting: wait out the backoff delay.
    async fn wait_backoff(&mut self, delay: Duration) -> Phase {
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => {
                    self.transition(ConnectionState::Connecting);
                    return Phase::Dial;
                }
                command = self.commands.recv() => match command {
                    None => return Phase::Shutdown,
                    Some(Command::Connect(reply)) => self.waiters.push(reply),
                    Some(Command::Disconnect(ack)) => {
                        self.disconnected();
                        let _ = ack.send(());
                        return Phase::Idle;
                    }
                    Some(Command::Send(frame)) => self.enqueue(frame),
                },
            }
        }
    }

    fn schedule_reconnect(&mut self) -> Phase {
        if !self.backoff.policy().enabled {
            self.abandon();
            self.transition(ConnectionState::Disconnected);
            return Phase::Idle;
        }

        match self.backoff.next_delay() {
            Some(delay) => {
                self.publish_attempt();
                metrics::record_reconnect_attempt();
                self.transition(ConnectionState::Reconnecting);
                info!(attempt = self.backoff.attempt(), ?delay, "Scheduling reconnect");
                Phase::Backoff(delay)
            }
            None => {
                let attempts = self.backoff.attempt();
                self.fail(ClientError::Connection(format!(
                    "gave up after {attempts} reconnect attempts"
                )))
            }
        }
    }

    /// Enter Error: fail waiters, pending calls and queued frames.
    fn fail(&mut self, error: ClientError) -> Phase {
        error!(error = %error, "Connection failed, not retrying");
        self.transition(ConnectionState::Error);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        self.abandon();
        self.report(&error);
        Phase::Idle
    }

    /// Explicit `disconnect()`.
    fn disconnected(&mut self) {
        self.transition(ConnectionState::Disconnected);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::ConnectionLost));
        }
        self.abandon();
        self.backoff.reset();
        self.publish_attempt();
    }

    /// Lost mid-session, about to reconnect. Queued requests go with their
    /// rejected calls; other queued frames wait for the next connection.
    fn connection_lost(&mut self) {
        self.queue.retain(|frame| !matches!(frame, Frame::Request(_)));
        self.handler.on_connection_lost();
    }

    /// Not reconnecting: nothing queued will ever be sent.
    fn abandon(&mut self) {
        let dropped = self.queue.len();
        if dropped > 0 {
            warn!(dropped, "Discarding queued frames");
            metrics::record_frames_dropped("offline", dropped as u64);
            self.queue.clear();
        }
        self.handler.on_connection_lost();
    }

    fn enqueue(&mut self, frame: Frame) {
        if matches!(frame, Frame::Ping(_) | Frame::Pong(_)) {
            trace!("Heartbeat not queued");
            return;
        }

        if self.queue.len() >= self.settings.max_queued_frames {
            if let Some(dropped) = self.queue.pop_front() {
                warn!(
                    kind = %dropped.kind(),
                    limit = self.settings.max_queued_frames,
                    "Outbound queue full, dropping oldest frame"
                );
                metrics::record_frame_dropped("queue_full");
            }
        }
        self.queue.push_back(frame);
        trace!(queued = self.queue.len(), "Queued frame");
    }

    /// Put back a frame whose write failed. Requests are not retried.
    fn requeue(&mut self, frame: Frame) {
        if !matches!(frame, Frame::Request(_)) {
            self.queue.push_front(frame);
        }
    }

    fn transition(&self, next: ConnectionState) {
        let current = self.shared.state();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            error!(from = %current, to = %next, "Refusing illegal state transition");
            return;
        }

        self.shared.state.send_replace(next);
        info!(from = %current, to = %next, "Connection state changed");

        let observer = read(&self.shared.state_observer).clone();
        if let Some(observer) = observer {
            observer(next);
        }
    }

    fn report(&self, error: &ClientError) {
        let observer = read(&self.shared.error_observer).clone();
        if let Some(observer) = observer {
            observer(error);
        }
    }

    fn publish_attempt(&self) {
        self.shared
            .attempt
            .store(self.backoff.attempt(), Ordering::Relaxed);
    }
}
