//! In-memory transport.
//!
//! A [`MemoryConnector`] hands out sockets whose far ends surface as
//! [`MemoryPeer`]s on a paired [`MemoryServer`]. Useful for embedding a
//! backend in-process and for driving the client deterministically in tests,
//! including under paused tokio time.

use async_trait::async_trait;
use murmur_protocol::WireMessage;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::traits::{CloseInfo, Connector, Socket, SocketEvent, TransportError};

/// What the client side of a memory socket sent.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Message(WireMessage),
    Closed(CloseInfo),
}

enum ToClient {
    Message(WireMessage),
    Close(CloseInfo),
}

#[derive(Default)]
struct DialPlan {
    refuse_remaining: AtomicU32,
    reject_auth: AtomicBool,
    dials: AtomicUsize,
}

/// Client half: dials memory sockets.
#[derive(Clone)]
pub struct MemoryConnector {
    plan: Arc<DialPlan>,
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

/// Server half: accepts the peers the connector dialed.
pub struct MemoryServer {
    plan: Arc<DialPlan>,
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// Create a connected connector/server pair.
#[must_use]
pub fn pair() -> (MemoryConnector, MemoryServer) {
    let plan = Arc::new(DialPlan::default());
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            plan: Arc::clone(&plan),
            accept_tx,
        },
        MemoryServer { plan, accept_rx },
    )
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Socket>, TransportError> {
        self.plan.dials.fetch_add(1, Ordering::SeqCst);

        if self.plan.reject_auth.load(Ordering::SeqCst) {
            return Err(TransportError::Unauthorized("token rejected".into()));
        }

        let refused = self
            .plan
            .refuse_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            url: url.clone(),
            to_client: to_client_tx,
            from_client: to_server_rx,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| TransportError::Connect("no memory server listening".into()))?;

        debug!(%url, "Memory socket opened");

        Ok(Box::new(MemorySocket {
            to_server: to_server_tx,
            from_server: to_client_rx,
            is_open: true,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

impl MemoryServer {
    /// Wait for the next dialed peer.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Refuse the next `n` dials with a connect error.
    pub fn refuse_next(&self, n: u32) {
        self.plan.refuse_remaining.store(n, Ordering::SeqCst);
    }

    /// Reject every dial as unauthorized until turned off.
    pub fn reject_auth(&self, reject: bool) {
        self.plan.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Number of dials attempted so far, successful or not.
    #[must_use]
    pub fn dial_count(&self) -> usize {
        self.plan.dials.load(Ordering::SeqCst)
    }
}

/// The server's view of one memory socket.
///
/// Dropping the peer drops the connection without a close handshake.
pub struct MemoryPeer {
    url: Url,
    to_client: mpsc::UnboundedSender<ToClient>,
    from_client: mpsc::UnboundedReceiver<PeerEvent>,
}

impl MemoryPeer {
    /// The URL the client dialed.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Deliver a message to the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the client socket is gone.
    pub fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        self.to_client
            .send(ToClient::Message(message))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Wait for the next message or close from the client.
    ///
    /// Returns `None` once the client socket has been dropped.
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        self.from_client.recv().await
    }

    /// Take a client event if one is already queued.
    pub fn try_recv(&mut self) -> Option<PeerEvent> {
        self.from_client.try_recv().ok()
    }

    /// Close the connection from the server side.
    pub fn close(self, close: CloseInfo) {
        let _ = self.to_client.send(ToClient::Close(close));
    }
}

struct MemorySocket {
    to_server: mpsc::UnboundedSender<PeerEvent>,
    from_server: mpsc::UnboundedReceiver<ToClient>,
    is_open: bool,
}

#[async_trait]
impl Socket for MemorySocket {
    async fn recv(&mut self) -> Result<SocketEvent, TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        match self.from_server.recv().await {
            Some(ToClient::Message(message)) => Ok(SocketEvent::Message(message)),
            Some(ToClient::Close(close)) => {
                self.is_open = false;
                Ok(SocketEvent::Closed(close))
            }
            None => {
                self.is_open = false;
                Ok(SocketEvent::Closed(CloseInfo::abnormal("peer dropped")))
            }
        }
    }

    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }
        self.to_server
            .send(PeerEvent::Message(message))
            .map_err(|_| TransportError::SendFailed("peer dropped".into()))
    }

    async fn close(&mut self, close: CloseInfo) -> Result<(), TransportError> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;
        let _ = self.to_server.send(PeerEvent::Closed(close));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
