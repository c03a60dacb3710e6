//! Inbound frame routing: responses to the multiplexer, everything else to
//! the dispatcher.

use murmur_protocol::Frame;
use std::sync::Arc;
use tracing::{debug, info};

use crate::connection::InboundHandler;
use crate::dispatcher::EventDispatcher;
use crate::error::ClientError;
use crate::rpc::RpcMultiplexer;

/// Default [`InboundHandler`] wiring the connection to RPC and events.
#[derive(Debug, Clone)]
pub struct Router {
    rpc: Arc<RpcMultiplexer>,
    dispatcher: Arc<EventDispatcher>,
}

impl Router {
    #[must_use]
    pub fn new(rpc: Arc<RpcMultiplexer>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self { rpc, dispatcher }
    }
}

impl InboundHandler for Router {
    fn on_frame(&self, frame: Frame) {
        match frame {
            Frame::Response(response) => {
                if let Err(unmatched) = self.rpc.resolve(response) {
                    // Late or unsolicited; still visible to Response subscribers
                    self.dispatcher.dispatch(&Frame::Response(unmatched));
                }
            }
            frame => self.dispatcher.dispatch(&frame),
        }
    }

    fn on_connection_lost(&self) {
        let rejected = self.rpc.reject_all(ClientError::ConnectionLost);
        self.dispatcher.clear_derived();
        if rejected > 0 {
            info!(rejected, "Connection lost with calls in flight");
        } else {
            debug!("Connection lost");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_protocol::{FrameKind, PresenceStatus, PresenceUpdate, RoomRef};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn router() -> (Router, Arc<RpcMultiplexer>, Arc<EventDispatcher>) {
        let rpc = Arc::new(RpcMultiplexer::new(Duration::from_secs(5)));
        let dispatcher = Arc::new(EventDispatcher::new(Duration::from_secs(3)));
        (
            Router::new(Arc::clone(&rpc), Arc::clone(&dispatcher)),
            rpc,
            dispatcher,
        )
    }

    #[tokio::test]
    async fn test_response_resolves_call() {
        let (router, rpc, dispatcher) = router();
        let responses = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&responses);
        let _ = dispatcher.subscribe(FrameKind::Response, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (frame, pending) = rpc.register("echo", json!(1), None).unwrap();
        let id = frame.correlation_id().unwrap();
        router.on_frame(Frame::response_ok(id, json!(1)));

        assert_eq!(pending.wait().await.unwrap(), json!(1));
        assert_eq!(responses.load(Ordering::SeqCst), 0);

        // The same id again is unmatched and goes to subscribers
        router.on_frame(Frame::response_ok(id, Value::Null));
        assert_eq!(responses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_events_are_dispatched() {
        let (router, _, dispatcher) = router();
        let joins = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&joins);
        let _ = dispatcher.subscribe(FrameKind::JoinRoom, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        router.on_frame(Frame::JoinRoom(RoomRef {
            room_id: "r1".into(),
        }));
        assert_eq!(joins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_lost() {
        let (router, rpc, dispatcher) = router();
        let (_, pending) = rpc.register("slow", Value::Null, None).unwrap();
        router.on_frame(Frame::PresenceUpdate(PresenceUpdate {
            user_id: "u1".into(),
            status: PresenceStatus::Online,
            last_seen: 1,
        }));
        assert_eq!(dispatcher.presence().len(), 1);

        router.on_connection_lost();

        assert!(matches!(pending.wait().await, Err(ClientError::ConnectionLost)));
        assert_eq!(rpc.pending_count(), 0);
        assert!(dispatcher.presence().is_empty());
    }
}
