//! Request/response multiplexing over the shared socket.
//!
//! ```text
//!   call("rooms.list")                         inbound Response{id: 7}
//!        │                                               │
//!        ▼                                               ▼
//!   register ──► pending: DashMap<id, PendingCall> ◄── resolve
//!        │              ▲                                │
//!        ▼              │ guard removes on drop          ▼
//!   Request{id: 7}  PendingResponse::wait ◄──── oneshot::Sender
//! ```
//!
//! A call ends exactly once: with its response, its timeout, or a
//! connection-lost rejection. Correlation id equality is the only matching
//! criterion, and an id is never handed out while a call for it is pending.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use murmur_protocol::{CorrelationId, Frame, RpcResponse};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::ClientError;
use crate::metrics;

/// Draws before giving up on finding a free correlation id.
const MAX_ID_DRAWS: usize = 64;

/// Source of correlation ids.
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> u64;
}

impl<F> IdSource for F
where
    F: Fn() -> u64 + Send + Sync,
{
    fn next_id(&self) -> u64 {
        self()
    }
}

/// Monotonically increasing ids starting at 1.
#[derive(Debug)]
pub struct SequentialIds(AtomicU64);

impl SequentialIds {
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    #[must_use]
    pub fn starting_at(first: u64) -> Self {
        Self(AtomicU64::new(first))
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for SequentialIds {
    fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

type Reply = oneshot::Sender<Result<Value, ClientError>>;

struct PendingCall {
    /// Distinguishes this registration from a later one reusing its id.
    token: u64,
    method: String,
    created_at: Instant,
    reply: Reply,
}

type PendingTable = Arc<DashMap<CorrelationId, PendingCall>>;

/// Pending-call table plus id allocation.
pub struct RpcMultiplexer {
    ids: Box<dyn IdSource>,
    tokens: AtomicU64,
    pending: PendingTable,
    default_timeout: Duration,
}

impl RpcMultiplexer {
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self::with_id_source(default_timeout, Box::new(SequentialIds::new()))
    }

    #[must_use]
    pub fn with_id_source(default_timeout: Duration, ids: Box<dyn IdSource>) -> Self {
        Self {
            ids,
            tokens: AtomicU64::new(0),
            pending: Arc::new(DashMap::new()),
            default_timeout,
        }
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a call and build its Request frame.
    ///
    /// The caller sends the frame, then awaits [`PendingResponse::wait`].
    /// Dropping the `PendingResponse` unregisters the call.
    ///
    /// # Errors
    ///
    /// Fails if the id source keeps yielding ids that are still pending.
    pub fn register(
        &self,
        method: impl Into<String>,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<(Frame, PendingResponse), ClientError> {
        let method = method.into();
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (tx, rx) = oneshot::channel();
        let token = self.tokens.fetch_add(1, Ordering::Relaxed);

        let id = self.reserve(PendingCall {
            token,
            method: method.clone(),
            created_at: Instant::now(),
            reply: tx,
        })?;

        trace!(%id, %method, ?timeout, "Registered pending call");

        let frame = Frame::request(id, method.clone(), params);
        let pending = PendingResponse {
            id,
            method,
            timeout,
            rx,
            guard: PendingGuard {
                id,
                token,
                pending: Arc::clone(&self.pending),
            },
        };
        Ok((frame, pending))
    }

    fn reserve(&self, call: PendingCall) -> Result<CorrelationId, ClientError> {
        let method = call.method.clone();
        let mut call = Some(call);

        for _ in 0..MAX_ID_DRAWS {
            let id = CorrelationId::new(self.ids.next_id());
            let inserted = match self.pending.entry(id) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    if let Some(call) = call.take() {
                        slot.insert(call);
                    }
                    true
                }
            };

            if inserted {
                metrics::set_pending_calls(self.pending.len());
                return Ok(id);
            }
            warn!(%id, %method, "Correlation id still pending, drawing another");
        }

        Err(ClientError::Rpc {
            method,
            message: "no free correlation id".into(),
        })
    }

    /// Complete the call matching `response`.
    ///
    /// Hands the response back if no call is waiting for it (late or unknown
    /// id).
    pub fn resolve(&self, response: RpcResponse) -> Result<(), RpcResponse> {
        let Some((id, call)) = self.pending.remove(&response.id) else {
            debug!(id = %response.id, "Response for unknown or expired call");
            return Err(response);
        };
        metrics::set_pending_calls(self.pending.len());
        metrics::record_rpc_latency(call.created_at.elapsed());

        let outcome = if response.success {
            metrics::record_rpc_outcome("ok");
            Ok(response.result)
        } else {
            metrics::record_rpc_outcome("error");
            Err(ClientError::Rpc {
                method: call.method.clone(),
                message: response.error.unwrap_or_default(),
            })
        };

        trace!(%id, method = %call.method, success = response.success, "Resolved call");
        if call.reply.send(outcome).is_err() {
            trace!(%id, "Caller went away before the response arrived");
        }
        Ok(())
    }

    /// Reject every pending call with `error`. Returns how many were pending.
    pub fn reject_all(&self, error: ClientError) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|entry| *entry.key()).collect();

        let mut rejected = 0;
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                metrics::record_rpc_outcome("connection_lost");
                let _ = call.reply.send(Err(error.clone()));
                rejected += 1;
            }
        }

        if rejected > 0 {
            debug!(rejected, error = %error, "Rejected pending calls");
        }
        metrics::set_pending_calls(self.pending.len());
        rejected
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Ids of pending calls, sorted.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<CorrelationId> {
        let mut ids: Vec<CorrelationId> = self.pending.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.pending.contains_key(&id)
    }
}

impl std::fmt::Debug for RpcMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcMultiplexer")
            .field("pending", &self.pending.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

/// Removes the pending entry when the call is dropped or times out.
struct PendingGuard {
    id: CorrelationId,
    token: u64,
    pending: PendingTable,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        // The id may already belong to a newer call
        let token = self.token;
        if self
            .pending
            .remove_if(&self.id, |_, call| call.token == token)
            .is_some()
        {
            trace!(id = %self.id, "Unregistered pending call");
            metrics::set_pending_calls(self.pending.len());
        }
    }
}

/// The caller's half of a registered call.
#[must_use = "a call is unregistered as soon as its PendingResponse is dropped"]
pub struct PendingResponse {
    id: CorrelationId,
    method: String,
    timeout: Duration,
    rx: oneshot::Receiver<Result<Value, ClientError>>,
    guard: PendingGuard,
}

impl PendingResponse {
    #[must_use]
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait for the response, the timeout, or a connection-lost rejection.
    ///
    /// # Errors
    ///
    /// [`ClientError::RpcTimeout`], [`ClientError::Rpc`] or
    /// [`ClientError::ConnectionLost`].
    pub async fn wait(self) -> Result<Value, ClientError> {
        let PendingResponse {
            id,
            method,
            timeout,
            rx,
            guard,
        } = self;

        let outcome = tokio::time::timeout(timeout, rx).await;
        drop(guard);

        match outcome {
            Ok(Ok(result)) => result,
            // Sender dropped without an answer: the multiplexer is gone
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => {
                debug!(%id, %method, ?timeout, "Call timed out");
                metrics::record_rpc_outcome("timeout");
                Err(ClientError::RpcTimeout { method, timeout })
            }
        }
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn response_of(frame: &Frame, result: Value) -> RpcResponse {
        match frame {
            Frame::Request(request) => RpcResponse {
                id: request.id,
                success: true,
                result,
                error: None,
            },
            other => panic!("Expected request, got {:?}", other),
        }
    }

    fn scripted_ids(ids: &[u64]) -> Box<dyn IdSource> {
        let ids = Mutex::new(ids.iter().copied().collect::<VecDeque<u64>>());
        Box::new(move || ids.lock().unwrap().pop_front().unwrap_or(u64::MAX))
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let rpc = RpcMultiplexer::new(Duration::from_secs(5));
        let (frame, pending) = rpc.register("echo", json!({"text": "hi"}), None).unwrap();

        assert_eq!(frame.correlation_id(), Some(CorrelationId::new(1)));
        assert_eq!(rpc.pending_count(), 1);

        rpc.resolve(response_of(&frame, json!("hi"))).unwrap();
        assert_eq!(pending.wait().await.unwrap(), json!("hi"));
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_server_error_rejects_call() {
        let rpc = RpcMultiplexer::new(Duration::from_secs(5));
        let (frame, pending) = rpc.register("rooms.create", Value::Null, None).unwrap();
        let id = frame.correlation_id().unwrap();

        rpc.resolve(RpcResponse {
            id,
            success: false,
            result: Value::Null,
            error: Some("name taken".into()),
        })
        .unwrap();

        match pending.wait().await {
            Err(ClientError::Rpc { method, message }) => {
                assert_eq!(method, "rooms.create");
                assert_eq!(message, "name taken");
            }
            other => panic!("Expected RPC error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_calls_never_cross_resolve() {
        let rpc = RpcMultiplexer::new(Duration::from_secs(5));
        let calls: Vec<(Frame, PendingResponse)> = (0..8)
            .map(|n| rpc.register("echo", json!(n), None).unwrap())
            .collect();

        // Answer in reverse order, echoing each request's params
        for (frame, _) in calls.iter().rev() {
            let Frame::Request(request) = frame else {
                unreachable!()
            };
            rpc.resolve(response_of(frame, request.params.clone())).unwrap();
        }

        for (n, (_, pending)) in calls.into_iter().enumerate() {
            assert_eq!(pending.wait().await.unwrap(), json!(n));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let rpc = RpcMultiplexer::with_id_source(Duration::from_secs(5), scripted_ids(&[7, 7]));

        let (_, pending) = rpc
            .register("slow", Value::Null, Some(Duration::from_millis(250)))
            .unwrap();
        let started = Instant::now();
        match pending.wait().await {
            Err(ClientError::RpcTimeout { method, timeout }) => {
                assert_eq!(method, "slow");
                assert_eq!(timeout, Duration::from_millis(250));
            }
            other => panic!("Expected timeout, got {:?}", other),
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250));
        assert!(elapsed < Duration::from_millis(260));
        assert_eq!(rpc.pending_count(), 0);

        // The same id is free again
        let (frame, _pending) = rpc.register("slow", Value::Null, None).unwrap();
        assert_eq!(frame.correlation_id(), Some(CorrelationId::new(7)));
    }

    #[tokio::test]
    async fn test_stale_call_leaves_reused_id_alone() {
        let rpc = RpcMultiplexer::with_id_source(Duration::from_secs(5), scripted_ids(&[7, 7]));

        let (_, first) = rpc.register("first", Value::Null, None).unwrap();
        assert_eq!(rpc.reject_all(ClientError::ConnectionLost), 1);

        // Id 7 is free again while the first caller has not looked yet
        let (frame, second) = rpc.register("second", Value::Null, None).unwrap();
        assert_eq!(frame.correlation_id(), Some(CorrelationId::new(7)));

        assert!(matches!(first.wait().await, Err(ClientError::ConnectionLost)));
        assert!(rpc.is_pending(CorrelationId::new(7)));

        rpc.resolve(response_of(&frame, json!(42))).unwrap();
        assert_eq!(second.wait().await.unwrap(), json!(42));
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_id_is_never_reissued() {
        let rpc = RpcMultiplexer::with_id_source(Duration::from_secs(5), scripted_ids(&[3, 3, 4]));

        let (first, _a) = rpc.register("a", Value::Null, None).unwrap();
        let (second, _b) = rpc.register("b", Value::Null, None).unwrap();

        assert_eq!(first.correlation_id(), Some(CorrelationId::new(3)));
        assert_eq!(second.correlation_id(), Some(CorrelationId::new(4)));
        assert_eq!(rpc.pending_ids(), vec![CorrelationId::new(3), CorrelationId::new(4)]);
    }

    #[tokio::test]
    async fn test_id_exhaustion() {
        let rpc = RpcMultiplexer::with_id_source(Duration::from_secs(5), Box::new(|| 1u64));
        let (_, _held) = rpc.register("a", Value::Null, None).unwrap();
        assert!(matches!(
            rpc.register("b", Value::Null, None),
            Err(ClientError::Rpc { .. })
        ));
        assert_eq!(rpc.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_dropping_pending_unregisters() {
        let rpc = RpcMultiplexer::new(Duration::from_secs(5));
        let (frame, pending) = rpc.register("a", Value::Null, None).unwrap();
        assert_eq!(rpc.pending_count(), 1);

        drop(pending);
        assert_eq!(rpc.pending_count(), 0);

        // A late response is handed back
        assert!(rpc.resolve(response_of(&frame, Value::Null)).is_err());
    }

    #[tokio::test]
    async fn test_reject_all() {
        let rpc = RpcMultiplexer::new(Duration::from_secs(5));
        let calls: Vec<PendingResponse> = (0..3)
            .map(|_| rpc.register("a", Value::Null, None).unwrap().1)
            .collect();

        assert_eq!(rpc.reject_all(ClientError::ConnectionLost), 3);
        assert_eq!(rpc.pending_count(), 0);

        for pending in calls {
            assert!(matches!(pending.wait().await, Err(ClientError::ConnectionLost)));
        }
    }
}
