//! End-to-end client behavior over the in-memory transport.
//!
//! Time is paused in most tests so reconnect delays, heartbeats and
//! timeouts run instantly and deterministically.

use murmur_client::protocol::{
    ChatMessage, Codec, CodecKind, CorrelationId, Frame, Heartbeat, PresenceStatus,
    PresenceUpdate, TypingEvent, WireMessage,
};
use murmur_client::transport::memory::{self, MemoryPeer, MemoryServer, PeerEvent};
use murmur_client::transport::{CloseInfo, CLOSE_NORMAL, CLOSE_UNAUTHORIZED};
use murmur_client::{
    ClientConfig, ClientError, ConnectionState, RealtimeClient, RealtimeClientBuilder,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> ClientConfig {
    ClientConfig::new("ws://memory.test/ws")
}

fn chat(room_id: &str, content: &str) -> ChatMessage {
    ChatMessage {
        id: format!("m-{content}"),
        room_id: room_id.into(),
        sender_id: "u2".into(),
        sender_name: "Bea".into(),
        content: content.into(),
        timestamp: 1_700_000_000_000,
        attachments: Vec::new(),
        mentions: Vec::new(),
        reply_to: None,
    }
}

struct Harness {
    client: Arc<RealtimeClient>,
    server: MemoryServer,
    codec: Arc<dyn Codec>,
}

fn harness(config: ClientConfig) -> Harness {
    harness_with(config, |builder| builder)
}

fn harness_with(
    config: ClientConfig,
    customize: impl FnOnce(RealtimeClientBuilder) -> RealtimeClientBuilder,
) -> Harness {
    init_tracing();
    let (connector, server) = memory::pair();
    let codec = config.codec.codec();
    let builder = RealtimeClient::builder(config).connector(connector);
    let client = customize(builder).build().unwrap();
    Harness {
        client: Arc::new(client),
        server,
        codec,
    }
}

impl Harness {
    async fn connect(&mut self) -> MemoryPeer {
        self.client.connect().await.unwrap();
        self.server.accept().await.unwrap()
    }

    /// Next frame from the client, heartbeats included.
    async fn next_raw(&self, peer: &mut MemoryPeer) -> Frame {
        match peer.recv().await {
            Some(PeerEvent::Message(message)) => self.codec.decode(&message).unwrap(),
            other => panic!("expected a message, got {other:?}"),
        }
    }

    /// Next frame from the client, skipping heartbeats.
    async fn next_frame(&self, peer: &mut MemoryPeer) -> Frame {
        loop {
            match self.next_raw(peer).await {
                Frame::Ping(_) | Frame::Pong(_) => continue,
                frame => return frame,
            }
        }
    }

    /// Next close from the client, skipping messages.
    async fn next_close(&self, peer: &mut MemoryPeer) -> CloseInfo {
        loop {
            match peer.recv().await {
                Some(PeerEvent::Message(_)) => continue,
                Some(PeerEvent::Closed(close)) => return close,
                None => panic!("client dropped the socket without closing"),
            }
        }
    }

    fn push(&self, peer: &MemoryPeer, frame: Frame) {
        peer.send(self.codec.encode(&frame).unwrap()).unwrap();
    }

    /// Round-trip a ping so every frame pushed before it has been routed.
    async fn sync(&self, peer: &mut MemoryPeer, marker: u64) {
        self.push(
            peer,
            Frame::Ping(Heartbeat {
                timestamp: Some(marker),
            }),
        );
        loop {
            if let Frame::Pong(Heartbeat {
                timestamp: Some(seen),
            }) = self.next_raw(peer).await
            {
                if seen == marker {
                    return;
                }
            }
        }
    }

    fn spawn_call(
        &self,
        method: &'static str,
        params: Value,
    ) -> tokio::task::JoinHandle<murmur_client::Result<Value>> {
        let client = Arc::clone(&self.client);
        tokio::spawn(async move { client.call(method, params).await })
    }
}

fn record_states(client: &RealtimeClient) -> Arc<Mutex<Vec<(ConnectionState, Instant)>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    client.on_connection_change(move |state| {
        sink.lock().unwrap().push((state, Instant::now()));
    });
    log
}

#[tokio::test]
async fn test_chat_message_after_join_is_delivered_once() {
    let mut h = harness(config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _ = h.client.on_chat_message(move |message| {
        let _ = tx.send(message.clone());
    });

    let mut peer = h.connect().await;
    h.client.join_room("r1").unwrap();
    assert_eq!(h.next_frame(&mut peer).await, Frame::join_room("r1"));

    h.push(&peer, Frame::ChatMessage(chat("r1", "hello")));
    let received = rx.recv().await.unwrap();
    assert_eq!(received.room_id, "r1");
    assert_eq!(received.content, "hello");

    h.sync(&mut peer, 1).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_concurrent_calls_resolve_by_correlation_id() {
    let mut h = harness(config());
    let mut peer = h.connect().await;

    let calls: Vec<_> = (0..10)
        .map(|n| h.spawn_call("echo", json!({ "n": n })))
        .collect();

    let mut requests = Vec::new();
    for _ in 0..10 {
        match h.next_frame(&mut peer).await {
            Frame::Request(request) => requests.push(request),
            other => panic!("expected a request, got {other:?}"),
        }
    }
    assert_eq!(h.client.pending_calls(), 10);

    // Answer in reverse order
    for request in requests.into_iter().rev() {
        h.push(&peer, Frame::response_ok(request.id, request.params.clone()));
    }

    for (n, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), json!({ "n": n }));
    }
    assert_eq!(h.client.pending_calls(), 0);
}

#[tokio::test]
async fn test_error_response_fails_call() {
    let mut h = harness(config());
    let mut peer = h.connect().await;

    let call = h.spawn_call("rooms.delete", json!({ "roomId": "r1" }));
    let Frame::Request(request) = h.next_frame(&mut peer).await else {
        panic!("expected a request");
    };
    h.push(&peer, Frame::response_err(request.id, "forbidden"));

    match call.await.unwrap() {
        Err(ClientError::Rpc { method, message }) => {
            assert_eq!(method, "rooms.delete");
            assert_eq!(message, "forbidden");
        }
        other => panic!("expected an RPC error, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_call_frees_its_correlation_id() {
    let ids = Mutex::new(VecDeque::from([7u64, 7]));
    let mut h = harness_with(config(), move |builder| {
        builder.id_source(move || ids.lock().unwrap().pop_front().unwrap_or(100))
    });
    let mut peer = h.connect().await;

    let started = Instant::now();
    let result = h
        .client
        .call_with_timeout("slow", Value::Null, Duration::from_secs(5))
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(ClientError::RpcTimeout { .. })));
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(6));
    assert_eq!(h.client.pending_calls(), 0);

    let Frame::Request(first) = h.next_frame(&mut peer).await else {
        panic!("expected a request");
    };
    assert_eq!(first.id, CorrelationId::new(7));

    // The same id is free again and must not collide
    let call = h.spawn_call("slow", json!("again"));
    let Frame::Request(second) = h.next_frame(&mut peer).await else {
        panic!("expected a request");
    };
    assert_eq!(second.id, CorrelationId::new(7));

    h.push(&peer, Frame::response_ok(second.id, json!("again")));
    assert_eq!(call.await.unwrap().unwrap(), json!("again"));
}

#[tokio::test(start_paused = true)]
async fn test_abnormal_close_rejects_calls_and_reconnects() {
    let mut h = harness(config());
    let states = record_states(&h.client);
    let mut peer = h.connect().await;

    let calls: Vec<_> = (0..3).map(|n| h.spawn_call("slow", json!(n))).collect();
    for _ in 0..3 {
        assert!(matches!(h.next_frame(&mut peer).await, Frame::Request(_)));
    }
    assert_eq!(h.client.pending_calls(), 3);

    drop(peer);

    for call in calls {
        assert!(matches!(
            call.await.unwrap(),
            Err(ClientError::ConnectionLost)
        ));
    }

    let mut peer = h.server.accept().await.unwrap();
    let mut watch = h.client.watch_state();
    watch
        .wait_for(|state| *state == ConnectionState::Connected)
        .await
        .unwrap();
    assert_eq!(h.client.pending_calls(), 0);
    assert_eq!(h.server.dial_count(), 2);

    let observed: Vec<_> = states.lock().unwrap().iter().map(|(s, _)| *s).collect();
    assert_eq!(
        observed,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );

    // The new connection serves calls
    let call = h.spawn_call("echo", json!("back"));
    let Frame::Request(request) = h.next_frame(&mut peer).await else {
        panic!("expected a request");
    };
    h.push(&peer, Frame::response_ok(request.id, json!("back")));
    assert_eq!(call.await.unwrap().unwrap(), json!("back"));
}

#[tokio::test(start_paused = true)]
async fn test_presence_is_cleared_on_connection_loss() {
    let mut h = harness(config());
    let mut peer = h.connect().await;

    h.push(
        &peer,
        Frame::PresenceUpdate(PresenceUpdate {
            user_id: "u1".into(),
            status: PresenceStatus::Away,
            last_seen: 1,
        }),
    );
    h.sync(&mut peer, 1).await;
    assert_eq!(h.client.presence().status("u1"), Some(PresenceStatus::Away));

    drop(peer);
    let _peer = h.server.accept().await.unwrap();
    assert!(h.client.presence().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_typing_indicator_expires_locally() {
    let mut h = harness(config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _ = h.client.on_typing(move |event| {
        let _ = tx.send((event.clone(), Instant::now()));
    });
    let peer = h.connect().await;

    let typing = |is_typing| {
        Frame::Typing(TypingEvent {
            user_id: "u1".into(),
            room_id: "r1".into(),
            is_typing,
            timestamp: 1,
        })
    };

    h.push(&peer, typing(true));
    let (started, at) = rx.recv().await.unwrap();
    assert!(started.is_typing);
    assert!(h.client.typing().is_typing("r1", "u1"));

    // A refresh after 2s pushes the expiry out to 5s
    tokio::time::sleep(Duration::from_secs(2)).await;
    h.push(&peer, typing(true));
    let (refreshed, _) = rx.recv().await.unwrap();
    assert!(refreshed.is_typing);

    let (expired, expired_at) = rx.recv().await.unwrap();
    assert!(!expired.is_typing);
    assert_eq!(expired.user_id, "u1");
    assert_eq!(expired.room_id, "r1");
    assert!(expired_at.duration_since(at) >= Duration::from_secs(5));
    assert!(!h.client.typing().is_typing("r1", "u1"));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_delays_double_and_reset() {
    let mut h = harness(config());
    let states = record_states(&h.client);
    let peer = h.connect().await;

    let connecting_offsets = |since: Instant| -> Vec<u128> {
        states
            .lock()
            .unwrap()
            .iter()
            .filter(|(state, _)| *state == ConnectionState::Connecting)
            .map(|(_, at)| at.duration_since(since).as_millis())
            .collect()
    };

    states.lock().unwrap().clear();
    h.server.refuse_next(3);
    let dropped_at = Instant::now();
    drop(peer);

    let peer = h.server.accept().await.unwrap();
    let mut watch = h.client.watch_state();
    watch
        .wait_for(|state| *state == ConnectionState::Connected)
        .await
        .unwrap();

    let offsets = connecting_offsets(dropped_at);
    let expected = [1_000, 3_000, 7_000, 15_000];
    assert_eq!(offsets.len(), expected.len(), "{offsets:?}");
    for (offset, expected) in offsets.iter().zip(expected) {
        assert!(
            *offset >= expected && *offset < expected + 10,
            "{offsets:?}"
        );
    }
    assert_eq!(h.server.dial_count(), 5);
    assert_eq!(h.client.reconnect_attempt(), 0);

    // The counter reset: the next loss waits the base delay again
    states.lock().unwrap().clear();
    let dropped_at = Instant::now();
    drop(peer);

    let _peer = h.server.accept().await.unwrap();
    let offsets = connecting_offsets(dropped_at);
    assert_eq!(offsets.len(), 1);
    assert!(offsets[0] >= 1_000 && offsets[0] < 1_010, "{offsets:?}");
}

#[tokio::test(start_paused = true)]
async fn test_auth_rejection_is_terminal() {
    let mut h = harness(config());
    h.server.reject_auth(true);

    assert!(matches!(h.client.connect().await, Err(ClientError::Auth(_))));
    assert_eq!(h.client.state(), ConnectionState::Error);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.server.dial_count(), 1);
    assert_eq!(h.client.state(), ConnectionState::Error);
    assert!(matches!(
        h.client.send(Frame::join_room("r1")),
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_close_is_terminal() {
    let mut h = harness(config());
    let (tx, mut errors) = mpsc::unbounded_channel();
    h.client.on_error(move |error| {
        let _ = tx.send(error.clone());
    });
    let mut peer = h.connect().await;

    let call = h.spawn_call("slow", Value::Null);
    assert!(matches!(h.next_frame(&mut peer).await, Frame::Request(_)));

    peer.close(CloseInfo::new(CLOSE_UNAUTHORIZED, "token expired"));

    assert!(matches!(
        call.await.unwrap(),
        Err(ClientError::ConnectionLost)
    ));
    let mut watch = h.client.watch_state();
    watch
        .wait_for(|state| *state == ConnectionState::Error)
        .await
        .unwrap();
    assert!(matches!(errors.recv().await, Some(ClientError::Auth(_))));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.server.dial_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_attempts_end_in_error() {
    let mut config = config();
    config.reconnect.max_attempts = 2;
    let mut h = harness(config);
    let peer = h.connect().await;

    h.server.refuse_next(10);
    drop(peer);

    let mut watch = h.client.watch_state();
    watch
        .wait_for(|state| *state == ConnectionState::Reconnecting)
        .await
        .unwrap();

    // Queued while offline, rejected when the client gives up
    let call = h.spawn_call("queued", Value::Null);

    watch
        .wait_for(|state| *state == ConnectionState::Error)
        .await
        .unwrap();
    assert!(matches!(
        call.await.unwrap(),
        Err(ClientError::ConnectionLost)
    ));
    assert_eq!(h.server.dial_count(), 3);
    assert_eq!(h.client.pending_calls(), 0);

    // An explicit connect starts over
    h.server.refuse_next(0);
    h.client.connect().await.unwrap();
    assert_eq!(h.client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_refused_dial_without_reconnect_ends_disconnected() {
    let mut config = config();
    config.reconnect.enabled = false;
    let h = harness(config);
    h.server.refuse_next(1);

    assert!(matches!(
        h.client.connect().await,
        Err(ClientError::Connection(_))
    ));
    assert_eq!(h.client.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.server.dial_count(), 1);
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_abnormal_close_without_reconnect_ends_disconnected() {
    let mut config = config();
    config.reconnect.enabled = false;
    let mut h = harness(config);
    let mut peer = h.connect().await;

    let calls: Vec<_> = (0..2).map(|n| h.spawn_call("slow", json!(n))).collect();
    for _ in 0..2 {
        assert!(matches!(h.next_frame(&mut peer).await, Frame::Request(_)));
    }

    drop(peer);

    for call in calls {
        assert!(matches!(
            call.await.unwrap(),
            Err(ClientError::ConnectionLost)
        ));
    }
    let mut watch = h.client.watch_state();
    watch
        .wait_for(|state| *state == ConnectionState::Disconnected)
        .await
        .unwrap();
    assert_eq!(h.client.pending_calls(), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.server.dial_count(), 1);
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_closes_normally_and_stays_down() {
    let mut h = harness(config());
    let mut peer = h.connect().await;

    let calls: Vec<_> = (0..2).map(|n| h.spawn_call("slow", json!(n))).collect();
    for _ in 0..2 {
        assert!(matches!(h.next_frame(&mut peer).await, Frame::Request(_)));
    }

    h.client.disconnect().await;

    for call in calls {
        assert!(matches!(
            call.await.unwrap(),
            Err(ClientError::ConnectionLost)
        ));
    }
    assert_eq!(h.next_close(&mut peer).await.code, CLOSE_NORMAL);
    assert_eq!(h.client.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.server.dial_count(), 1);
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert!(matches!(
        h.client.send(Frame::join_room("r1")),
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_server_normal_close_does_not_reconnect() {
    let mut h = harness(config());
    let peer = h.connect().await;

    peer.close(CloseInfo::new(CLOSE_NORMAL, "maintenance"));

    let mut watch = h.client.watch_state();
    watch
        .wait_for(|state| *state == ConnectionState::Disconnected)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.server.dial_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_queued_frames_flush_before_room_replay() {
    let mut h = harness(config());
    let mut peer = h.connect().await;
    h.client.join_room("r1").unwrap();
    assert_eq!(h.next_frame(&mut peer).await, Frame::join_room("r1"));

    drop(peer);
    let mut watch = h.client.watch_state();
    watch
        .wait_for(|state| *state == ConnectionState::Reconnecting)
        .await
        .unwrap();

    h.client.send_chat_message(chat("r2", "first")).unwrap();
    h.client.join_room("r2").unwrap();
    h.client.send_chat_message(chat("r2", "second")).unwrap();

    let mut peer = h.server.accept().await.unwrap();
    let mut frames = Vec::new();
    for _ in 0..4 {
        frames.push(h.next_frame(&mut peer).await);
    }
    assert_eq!(
        frames,
        vec![
            Frame::ChatMessage(chat("r2", "first")),
            Frame::join_room("r2"),
            Frame::ChatMessage(chat("r2", "second")),
            Frame::join_room("r1"),
        ]
    );
    assert_eq!(h.client.rooms(), vec!["r1".to_string(), "r2".to_string()]);
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    let mut h = harness(config());
    let (error_tx, mut errors) = mpsc::unbounded_channel();
    h.client.on_error(move |error| {
        let _ = error_tx.send(error.clone());
    });
    let (chat_tx, mut chats) = mpsc::unbounded_channel();
    let _ = h.client.on_chat_message(move |message| {
        let _ = chat_tx.send(message.content.clone());
    });
    let peer = h.connect().await;

    peer.send(WireMessage::Text("{not json".into())).unwrap();
    peer.send(WireMessage::Text(r#"{"kind":"teleport"}"#.into()))
        .unwrap();
    h.push(&peer, Frame::ChatMessage(chat("r1", "still here")));

    assert_eq!(chats.recv().await.unwrap(), "still here");
    for _ in 0..2 {
        assert!(matches!(
            errors.recv().await,
            Some(ClientError::Protocol(_))
        ));
    }
    assert_eq!(h.client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_and_ping_reply() {
    let mut h = harness(config());
    let mut peer = h.connect().await;
    let connected_at = Instant::now();

    assert!(matches!(h.next_raw(&mut peer).await, Frame::Ping(_)));
    assert!(connected_at.elapsed() >= Duration::from_secs(30));

    h.push(
        &peer,
        Frame::Ping(Heartbeat {
            timestamp: Some(42),
        }),
    );
    assert_eq!(h.next_raw(&mut peer).await, Frame::pong(Some(42)));
    assert!(h.client.last_seen().is_some());
}

#[tokio::test]
async fn test_binary_codec_end_to_end() {
    let mut config = config();
    config.codec = CodecKind::Binary;
    let mut h = harness(config);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _ = h.client.on_chat_message(move |message| {
        let _ = tx.send(message.clone());
    });
    let mut peer = h.connect().await;

    let call = h.spawn_call("echo", json!({ "nested": [1, 2, 3] }));
    let Frame::Request(request) = h.next_frame(&mut peer).await else {
        panic!("expected a request");
    };
    h.push(&peer, Frame::response_ok(request.id, request.params.clone()));
    assert_eq!(
        call.await.unwrap().unwrap(),
        json!({ "nested": [1, 2, 3] })
    );

    h.push(&peer, Frame::ChatMessage(chat("r1", "binary")));
    assert_eq!(rx.recv().await.unwrap(), chat("r1", "binary"));
}

#[tokio::test(start_paused = true)]
async fn test_token_is_fetched_for_every_dial() {
    let dials = AtomicU32::new(0);
    let mut h = harness_with(config(), move |builder| {
        builder.token_provider(move || {
            let dial = dials.fetch_add(1, Ordering::SeqCst);
            Some(format!("token-{dial}"))
        })
    });

    let token = |peer: &MemoryPeer| {
        peer.url()
            .query_pairs()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
    };

    let peer = h.connect().await;
    assert_eq!(token(&peer).as_deref(), Some("token-0"));

    drop(peer);
    let peer = h.server.accept().await.unwrap();
    assert_eq!(token(&peer).as_deref(), Some("token-1"));
}

#[tokio::test]
async fn test_typed_call() {
    #[derive(serde::Serialize)]
    struct Lookup<'a> {
        user_id: &'a str,
    }

    #[derive(Debug, PartialEq, serde::Deserialize)]
    struct Profile {
        name: String,
    }

    let mut h = harness(config());
    let mut peer = h.connect().await;

    let client = Arc::clone(&h.client);
    let call = tokio::spawn(async move {
        client
            .call_typed::<_, Profile>("users.get", &Lookup { user_id: "u1" })
            .await
    });
    let Frame::Request(request) = h.next_frame(&mut peer).await else {
        panic!("expected a request");
    };
    assert_eq!(request.params, json!({ "user_id": "u1" }));
    h.push(&peer, Frame::response_ok(request.id, json!({ "name": "Ada" })));

    assert_eq!(
        call.await.unwrap().unwrap(),
        Profile { name: "Ada".into() }
    );
}
