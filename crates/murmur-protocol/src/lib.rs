//! # murmur-protocol
//!
//! Wire protocol for the murmur realtime client.
//!
//! Frames travel over a single socket either as JSON text or in a compact
//! fixed-layout binary form. Both encodings implement [`Codec`] and are
//! interchangeable behind the connection manager.
//!
//! ## Frame kinds
//!
//! - `Request` / `Response` - RPC, paired by correlation id
//! - `ChatMessage`, `PresenceUpdate`, `Typing`, `RoomEvent` - server events
//! - `JoinRoom` / `LeaveRoom` - room membership
//! - `Ping` / `Pong` - keepalive
//!
//! ## Example
//!
//! ```rust
//! use murmur_protocol::{CodecKind, CorrelationId, Frame};
//! use serde_json::json;
//!
//! let frame = Frame::request(CorrelationId::new(1), "rooms.list", json!({"limit": 20}));
//!
//! for kind in [CodecKind::Json, CodecKind::Binary] {
//!     let codec = kind.codec();
//!     let encoded = codec.encode(&frame).unwrap();
//!     assert_eq!(codec.decode(&encoded).unwrap(), frame);
//! }
//! ```

pub mod binary;
pub mod codec;
pub mod frames;
pub mod json;
pub mod payload;
pub mod version;

pub use binary::BinaryCodec;
pub use codec::{Codec, CodecKind, ProtocolError, WireMessage, MAX_FRAME_SIZE};
pub use frames::{now_millis, CorrelationId, Frame, FrameKind};
pub use json::TextCodec;
pub use payload::{
    Attachment, ChatMessage, Heartbeat, PresenceStatus, PresenceUpdate, RoomEvent, RoomRef,
    RpcRequest, RpcResponse, TypingEvent,
};
pub use version::{Version, PROTOCOL_VERSION};
