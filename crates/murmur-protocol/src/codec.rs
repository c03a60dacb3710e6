//! Codec abstraction shared by the text and binary encodings.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::binary::BinaryCodec;
use crate::frames::Frame;
use crate::json::TextCodec;
use crate::version::Version;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// The kind tag is not one this protocol knows.
    #[error("Unknown frame kind: {0}")]
    UnknownKind(String),

    /// Binary frame written by an incompatible protocol version.
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(Version),

    /// The message type does not match the codec.
    #[error("Expected a {expected} message")]
    WrongMessageType {
        /// What the codec accepts.
        expected: &'static str,
    },

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// A string field is not valid UTF-8.
    #[error("Invalid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// A message as carried by the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
}

impl WireMessage {
    /// Length of the message in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(text) => text.len(),
            WireMessage::Binary(data) => data.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encodes frames to wire messages and back.
///
/// Implementations are stateless; `decode(encode(f)) == f` for every frame
/// that passes [`Frame::validate`].
pub trait Codec: Send + Sync + fmt::Debug {
    /// Codec name, for logs.
    fn name(&self) -> &'static str;

    /// Encode a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is invalid, too large, or cannot be
    /// serialized.
    fn encode(&self, frame: &Frame) -> Result<WireMessage, ProtocolError>;

    /// Decode a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is malformed or the frame invalid.
    fn decode(&self, message: &WireMessage) -> Result<Frame, ProtocolError>;
}

/// Selects a codec implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// JSON text frames.
    #[default]
    Json,
    /// Fixed-layout binary frames.
    Binary,
}

impl CodecKind {
    /// Build the codec for this kind.
    #[must_use]
    pub fn codec(self) -> Arc<dyn Codec> {
        match self {
            CodecKind::Json => Arc::new(TextCodec::new()),
            CodecKind::Binary => Arc::new(BinaryCodec::new()),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecKind::Json => f.write_str("json"),
            CodecKind::Binary => f.write_str("binary"),
        }
    }
}

impl FromStr for CodecKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" | "text" => Ok(CodecKind::Json),
            "binary" => Ok(CodecKind::Binary),
            other => Err(format!("unknown codec: {other}")),
        }
    }
}
