//! JSON text codec.
//!
//! One JSON object per message, tagged by `kind`. Peers that tag with
//! `type` instead are accepted on decode.

use serde_json::Value;

use crate::codec::{Codec, ProtocolError, WireMessage, MAX_FRAME_SIZE};
use crate::frames::{Frame, FrameKind};

/// Text codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextCodec;

impl TextCodec {
    /// Create a new codec instance.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Codec for TextCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, frame: &Frame) -> Result<WireMessage, ProtocolError> {
        encode(frame).map(WireMessage::Text)
    }

    fn decode(&self, message: &WireMessage) -> Result<Frame, ProtocolError> {
        match message {
            WireMessage::Text(text) => decode(text),
            // Some servers send JSON in binary messages.
            WireMessage::Binary(data) => decode(std::str::from_utf8(data)?),
        }
    }
}

/// Encode a frame to a JSON string.
///
/// # Errors
///
/// Returns an error if the frame is invalid or too large.
pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    frame.validate()?;
    let text = serde_json::to_string(frame)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a frame from a JSON string.
///
/// # Errors
///
/// Returns an error if the text is not a JSON object, has no known kind tag,
/// or does not match the schema of its kind.
pub fn decode(text: &str) -> Result<Frame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    let mut value: Value = serde_json::from_str(text)?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| ProtocolError::Invalid("frame is not a JSON object".into()))?;

    if !object.contains_key("kind") {
        if let Some(tag) = object.remove("type") {
            object.insert("kind".into(), tag);
        }
    }

    match object.get("kind").and_then(Value::as_str) {
        None => return Err(ProtocolError::Invalid("missing kind tag".into())),
        Some(tag) if FrameKind::from_tag(tag).is_none() => {
            return Err(ProtocolError::UnknownKind(tag.to_string()));
        }
        Some(_) => {}
    }

    let frame: Frame = serde_json::from_value(value)?;
    frame.validate()?;
    Ok(frame)
}
