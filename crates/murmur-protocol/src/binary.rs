//! Fixed-layout binary codec.
//!
//! Every frame starts with a 20-byte header:
//!
//! ```text
//! 0      1      2     3      4                  12                 20
//! ┌──────┬──────┬─────┬──────┬──────────────────┬──────────────────┬──────┐
//! │major │minor │ tag │flags │ correlation u64  │ timestamp u64    │ body │
//! └──────┴──────┴─────┴──────┴──────────────────┴──────────────────┴──────┘
//! ```
//!
//! Integers are big-endian. The body holds the kind-specific fields in a
//! fixed order: strings are `u32` length-prefixed UTF-8, optional fields
//! carry a presence byte, lists a `u32` count, and free-form JSON values
//! are `u32` length-prefixed MessagePack.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::codec::{Codec, ProtocolError, WireMessage, MAX_FRAME_SIZE};
use crate::frames::{CorrelationId, Frame, FrameKind};
use crate::payload::{
    Attachment, ChatMessage, Heartbeat, PresenceStatus, PresenceUpdate, RoomEvent, RoomRef,
    RpcRequest, RpcResponse, TypingEvent,
};
use crate::version::{Version, PROTOCOL_VERSION};

/// Header size in bytes.
pub const HEADER_SIZE: usize = 20;

const FLAG_CORRELATION: u8 = 0b0000_0001;
const FLAG_TIMESTAMP: u8 = 0b0000_0010;
const KNOWN_FLAGS: u8 = FLAG_CORRELATION | FLAG_TIMESTAMP;

/// Binary codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryCodec;

impl BinaryCodec {
    /// Create a new codec instance.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Codec for BinaryCodec {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn encode(&self, frame: &Frame) -> Result<WireMessage, ProtocolError> {
        encode(frame).map(WireMessage::Binary)
    }

    fn decode(&self, message: &WireMessage) -> Result<Frame, ProtocolError> {
        match message {
            WireMessage::Binary(data) => decode(data),
            WireMessage::Text(_) => Err(ProtocolError::WrongMessageType { expected: "binary" }),
        }
    }
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if the frame is invalid or too large.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    frame.validate()?;

    let mut body = BytesMut::new();
    let (correlation, timestamp) = match frame {
        Frame::Request(request) => {
            put_str(&mut body, &request.method);
            put_value(&mut body, &request.params)?;
            (Some(request.id), Some(request.timestamp))
        }
        Frame::Response(response) => {
            body.put_u8(u8::from(response.success));
            put_value(&mut body, &response.result)?;
            put_opt_str(&mut body, response.error.as_deref());
            (Some(response.id), None)
        }
        Frame::ChatMessage(message) => {
            put_str(&mut body, &message.id);
            put_str(&mut body, &message.room_id);
            put_str(&mut body, &message.sender_id);
            put_str(&mut body, &message.sender_name);
            put_str(&mut body, &message.content);
            put_opt_str(&mut body, message.reply_to.as_deref());
            body.put_u32(message.attachments.len() as u32);
            for attachment in &message.attachments {
                put_str(&mut body, &attachment.id);
                put_str(&mut body, &attachment.name);
                put_str(&mut body, &attachment.url);
                put_str(&mut body, &attachment.content_type);
                body.put_u64(attachment.size);
            }
            body.put_u32(message.mentions.len() as u32);
            for mention in &message.mentions {
                put_str(&mut body, mention);
            }
            (None, Some(message.timestamp))
        }
        Frame::PresenceUpdate(update) => {
            put_str(&mut body, &update.user_id);
            body.put_u8(update.status.into());
            (None, Some(update.last_seen))
        }
        Frame::Typing(typing) => {
            put_str(&mut body, &typing.user_id);
            put_str(&mut body, &typing.room_id);
            body.put_u8(u8::from(typing.is_typing));
            (None, Some(typing.timestamp))
        }
        Frame::RoomEvent(event) => {
            put_str(&mut body, &event.room_id);
            put_str(&mut body, &event.event);
            put_opt_str(&mut body, event.user_id.as_deref());
            put_value(&mut body, &event.data)?;
            (None, Some(event.timestamp))
        }
        Frame::JoinRoom(room) | Frame::LeaveRoom(room) => {
            put_str(&mut body, &room.room_id);
            (None, None)
        }
        Frame::Ping(heartbeat) | Frame::Pong(heartbeat) => (None, heartbeat.timestamp),
    };

    let total = HEADER_SIZE + body.len();
    if total > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(total));
    }

    let mut flags = 0;
    if correlation.is_some() {
        flags |= FLAG_CORRELATION;
    }
    if timestamp.is_some() {
        flags |= FLAG_TIMESTAMP;
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(&PROTOCOL_VERSION.to_bytes());
    buf.put_u8(frame.kind().into());
    buf.put_u8(flags);
    buf.put_u64(correlation.map_or(0, CorrelationId::get));
    buf.put_u64(timestamp.unwrap_or(0));
    buf.extend_from_slice(&body);

    Ok(buf.freeze())
}

/// Decode a frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is truncated, has trailing bytes, was written
/// by an incompatible version, or holds an invalid frame.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }
    if data.len() < HEADER_SIZE {
        return Err(ProtocolError::Incomplete(HEADER_SIZE - data.len()));
    }

    let mut reader = Reader { buf: data };
    let version = Version::from_bytes([reader.u8()?, reader.u8()?]);
    if !PROTOCOL_VERSION.can_read(version) {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let tag = reader.u8()?;
    let kind = FrameKind::try_from(tag)
        .map_err(|_| ProtocolError::UnknownKind(format!("0x{tag:02x}")))?;
    let flags = reader.u8()?;
    if flags & !KNOWN_FLAGS != 0 {
        return Err(ProtocolError::Invalid(format!("unknown flags 0b{flags:08b}")));
    }
    let raw_id = reader.u64()?;
    let raw_timestamp = reader.u64()?;
    let correlation = (flags & FLAG_CORRELATION != 0).then_some(CorrelationId(raw_id));
    let timestamp = (flags & FLAG_TIMESTAMP != 0).then_some(raw_timestamp);

    let frame = match kind {
        FrameKind::Request => Frame::Request(RpcRequest {
            id: required(correlation, "correlation id")?,
            method: reader.string()?,
            params: reader.value()?,
            timestamp: required(timestamp, "timestamp")?,
        }),
        FrameKind::Response => Frame::Response(RpcResponse {
            id: required(correlation, "correlation id")?,
            success: reader.bool()?,
            result: reader.value()?,
            error: reader.opt_string()?,
        }),
        FrameKind::ChatMessage => {
            let id = reader.string()?;
            let room_id = reader.string()?;
            let sender_id = reader.string()?;
            let sender_name = reader.string()?;
            let content = reader.string()?;
            let reply_to = reader.opt_string()?;
            let attachment_count = reader.count()?;
            let mut attachments = Vec::with_capacity(attachment_count);
            for _ in 0..attachment_count {
                attachments.push(Attachment {
                    id: reader.string()?,
                    name: reader.string()?,
                    url: reader.string()?,
                    content_type: reader.string()?,
                    size: reader.u64()?,
                });
            }
            let mention_count = reader.count()?;
            let mut mentions = Vec::with_capacity(mention_count);
            for _ in 0..mention_count {
                mentions.push(reader.string()?);
            }
            Frame::ChatMessage(ChatMessage {
                id,
                room_id,
                sender_id,
                sender_name,
                content,
                timestamp: required(timestamp, "timestamp")?,
                attachments,
                mentions,
                reply_to,
            })
        }
        FrameKind::PresenceUpdate => {
            let user_id = reader.string()?;
            let raw_status = reader.u8()?;
            let status = PresenceStatus::try_from(raw_status)
                .map_err(|e| ProtocolError::Invalid(format!("{e}: {raw_status}")))?;
            Frame::PresenceUpdate(PresenceUpdate {
                user_id,
                status,
                last_seen: required(timestamp, "timestamp")?,
            })
        }
        FrameKind::Typing => Frame::Typing(TypingEvent {
            user_id: reader.string()?,
            room_id: reader.string()?,
            is_typing: reader.bool()?,
            timestamp: required(timestamp, "timestamp")?,
        }),
        FrameKind::RoomEvent => Frame::RoomEvent(RoomEvent {
            room_id: reader.string()?,
            event: reader.string()?,
            user_id: reader.opt_string()?,
            data: reader.value()?,
            timestamp: required(timestamp, "timestamp")?,
        }),
        FrameKind::JoinRoom => Frame::JoinRoom(RoomRef {
            room_id: reader.string()?,
        }),
        FrameKind::LeaveRoom => Frame::LeaveRoom(RoomRef {
            room_id: reader.string()?,
        }),
        FrameKind::Ping => Frame::Ping(Heartbeat { timestamp }),
        FrameKind::Pong => Frame::Pong(Heartbeat { timestamp }),
    };

    if reader.buf.has_remaining() {
        return Err(ProtocolError::Invalid(format!(
            "{} trailing bytes after {kind} frame",
            reader.buf.remaining()
        )));
    }

    frame.validate()?;
    Ok(frame)
}

fn required<T>(value: Option<T>, what: &'static str) -> Result<T, ProtocolError> {
    value.ok_or_else(|| ProtocolError::Invalid(format!("missing {what}")))
}

fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

fn put_opt_str(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(value) => {
            buf.put_u8(1);
            put_str(buf, value);
        }
        None => buf.put_u8(0),
    }
}

fn put_value(buf: &mut BytesMut, value: &Value) -> Result<(), ProtocolError> {
    let packed = rmp_serde::to_vec(value)?;
    buf.put_u32(packed.len() as u32);
    buf.extend_from_slice(&packed);
    Ok(())
}

/// Bounds-checked cursor over a frame body.
struct Reader<'a> {
    buf: &'a [u8],
}

impl Reader<'_> {
    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        let remaining = self.buf.remaining();
        if remaining < n {
            return Err(ProtocolError::Incomplete(n - remaining));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn bool(&mut self) -> Result<bool, ProtocolError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::Invalid(format!("invalid bool byte {other}"))),
        }
    }

    /// A list length. Every element takes at least one byte, so a count
    /// larger than what is left cannot be valid.
    fn count(&mut self) -> Result<usize, ProtocolError> {
        let count = self.u32()? as usize;
        if count > self.buf.remaining() {
            return Err(ProtocolError::Invalid(format!(
                "list of {count} elements exceeds frame"
            )));
        }
        Ok(count)
    }

    fn bytes(&mut self) -> Result<&[u8], ProtocolError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        Ok(std::str::from_utf8(self.bytes()?)?.to_owned())
    }

    fn opt_string(&mut self) -> Result<Option<String>, ProtocolError> {
        match self.u8()? {
            0 => Ok(None),
            1 => self.string().map(Some),
            other => Err(ProtocolError::Invalid(format!("invalid option byte {other}"))),
        }
    }

    fn value(&mut self) -> Result<Value, ProtocolError> {
        Ok(rmp_serde::from_slice(self.bytes()?)?)
    }
}
