//! Wire codecs: turn a byte stream into framed messages and back.
//!
//! Decoding is driven repeatedly over a growing inbound buffer. A codec never
//! moves the read cursor until a complete frame is available, so a short read
//! always yields [`Status::Pause`] with the buffer untouched. Encoding either
//! appends one complete frame to the outbound buffer or leaves it exactly as
//! it was.

pub mod binary;
pub mod http;

use serde::{Deserialize, Serialize};

use crate::buffer::ByteBuffer;
use crate::error::CodecError;

pub use self::binary::{BinaryCodec, BinaryFrame, FrameFlags, MsgBody, MsgHead, RspResult};
pub use self::http::{HttpCodec, HttpKind, HttpMessage, HttpVersion, KeepAlive};

/// Outcome of a non-fatal codec or connection step.
///
/// The fatal outcome (ERR) is the `Err` side of the surrounding `Result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status<T> {
    /// A complete unit was produced.
    Ready(T),
    /// Not enough data (or kernel buffer space) yet; retry without loss.
    Pause,
    /// The peer closed the stream.
    Closed,
}

impl<T> Status<T> {
    /// True for [`Status::Ready`].
    pub fn is_ready(&self) -> bool {
        matches!(self, Status::Ready(_))
    }

    /// True for [`Status::Pause`].
    pub fn is_pause(&self) -> bool {
        matches!(self, Status::Pause)
    }

    /// Maps the ready value.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Status<U> {
        match self {
            Status::Ready(v) => Status::Ready(f(v)),
            Status::Pause => Status::Pause,
            Status::Closed => Status::Closed,
        }
    }

    /// Returns the ready value, if any.
    pub fn ready(self) -> Option<T> {
        match self {
            Status::Ready(v) => Some(v),
            _ => None,
        }
    }
}

/// Result of a codec decode step.
pub type CodecResult<T> = Result<Status<T>, CodecError>;

/// Codec selector, also carried across the descriptor-passing channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Fixed header plus protobuf body.
    #[default]
    Binary,
    /// HTTP/1.x.
    Http,
}

impl CodecKind {
    /// Stable integer tag used on the wire.
    pub fn as_i32(self) -> i32 {
        match self {
            CodecKind::Binary => 1,
            CodecKind::Http => 2,
        }
    }

    /// Inverse of [`as_i32`](Self::as_i32).
    pub fn from_i32(tag: i32) -> Option<Self> {
        match tag {
            1 => Some(CodecKind::Binary),
            2 => Some(CodecKind::Http),
            _ => None,
        }
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            CodecKind::Binary => "binary",
            CodecKind::Http => "http",
        }
    }
}

/// A decoded or to-be-encoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A binary frame.
    Binary(BinaryFrame),
    /// An HTTP request or response.
    Http(HttpMessage),
}

impl Message {
    fn variant_name(&self) -> &'static str {
        match self {
            Message::Binary(_) => "binary",
            Message::Http(_) => "http",
        }
    }
}

impl From<BinaryFrame> for Message {
    fn from(frame: BinaryFrame) -> Self {
        Message::Binary(frame)
    }
}

impl From<HttpMessage> for Message {
    fn from(msg: HttpMessage) -> Self {
        Message::Http(msg)
    }
}

/// The codec attached to a connection.
#[derive(Debug)]
pub enum Codec {
    /// Binary framing.
    Binary(BinaryCodec),
    /// HTTP framing.
    Http(Box<HttpCodec>),
}

impl Codec {
    /// Builds a fresh codec of the given kind.
    pub fn new(kind: CodecKind) -> Self {
        match kind {
            CodecKind::Binary => Codec::Binary(BinaryCodec::new()),
            CodecKind::Http => Codec::Http(Box::new(HttpCodec::new())),
        }
    }

    /// Which variant this is.
    pub fn kind(&self) -> CodecKind {
        match self {
            Codec::Binary(_) => CodecKind::Binary,
            Codec::Http(_) => CodecKind::Http,
        }
    }

    /// Decodes at most one message from `buf`.
    pub fn decode(&mut self, buf: &mut ByteBuffer) -> CodecResult<Message> {
        match self {
            Codec::Binary(codec) => Ok(codec.decode(buf)?.map(Message::Binary)),
            Codec::Http(codec) => Ok(codec.decode(buf)?.map(Message::Http)),
        }
    }

    /// Completes a message whose end is marked by the peer closing the stream.
    ///
    /// Only HTTP responses without explicit framing use this; everything else
    /// reports [`Status::Closed`].
    pub fn decode_eof(&mut self, buf: &mut ByteBuffer) -> CodecResult<Message> {
        match self {
            Codec::Binary(_) => Ok(Status::Closed),
            Codec::Http(codec) => Ok(codec.decode_eof(buf)?.map(Message::Http)),
        }
    }

    /// Appends one encoded message to `out`.
    pub fn encode(&mut self, msg: &Message, out: &mut ByteBuffer) -> Result<(), CodecError> {
        match (self, msg) {
            (Codec::Binary(codec), Message::Binary(frame)) => codec.encode(frame, out),
            (Codec::Http(codec), Message::Http(http)) => codec.encode(http, out),
            (codec, msg) => Err(CodecError::MessageKind {
                codec: codec.kind().name(),
                message: msg.variant_name(),
            }),
        }
    }

    /// Keep-alive negotiated by the codec itself, if it does that.
    pub fn keep_alive(&self) -> Option<KeepAlive> {
        match self {
            Codec::Binary(_) => None,
            Codec::Http(codec) => codec.keep_alive(),
        }
    }

    /// Drops any partial decode state.
    pub fn reset(&mut self) {
        match self {
            Codec::Binary(_) => {}
            Codec::Http(codec) => codec.reset(),
        }
    }
}
