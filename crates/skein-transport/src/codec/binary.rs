//! Binary framing: a fixed 15-byte header followed by a protobuf body.
//!
//! The header is itself a serialized protobuf message made of three `fixed32`
//! fields, so every header is exactly 15 bytes on the wire:
//!
//! ```text
//! 0x0D cmd:u32le | 0x15 seq:u32le | 0x1D len:u32le
//! ```
//!
//! The high byte of `len` carries [`FrameFlags`]; the low 24 bits are the body
//! length. A zero-length body is valid (heartbeats).

use bytes::Bytes;
use prost::Message as _;

use crate::buffer::ByteBuffer;
use crate::codec::{CodecResult, Status};
use crate::error::CodecError;

/// Encoded header size in bytes.
pub const HEADER_SIZE: usize = 15;

/// Largest body the 24-bit length field can describe.
pub const MAX_BODY_SIZE: usize = (1 << 24) - 1;

const TAG_CMD: u8 = 0x0D;
const TAG_SEQ: u8 = 0x15;
const TAG_LEN: u8 = 0x1D;
const LEN_MASK: u32 = 0x00FF_FFFF;

/// Frame flags packed into the top byte of the length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags {
    /// The frame answers an earlier request with the same `seq`.
    pub response: bool,
    /// No response is expected.
    pub one_way: bool,
}

impl FrameFlags {
    /// Create empty flags
    pub fn empty() -> Self {
        Self::default()
    }

    /// Convert to raw byte representation
    pub fn as_u8(&self) -> u8 {
        let mut b = 0u8;
        if self.response {
            b |= 0x01;
        }
        if self.one_way {
            b |= 0x02;
        }
        b
    }

    /// Create from raw byte representation
    pub fn from_u8(b: u8) -> Self {
        Self {
            response: (b & 0x01) != 0,
            one_way: (b & 0x02) != 0,
        }
    }
}

/// Frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgHead {
    /// Command id.
    pub cmd: u32,
    /// Sequence number, echoed in responses.
    pub seq: u32,
    /// Body length in bytes. Recomputed on encode.
    pub body_len: u32,
    /// Control flags.
    pub flags: FrameFlags,
}

impl MsgHead {
    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let len = (self.body_len & LEN_MASK) | (u32::from(self.flags.as_u8()) << 24);
        let mut out = [0u8; HEADER_SIZE];
        out[0] = TAG_CMD;
        out[1..5].copy_from_slice(&self.cmd.to_le_bytes());
        out[5] = TAG_SEQ;
        out[6..10].copy_from_slice(&self.seq.to_le_bytes());
        out[10] = TAG_LEN;
        out[11..15].copy_from_slice(&len.to_le_bytes());
        out
    }

    /// Parses a header from the first [`HEADER_SIZE`] bytes of `raw`.
    pub fn parse(raw: &[u8]) -> Result<Self, CodecError> {
        if raw.len() < HEADER_SIZE {
            return Err(CodecError::MalformedHeader {
                reason: format!("need {HEADER_SIZE} bytes, got {}", raw.len()),
            });
        }
        for (offset, tag) in [(0, TAG_CMD), (5, TAG_SEQ), (10, TAG_LEN)] {
            if raw[offset] != tag {
                return Err(CodecError::MalformedHeader {
                    reason: format!(
                        "bad tag 0x{:02X} at offset {offset}, expected 0x{tag:02X}",
                        raw[offset]
                    ),
                });
            }
        }
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let len = word(11);
        Ok(Self {
            cmd: word(1),
            seq: word(6),
            body_len: len & LEN_MASK,
            flags: FrameFlags::from_u8((len >> 24) as u8),
        })
    }
}

/// Error detail attached to responses.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RspResult {
    /// Application status code; 0 is success.
    #[prost(int32, tag = "1")]
    pub code: i32,
    /// Diagnostic text.
    #[prost(string, tag = "2")]
    pub msg: String,
}

/// Frame body.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MsgBody {
    /// Application payload.
    #[prost(bytes = "bytes", tag = "1")]
    pub data: Bytes,
    /// Side-channel payload (routing hints, session data).
    #[prost(bytes = "bytes", tag = "2")]
    pub add_on: Bytes,
    /// Distributed trace id.
    #[prost(string, tag = "3")]
    pub trace_id: String,
    /// Present on responses.
    #[prost(message, optional, tag = "4")]
    pub rsp_result: Option<RspResult>,
}

/// One binary protocol frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BinaryFrame {
    /// Header.
    pub head: MsgHead,
    /// Body.
    pub body: MsgBody,
}

impl BinaryFrame {
    /// Builds a request frame.
    pub fn new(cmd: u32, seq: u32, body: MsgBody) -> Self {
        Self {
            head: MsgHead {
                cmd,
                seq,
                body_len: 0,
                flags: FrameFlags::empty(),
            },
            body,
        }
    }

    /// Builds an empty-bodied frame, as used for heartbeats.
    pub fn heartbeat(cmd: u32, seq: u32) -> Self {
        Self::new(cmd, seq, MsgBody::default())
    }

    /// Builds the response to this frame carrying `body`.
    pub fn make_response(&self, body: MsgBody) -> Self {
        Self {
            head: MsgHead {
                cmd: self.head.cmd,
                seq: self.head.seq,
                body_len: 0,
                flags: FrameFlags {
                    response: true,
                    one_way: false,
                },
            },
            body,
        }
    }

    /// True if the response flag is set.
    pub fn is_response(&self) -> bool {
        self.head.flags.response
    }
}

/// Stateless binary framing codec.
#[derive(Debug, Default, Clone)]
pub struct BinaryCodec {
    _private: (),
}

impl BinaryCodec {
    /// Creates the codec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes one frame if a complete one is buffered.
    ///
    /// Nothing is consumed unless `Ready` is returned, so calling this again
    /// after more bytes arrive re-parses the header from scratch.
    pub fn decode(&self, buf: &mut ByteBuffer) -> CodecResult<BinaryFrame> {
        let Some(raw) = buf.peek(HEADER_SIZE) else {
            return Ok(Status::Pause);
        };
        let head = MsgHead::parse(raw)?;

        if head.body_len == 0 {
            buf.skip(HEADER_SIZE)?;
            return Ok(Status::Ready(BinaryFrame {
                head,
                body: MsgBody::default(),
            }));
        }

        let total = HEADER_SIZE + head.body_len as usize;
        let Some(raw) = buf.peek(total) else {
            return Ok(Status::Pause);
        };
        let body = MsgBody::decode(&raw[HEADER_SIZE..])?;
        buf.skip(total)?;
        Ok(Status::Ready(BinaryFrame { head, body }))
    }

    /// Appends one frame to `out`.
    ///
    /// Space for the whole frame is reserved up front, so no growth or
    /// compaction happens between the header and the body; on any failure the
    /// write cursor returns to where it was.
    pub fn encode(&self, frame: &BinaryFrame, out: &mut ByteBuffer) -> Result<(), CodecError> {
        let body_len = frame.body.encoded_len();
        if body_len > MAX_BODY_SIZE {
            return Err(CodecError::BodyTooLarge {
                size: body_len,
                max_size: MAX_BODY_SIZE,
            });
        }

        out.ensure_writable(HEADER_SIZE + body_len)?;
        let mark = out.write_index();

        let head = MsgHead {
            body_len: body_len as u32,
            ..frame.head
        };
        out.write(&head.to_bytes())?;

        let mut dst = &mut out.writable_mut()[..body_len];
        if let Err(e) = frame.body.encode(&mut dst) {
            out.set_write_index(mark)?;
            return Err(e.into());
        }
        out.advance_write(body_len)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(data: &[u8]) -> MsgBody {
        MsgBody {
            data: Bytes::copy_from_slice(data),
            ..Default::default()
        }
    }

    fn encoded(frame: &BinaryFrame) -> Vec<u8> {
        let mut out = ByteBuffer::new();
        BinaryCodec::new().encode(frame, &mut out).unwrap();
        out.peek_raw().to_vec()
    }

    #[test]
    fn test_header_layout() {
        let head = MsgHead {
            cmd: 0x0102_0304,
            seq: 9,
            body_len: 300,
            flags: FrameFlags {
                response: true,
                one_way: false,
            },
        };
        let raw = head.to_bytes();
        assert_eq!(raw.len(), HEADER_SIZE);
        assert_eq!(raw[0], 0x0D);
        assert_eq!(&raw[1..5], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(raw[5], 0x15);
        assert_eq!(raw[10], 0x1D);
        assert_eq!(raw[14], 0x01);
        assert_eq!(MsgHead::parse(&raw).unwrap(), head);
    }

    #[test]
    fn test_short_input_pauses() {
        let mut buf = ByteBuffer::new();
        buf.write(&[0x0D; 10]).unwrap();
        let status = BinaryCodec::new().decode(&mut buf).unwrap();
        assert!(status.is_pause());
        assert_eq!(buf.readable_len(), 10);
        assert_eq!(buf.read_index(), 0);
    }

    #[test]
    fn test_zero_length_body() {
        let head = MsgHead {
            cmd: 1,
            seq: 2,
            ..Default::default()
        };
        let mut buf = ByteBuffer::new();
        buf.write(&head.to_bytes()).unwrap();

        let frame = BinaryCodec::new().decode(&mut buf).unwrap().ready().unwrap();
        assert_eq!(frame.head.cmd, 1);
        assert_eq!(frame.head.seq, 2);
        assert_eq!(frame.body, MsgBody::default());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_body_pauses_without_consuming() {
        let frame = BinaryFrame::new(5, 6, body(b"payload bytes"));
        let bytes = encoded(&frame);

        let mut buf = ByteBuffer::new();
        buf.write(&bytes[..HEADER_SIZE + 3]).unwrap();
        let codec = BinaryCodec::new();
        assert!(codec.decode(&mut buf).unwrap().is_pause());
        assert_eq!(buf.readable_len(), HEADER_SIZE + 3);

        buf.write(&bytes[HEADER_SIZE + 3..]).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().ready().unwrap();
        assert_eq!(decoded.body, frame.body);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bad_tag_is_error() {
        let mut raw = MsgHead::default().to_bytes();
        raw[5] = 0x99;
        let mut buf = ByteBuffer::new();
        buf.write(&raw).unwrap();
        let err = BinaryCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::MalformedHeader { .. }));
    }

    #[test]
    fn test_malformed_body_is_error() {
        let mut buf = ByteBuffer::new();
        buf.write(
            &MsgHead {
                body_len: 2,
                ..Default::default()
            }
            .to_bytes(),
        )
        .unwrap();
        // field 1, length-delimited, claims 5 bytes but only 0 follow
        buf.write(&[0x0A, 0x05]).unwrap();
        let err = BinaryCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::MalformedBody(_)));
        assert_eq!(buf.readable_len(), HEADER_SIZE + 2);
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let first = BinaryFrame::new(1, 1, body(b"a"));
        let second = BinaryFrame::heartbeat(2, 2);
        let mut buf = ByteBuffer::new();
        buf.write(&encoded(&first)).unwrap();
        buf.write(&encoded(&second)).unwrap();

        let codec = BinaryCodec::new();
        let a = codec.decode(&mut buf).unwrap().ready().unwrap();
        let b = codec.decode(&mut buf).unwrap().ready().unwrap();
        assert_eq!(a.body, first.body);
        assert_eq!(b.head.cmd, 2);
        assert!(codec.decode(&mut buf).unwrap().is_pause());
    }

    #[test]
    fn test_encode_recomputes_length() {
        let mut frame = BinaryFrame::new(3, 4, body(&[7u8; 40]));
        frame.head.body_len = 9999;
        let bytes = encoded(&frame);
        let head = MsgHead::parse(&bytes).unwrap();
        assert_eq!(head.body_len as usize, bytes.len() - HEADER_SIZE);
    }

    #[test]
    fn test_make_response() {
        let req = BinaryFrame::new(10, 77, body(b"q"));
        let rsp = req.make_response(MsgBody {
            rsp_result: Some(RspResult {
                code: 0,
                msg: "ok".into(),
            }),
            ..Default::default()
        });
        assert!(rsp.is_response());
        assert_eq!(rsp.head.seq, 77);

        let mut buf = ByteBuffer::new();
        buf.write(&encoded(&rsp)).unwrap();
        let decoded = BinaryCodec::new().decode(&mut buf).unwrap().ready().unwrap();
        assert!(decoded.is_response());
        assert_eq!(decoded.body.rsp_result.unwrap().msg, "ok");
    }
}
