//! Property-based tests for skein-transport using proptest.
//!
//! These cover the buffer cursor invariant under arbitrary operation
//! sequences and the no-consume-on-pause guarantee of both codecs.

use proptest::prelude::*;
use skein_transport::buffer::ByteBuffer;
use skein_transport::codec::{
    BinaryCodec, BinaryFrame, HttpCodec, HttpMessage, MsgBody, RspResult, Status,
};

#[derive(Debug, Clone)]
enum BufOp {
    Write(Vec<u8>),
    Read(usize),
    Skip(usize),
    Ensure(usize),
    Compact,
    MaybeCompact,
    Clear,
}

fn any_buf_op() -> impl Strategy<Value = BufOp> {
    prop_oneof![
        4 => proptest::collection::vec(any::<u8>(), 0..4096).prop_map(BufOp::Write),
        2 => (0usize..5000).prop_map(BufOp::Read),
        2 => (0usize..5000).prop_map(BufOp::Skip),
        1 => (0usize..200_000).prop_map(BufOp::Ensure),
        1 => Just(BufOp::Compact),
        1 => Just(BufOp::MaybeCompact),
        1 => Just(BufOp::Clear),
    ]
}

fn any_body() -> impl Strategy<Value = MsgBody> {
    (
        proptest::collection::vec(any::<u8>(), 0..512),
        proptest::collection::vec(any::<u8>(), 0..32),
        "[a-z0-9]{0,16}",
        proptest::option::of((any::<i32>(), "[ -~]{0,24}")),
    )
        .prop_map(|(data, add_on, trace_id, rsp)| MsgBody {
            data: data.into(),
            add_on: add_on.into(),
            trace_id,
            rsp_result: rsp.map(|(code, msg)| RspResult { code, msg }),
        })
}

fn encode_frame(frame: &BinaryFrame) -> Vec<u8> {
    let mut buf = ByteBuffer::new();
    BinaryCodec::new().encode(frame, &mut buf).unwrap();
    buf.peek_raw().to_vec()
}

proptest! {
    /// Test: 0 <= read_index <= write_index <= capacity after every operation,
    /// and the readable contents always match a simple model.
    #[test]
    fn test_buffer_invariant(ops in proptest::collection::vec(any_buf_op(), 1..64)) {
        let mut buf = ByteBuffer::new();
        let mut model: Vec<u8> = Vec::new();

        for op in ops {
            match op {
                BufOp::Write(bytes) => {
                    let before = buf.readable_len();
                    buf.write(&bytes).unwrap();
                    prop_assert_eq!(buf.readable_len(), before + bytes.len());
                    model.extend_from_slice(&bytes);
                }
                BufOp::Read(n) => {
                    let mut out = vec![0u8; n];
                    let ok = buf.read(&mut out).is_ok();
                    prop_assert_eq!(ok, n <= model.len());
                    if ok {
                        prop_assert_eq!(&out[..], &model[..n]);
                        model.drain(..n);
                    }
                }
                BufOp::Skip(n) => {
                    let ok = buf.skip(n).is_ok();
                    prop_assert_eq!(ok, n <= model.len());
                    if ok {
                        model.drain(..n);
                    }
                }
                BufOp::Ensure(n) => {
                    buf.ensure_writable(n).unwrap();
                    prop_assert!(buf.writable_len() >= n);
                }
                BufOp::Compact => buf.compact().unwrap(),
                BufOp::MaybeCompact => {
                    buf.maybe_compact().unwrap();
                }
                BufOp::Clear => {
                    buf.clear();
                    model.clear();
                }
            }
            prop_assert!(buf.read_index() <= buf.write_index());
            prop_assert!(buf.write_index() <= buf.capacity());
            prop_assert_eq!(buf.peek_raw(), &model[..]);
        }
    }

    /// Test: splitting an encoded frame anywhere yields Pause with nothing
    /// consumed, then the same frame once the remainder arrives.
    #[test]
    fn test_binary_partial_decode_is_idempotent(
        cmd in any::<u32>(),
        seq in any::<u32>(),
        body in any_body(),
        split_seed in any::<usize>(),
    ) {
        let bytes = encode_frame(&BinaryFrame::new(cmd, seq, body));
        let codec = BinaryCodec::new();

        let mut whole = ByteBuffer::new();
        whole.write(&bytes).unwrap();
        let expected = codec.decode(&mut whole).unwrap().ready().unwrap();

        let split = split_seed % bytes.len();
        let mut buf = ByteBuffer::new();
        buf.write(&bytes[..split]).unwrap();
        prop_assert_eq!(codec.decode(&mut buf).unwrap(), Status::Pause);
        prop_assert_eq!(buf.readable_len(), split);

        buf.write(&bytes[split..]).unwrap();
        let got = codec.decode(&mut buf).unwrap().ready().unwrap();
        prop_assert_eq!(got, expected);
        prop_assert!(buf.is_empty());
    }

    /// Test: decode(encode(frame)) preserves cmd, seq, flags and body, and
    /// re-encoding the decoded frame reproduces the same bytes.
    #[test]
    fn test_binary_round_trip(
        cmd in any::<u32>(),
        seq in any::<u32>(),
        body in any_body(),
        response in any::<bool>(),
    ) {
        let request = BinaryFrame::new(cmd, seq, body.clone());
        let frame = if response { request.make_response(body) } else { request };
        let bytes = encode_frame(&frame);

        let mut buf = ByteBuffer::new();
        buf.write(&bytes).unwrap();
        let decoded = BinaryCodec::new().decode(&mut buf).unwrap().ready().unwrap();
        prop_assert_eq!(decoded.head.cmd, frame.head.cmd);
        prop_assert_eq!(decoded.head.seq, frame.head.seq);
        prop_assert_eq!(decoded.head.flags, frame.head.flags);
        prop_assert_eq!(&decoded.body, &frame.body);
        prop_assert_eq!(encode_frame(&decoded), bytes);
    }

    /// Test: an HTTP request split at any point pauses without consuming and
    /// then decodes to the same message as the unsplit input.
    #[test]
    fn test_http_partial_decode_is_idempotent(
        path in "/[a-z]{1,12}",
        body in proptest::collection::vec(any::<u8>(), 0..256),
        chunked in any::<bool>(),
        split_seed in any::<usize>(),
    ) {
        let mut msg = HttpMessage::request("POST", path.clone()).with_body(body.clone());
        msg.chunked = chunked;
        let mut encoded = ByteBuffer::new();
        HttpCodec::new().encode(&msg, &mut encoded).unwrap();
        let bytes = encoded.peek_raw().to_vec();

        let split = split_seed % bytes.len();
        let mut codec = HttpCodec::new();
        let mut buf = ByteBuffer::new();
        buf.write(&bytes[..split]).unwrap();
        prop_assert_eq!(codec.decode(&mut buf).unwrap(), Status::Pause);
        prop_assert_eq!(buf.readable_len(), split);

        buf.write(&bytes[split..]).unwrap();
        let got = codec.decode(&mut buf).unwrap().ready().unwrap();
        prop_assert_eq!(got.path, path);
        prop_assert_eq!(got.body, body);
        prop_assert_eq!(got.chunked, chunked);
        prop_assert!(buf.is_empty());
    }
}

#[test]
fn test_round_trip_body_sizes() {
    // empty, one byte, and larger than the header
    for len in [0usize, 1, 64] {
        let frame = BinaryFrame::new(
            3,
            9,
            MsgBody {
                data: vec![0xAB; len].into(),
                ..Default::default()
            },
        );
        let bytes = encode_frame(&frame);
        let mut buf = ByteBuffer::new();
        buf.write(&bytes).unwrap();
        let decoded = BinaryCodec::new().decode(&mut buf).unwrap().ready().unwrap();
        assert_eq!(decoded.body, frame.body);
        assert_eq!(encode_frame(&decoded), bytes);
    }
}
