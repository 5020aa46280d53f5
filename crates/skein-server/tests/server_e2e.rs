//! End-to-end tests: a real `Server` on a loopback port, driven by plain
//! blocking sockets.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use bytes::Bytes;
use skein_server::router::{CMD_HEARTBEAT, CMD_ROUTE};
use skein_server::{Server, ServerConfig, ServerHandle};
use skein_transport::codec::{BinaryCodec, BinaryFrame, MsgBody, Status};
use skein_transport::{ByteBuffer, CodecKind};

fn start(codec: CodecKind, keep_alive_secs: u64) -> ServerHandle {
    let config = ServerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        workers: 2,
        codec,
        keep_alive_secs,
        node_host: "127.0.0.1".into(),
        ..ServerConfig::default()
    };
    Server::new(config).spawn().unwrap()
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn http_exchange(addr: SocketAddr, request: &str) -> String {
    let mut stream = connect(addr);
    stream.write_all(request.as_bytes()).unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).unwrap();
    out
}

fn read_frame(stream: &mut TcpStream, buf: &mut ByteBuffer) -> BinaryFrame {
    let codec = BinaryCodec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Status::Ready(frame) = codec.decode(buf).unwrap() {
            return frame;
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "server closed before a full frame arrived");
        buf.write(&chunk[..n]).unwrap();
    }
}

fn send_frame(stream: &mut TcpStream, frame: &BinaryFrame) {
    let mut out = ByteBuffer::new();
    BinaryCodec::new().encode(frame, &mut out).unwrap();
    stream.write_all(out.peek_raw()).unwrap();
}

#[test]
fn test_http_health_and_close() {
    let server = start(CodecKind::Http, 60);
    let reply = http_exchange(
        server.local_addr(),
        "GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
    assert!(reply.contains("Connection: close\r\n"));
    assert!(reply.ends_with("\r\n\r\nok"));
}

#[test]
fn test_http_route_self() {
    let server = start(CodecKind::Http, 60);
    let port = server.local_addr().port();
    let reply = http_exchange(
        server.local_addr(),
        "GET /route?key=user-1 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    let (_, body) = reply.split_once("\r\n\r\n").unwrap();
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(json["type"], "logic");
    assert_eq!(json["port"], port);
    let node = json["node"].as_str().unwrap();
    assert!(node.starts_with(&format!("127.0.0.1:{port}.")), "{node}");
}

#[test]
fn test_http_pipelined_requests() {
    let server = start(CodecKind::Http, 60);
    let reply = http_exchange(
        server.local_addr(),
        "GET /health HTTP/1.1\r\nHost: a\r\n\r\n\
         GET /missing HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n",
    );
    let first = reply.find("HTTP/1.1 200").unwrap();
    let second = reply.find("HTTP/1.1 404").unwrap();
    assert!(first < second);
}

#[test]
fn test_binary_heartbeat_and_route() {
    let server = start(CodecKind::Binary, 60);
    let mut stream = connect(server.local_addr());
    let mut buf = ByteBuffer::new();

    send_frame(&mut stream, &BinaryFrame::heartbeat(CMD_HEARTBEAT, 11));
    let reply = read_frame(&mut stream, &mut buf);
    assert!(reply.is_response());
    assert_eq!(reply.head.seq, 11);

    let route = BinaryFrame::new(
        CMD_ROUTE,
        12,
        MsgBody {
            data: Bytes::from_static(b"some-key"),
            ..MsgBody::default()
        },
    );
    send_frame(&mut stream, &route);
    let reply = read_frame(&mut stream, &mut buf);
    assert_eq!(reply.head.seq, 12);
    assert_eq!(reply.body.rsp_result.map(|r| r.code), Some(0));
    let identity = String::from_utf8(reply.body.data.to_vec()).unwrap();
    assert!(identity.starts_with("127.0.0.1:"), "{identity}");
}

#[test]
fn test_binary_idle_connection_closed() {
    let server = start(CodecKind::Binary, 1);
    let mut stream = connect(server.local_addr());
    let started = Instant::now();
    let mut byte = [0u8; 1];
    let n = stream.read(&mut byte).unwrap();
    assert_eq!(n, 0);
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(server.live_workers(), 2);
}

#[test]
fn test_malformed_frame_closes_connection() {
    let server = start(CodecKind::Binary, 60);
    let mut stream = connect(server.local_addr());
    stream.write_all(&[0xFFu8; 15]).unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}
