//! A non-blocking socket paired with its buffers and codec.
//!
//! Every operation returns `Result<Status<_>>`: `Ready` carries a decoded
//! message (or a fully flushed write), `Pause` means the kernel had no data or
//! no send-buffer room and the call should be retried on the next readiness,
//! `Closed` means the peer went away. Both `Err` and `Closed` are terminal;
//! the owner must drop the connection.

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace, warn};

use crate::buffer::ByteBuffer;
use crate::codec::{Codec, CodecKind, KeepAlive, Message, Status};
use crate::error::{Result, TransportError};
use crate::scheduler::{FdWaiter, Readiness, WaitFor};

/// How long an outgoing node connection may take to complete.
pub const NODE_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique logical connection id. Descriptor numbers are reused by the
/// kernel; ids are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection lifecycle.
///
/// `Unknown -> {TryConnect | Connected}`, `TryConnect -> Connecting -> Connected`,
/// and any state may move to `Closed` or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not yet attached to a live socket.
    #[default]
    Unknown,
    /// Outgoing connect about to be issued.
    TryConnect,
    /// Outgoing connect in progress.
    Connecting,
    /// Usable.
    Connected,
    /// Closed locally or by the peer.
    Closed,
    /// A fatal error occurred.
    Error,
}

impl ConnectionState {
    /// Whether reads and writes are permitted.
    pub fn allows_io(self) -> bool {
        matches!(
            self,
            ConnectionState::TryConnect | ConnectionState::Connecting | ConnectionState::Connected
        )
    }
}

/// Connection-level settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Idle time before the connection is evicted when the codec has not
    /// negotiated its own value; zero closes after each response
    /// (default: 60s).
    pub keep_alive: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// Byte and call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Bytes read from the socket.
    pub recv_bytes: u64,
    /// Successful reads.
    pub recv_calls: u64,
    /// Bytes written to the socket.
    pub send_bytes: u64,
    /// Successful writes.
    pub send_calls: u64,
}

/// One socket, its inbound and outbound buffers, and its codec.
pub struct Connection {
    id: ConnectionId,
    socket: Socket,
    state: ConnectionState,
    codec: Codec,
    inbound: Option<ByteBuffer>,
    outbound: Option<ByteBuffer>,
    stats: ConnectionStats,
    last_active: Instant,
    keep_alive: Duration,
    peer_addr: Option<SocketAddr>,
    node_identity: Option<String>,
    system: bool,
    peer_closed: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.socket.as_raw_fd())
            .field("state", &self.state)
            .field("codec", &self.codec.kind())
            .field("peer_addr", &self.peer_addr)
            .field("system", &self.system)
            .finish()
    }
}

impl Connection {
    fn with_socket(socket: Socket, codec: CodecKind, config: &ConnectionConfig) -> Self {
        Self {
            id: ConnectionId::next(),
            socket,
            state: ConnectionState::Unknown,
            codec: Codec::new(codec),
            inbound: None,
            outbound: None,
            stats: ConnectionStats::default(),
            last_active: Instant::now(),
            keep_alive: config.keep_alive,
            peer_addr: None,
            node_identity: None,
            system: false,
            peer_closed: false,
        }
    }

    /// Wraps an accepted TCP stream.
    pub fn from_stream(
        stream: TcpStream,
        codec: CodecKind,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        Self::from_fd(OwnedFd::from(stream), codec, false, config)
    }

    /// Wraps a descriptor that is already connected, such as one received
    /// over a descriptor-passing channel.
    pub fn from_fd(
        fd: OwnedFd,
        codec: CodecKind,
        system: bool,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        let socket = Socket::from(fd);
        socket.set_nonblocking(true)?;
        let mut conn = Self::with_socket(socket, codec, config);
        conn.peer_addr = conn
            .socket
            .peer_addr()
            .ok()
            .and_then(|addr| addr.as_socket());
        conn.system = system;
        conn.state = ConnectionState::Connected;
        debug!(conn_id = %conn.id, fd = conn.fd(), peer = ?conn.peer_addr, system, "connection attached");
        Ok(conn)
    }

    /// Starts a non-blocking connect to `addr`.
    ///
    /// The result is `Connected` if the kernel completed the handshake
    /// immediately and `Connecting` otherwise; finish with
    /// [`finish_connect`](Self::finish_connect) once the socket is writable.
    pub fn connect(addr: SocketAddr, codec: CodecKind, config: &ConnectionConfig) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;

        let mut conn = Self::with_socket(socket, codec, config);
        conn.peer_addr = Some(addr);
        conn.state = ConnectionState::TryConnect;

        match conn.socket.connect(&SockAddr::from(addr)) {
            Ok(()) => conn.state = ConnectionState::Connected,
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                conn.state = ConnectionState::Connecting;
            }
            Err(e) => {
                debug!(%addr, error = %e, "connect failed");
                return Err(e.into());
            }
        }
        trace!(conn_id = %conn.id, %addr, state = ?conn.state, "connect issued");
        Ok(conn)
    }

    /// Completes a pending connect. Returns true once connected.
    pub fn finish_connect(&mut self) -> Result<bool> {
        match self.state {
            ConnectionState::Connected => Ok(true),
            ConnectionState::Connecting => {
                if let Some(err) = self.socket.take_error()? {
                    self.state = ConnectionState::Error;
                    return Err(err.into());
                }
                match self.socket.peer_addr() {
                    Ok(_) => {
                        self.state = ConnectionState::Connected;
                        self.touch();
                        debug!(conn_id = %self.id, peer = ?self.peer_addr, "connected");
                        Ok(true)
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
                    Err(e) => {
                        self.state = ConnectionState::Error;
                        Err(e.into())
                    }
                }
            }
            state => Err(self.invalid_state(state)),
        }
    }

    /// Connects to a cluster node, waiting at most `timeout` for the
    /// handshake. Must run on a [`Scheduler`](crate::scheduler::Scheduler).
    pub async fn connect_timeout(
        addr: SocketAddr,
        codec: CodecKind,
        config: &ConnectionConfig,
        timeout: Duration,
    ) -> Result<Self> {
        let mut conn = Self::connect(addr, codec, config)?;
        if conn.state == ConnectionState::Connected {
            return Ok(conn);
        }
        let deadline = Instant::now() + timeout;
        let waiter = FdWaiter::new(conn.fd())?;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero()
                || waiter.wait(WaitFor::Write, Some(left)).await? == Readiness::TimedOut
            {
                warn!(%addr, timeout_ms = timeout.as_millis() as u64, "node connect timed out");
                drop(waiter);
                conn.close();
                return Err(TransportError::ConnectionTimeout {
                    addr: addr.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            if conn.finish_connect()? {
                return Ok(conn);
            }
        }
    }

    /// Logical id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Underlying descriptor.
    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Codec variant in use.
    pub fn codec_kind(&self) -> CodecKind {
        self.codec.kind()
    }

    /// Counters.
    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Remote address, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Cluster node this connection belongs to, if any.
    pub fn node_identity(&self) -> Option<&str> {
        self.node_identity.as_deref()
    }

    /// Tags the connection with a cluster node identity.
    pub fn set_node_identity(&mut self, identity: impl Into<String>) {
        self.node_identity = Some(identity.into());
    }

    /// Inter-process connections never expire.
    pub fn is_system(&self) -> bool {
        self.system
    }

    /// Marks the connection as inter-process.
    pub fn set_system(&mut self, system: bool) {
        self.system = system;
    }

    /// Last time bytes moved in either direction.
    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    /// Connection-level keep-alive.
    pub fn set_keep_alive(&mut self, keep_alive: Duration) {
        self.keep_alive = keep_alive;
    }

    /// Bytes encoded but not yet sent.
    pub fn pending_output(&self) -> usize {
        self.outbound.as_ref().map_or(0, ByteBuffer::readable_len)
    }

    /// Bytes received but not yet decoded.
    pub fn pending_input(&self) -> usize {
        self.inbound.as_ref().map_or(0, ByteBuffer::readable_len)
    }

    /// Keep-alive in force: the codec's negotiated value when it has one,
    /// otherwise the connection-level setting.
    pub fn resolved_keep_alive(&self) -> KeepAlive {
        match self.codec.keep_alive() {
            Some(KeepAlive::Close) => KeepAlive::Close,
            Some(KeepAlive::For(d)) => KeepAlive::For(d),
            Some(KeepAlive::Timer) | None if self.keep_alive.is_zero() => KeepAlive::Close,
            Some(KeepAlive::Timer) | None => KeepAlive::For(self.keep_alive),
        }
    }

    /// Whether the connection should be closed once its output is flushed.
    pub fn should_close_after_flush(&self) -> bool {
        !self.system && self.resolved_keep_alive() == KeepAlive::Close
    }

    /// Whether an idle sweep at `now` should evict this connection.
    pub fn is_expired(&self, now: Instant) -> bool {
        if self.system {
            return false;
        }
        if !self.state.allows_io() {
            return true;
        }
        if self.pending_output() > 0 {
            return false;
        }
        match self.resolved_keep_alive() {
            // no keep-alive: any idle time at all is too long
            KeepAlive::Close => now > self.last_active,
            KeepAlive::For(limit) => now.saturating_duration_since(self.last_active) >= limit,
            KeepAlive::Timer => false,
        }
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    fn invalid_state(&self, state: ConnectionState) -> TransportError {
        TransportError::InvalidState {
            conn_id: self.id.0,
            state,
        }
    }

    fn check_io(&self) -> Result<()> {
        if self.state.allows_io() {
            Ok(())
        } else {
            Err(self.invalid_state(self.state))
        }
    }

    fn fail<E: Into<TransportError>>(&mut self, err: E) -> TransportError {
        self.state = ConnectionState::Error;
        let err = err.into();
        debug!(conn_id = %self.id, error = %err, "connection failed");
        err
    }

    /// Reads from the socket and decodes one message.
    ///
    /// Keeps reading while the codec needs more data, so `Pause` is only
    /// returned once the socket itself has nothing more to give.
    pub fn read_message(&mut self) -> Result<Status<Message>> {
        self.check_io()?;
        if self.peer_closed {
            self.state = ConnectionState::Closed;
            return Ok(Status::Closed);
        }

        loop {
            let inbound = self.inbound.get_or_insert_with(ByteBuffer::new);
            let read = inbound.read_from_fd(self.socket.as_fd());
            match read {
                Ok(0) => return self.on_peer_closed(),
                Ok(n) => {
                    self.stats.recv_bytes += n as u64;
                    self.stats.recv_calls += 1;
                    self.touch();
                    trace!(conn_id = %self.id, bytes = n, "read");
                    if let Some(inbound) = self.inbound.as_mut() {
                        inbound.maybe_compact().map_err(TransportError::from)?;
                    }
                    match self.fetch_message()? {
                        Status::Pause => continue,
                        other => return Ok(other),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Status::Pause),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    fn on_peer_closed(&mut self) -> Result<Status<Message>> {
        self.peer_closed = true;
        let inbound = self.inbound.get_or_insert_with(ByteBuffer::new);
        match self.codec.decode_eof(inbound) {
            Ok(Status::Ready(msg)) => Ok(Status::Ready(msg)),
            Ok(_) => {
                debug!(conn_id = %self.id, "peer closed");
                self.state = ConnectionState::Closed;
                Ok(Status::Closed)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Decodes the next message from bytes already buffered, without reading.
    pub fn fetch_message(&mut self) -> Result<Status<Message>> {
        self.check_io()?;
        let Some(inbound) = self.inbound.as_mut() else {
            return Ok(Status::Pause);
        };
        match self.codec.decode(inbound) {
            Ok(status) => Ok(status),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Encodes `msg` into the outbound buffer and flushes.
    pub fn write_message(&mut self, msg: &Message) -> Result<Status<()>> {
        self.check_io()?;
        let outbound = self.outbound.get_or_insert_with(ByteBuffer::new);
        if let Err(e) = self.codec.encode(msg, outbound) {
            return Err(self.fail(e));
        }
        self.write()
    }

    /// Flushes the outbound buffer.
    ///
    /// `Pause` means the kernel send buffer filled up; call again when the
    /// socket is writable. Nothing is re-encoded.
    pub fn write(&mut self) -> Result<Status<()>> {
        self.check_io()?;
        let Some(outbound) = self.outbound.as_mut() else {
            return Ok(Status::Ready(()));
        };
        while !outbound.is_empty() {
            match outbound.write_to_fd(self.socket.as_fd()) {
                Ok(0) => return Ok(Status::Pause),
                Ok(n) => {
                    self.stats.send_bytes += n as u64;
                    self.stats.send_calls += 1;
                    self.last_active = Instant::now();
                    trace!(conn_id = %self.id, bytes = n, "wrote");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Status::Pause);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!(conn_id = %self.id, "peer closed during write");
                    self.state = ConnectionState::Closed;
                    return Ok(Status::Closed);
                }
                Err(e) => {
                    self.state = ConnectionState::Error;
                    debug!(conn_id = %self.id, error = %e, "write failed");
                    return Err(e.into());
                }
            }
        }
        outbound.maybe_compact()?;
        Ok(Status::Ready(()))
    }

    /// Marks the connection closed and shuts the socket down in both
    /// directions, which wakes any task waiting on it. The descriptor itself
    /// is released when the connection is dropped.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            trace!(conn_id = %self.id, error = %e, "shutdown failed");
        }
        debug!(conn_id = %self.id, stats = ?self.stats, "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::codec::{BinaryFrame, HttpMessage, MsgBody};

    fn pair(codec: CodecKind) -> (Connection, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let conn = Connection::from_fd(
            OwnedFd::from(ours),
            codec,
            false,
            &ConnectionConfig::default(),
        )
        .unwrap();
        (conn, theirs)
    }

    fn encoded(frame: &BinaryFrame) -> Vec<u8> {
        let mut buf = ByteBuffer::new();
        crate::codec::BinaryCodec::new().encode(frame, &mut buf).unwrap();
        buf.peek_raw().to_vec()
    }

    #[test]
    fn test_ids_are_unique() {
        let (a, _pa) = pair(CodecKind::Binary);
        let (b, _pb) = pair(CodecKind::Binary);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_read_pause_then_message() {
        let (mut conn, mut peer) = pair(CodecKind::Binary);
        assert_eq!(conn.read_message().unwrap(), Status::Pause);

        let frame = BinaryFrame::new(
            7,
            1,
            MsgBody {
                data: b"payload".to_vec().into(),
                ..Default::default()
            },
        );
        let bytes = encoded(&frame);
        peer.write_all(&bytes[..10]).unwrap();
        assert_eq!(conn.read_message().unwrap(), Status::Pause);
        assert_eq!(conn.pending_input(), 10);

        peer.write_all(&bytes[10..]).unwrap();
        let Message::Binary(got) = conn.read_message().unwrap().ready().unwrap() else {
            panic!("expected a binary frame");
        };
        assert_eq!(got.head.cmd, 7);
        assert_eq!(got.body, frame.body);
        assert_eq!(conn.stats().recv_bytes, bytes.len() as u64);
    }

    #[test]
    fn test_fetch_drains_multiple_frames() {
        let (mut conn, mut peer) = pair(CodecKind::Binary);
        let mut bytes = encoded(&BinaryFrame::heartbeat(1, 1));
        bytes.extend(encoded(&BinaryFrame::heartbeat(1, 2)));
        peer.write_all(&bytes).unwrap();

        let first = conn.read_message().unwrap().ready().unwrap();
        let second = conn.fetch_message().unwrap().ready().unwrap();
        assert!(matches!(first, Message::Binary(f) if f.head.seq == 1));
        assert!(matches!(second, Message::Binary(f) if f.head.seq == 2));
        assert_eq!(conn.fetch_message().unwrap(), Status::Pause);
    }

    #[test]
    fn test_peer_close() {
        let (mut conn, peer) = pair(CodecKind::Binary);
        drop(peer);
        assert_eq!(conn.read_message().unwrap(), Status::Closed);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            conn.read_message(),
            Err(TransportError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_malformed_frame_is_error() {
        let (mut conn, mut peer) = pair(CodecKind::Binary);
        peer.write_all(&[0xFFu8; 20]).unwrap();
        assert!(conn.read_message().is_err());
        assert_eq!(conn.state(), ConnectionState::Error);
        assert!(conn.write().is_err());
    }

    #[test]
    fn test_write_message_reaches_peer() {
        let (mut conn, mut peer) = pair(CodecKind::Http);
        let msg = Message::Http(HttpMessage::response(200).with_body("ok"));
        assert_eq!(conn.write_message(&msg).unwrap(), Status::Ready(()));
        assert_eq!(conn.pending_output(), 0);
        drop(conn);

        let mut text = String::new();
        peer.read_to_string(&mut text).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nok"));
    }

    #[test]
    fn test_write_pauses_when_kernel_buffer_full() {
        let (mut conn, mut peer) = pair(CodecKind::Http);
        let big = HttpMessage::response(200).with_body(vec![b'x'; 8 * 1024 * 1024]);
        assert_eq!(
            conn.write_message(&Message::Http(big)).unwrap(),
            Status::Pause
        );
        let pending = conn.pending_output();
        assert!(pending > 0);

        let mut sink = vec![0u8; 1024 * 1024];
        let n = peer.read(&mut sink).unwrap();
        assert!(n > 0);
        let _ = conn.write().unwrap();
        assert!(conn.pending_output() < pending);
    }

    #[test]
    fn test_http_read_until_close() {
        let (mut conn, mut peer) = pair(CodecKind::Http);
        peer.write_all(b"HTTP/1.1 200 OK\r\n\r\nstreamed").unwrap();
        assert_eq!(conn.read_message().unwrap(), Status::Pause);
        drop(peer);
        let msg = conn.read_message().unwrap().ready().unwrap();
        match msg {
            Message::Http(http) => assert_eq!(http.body, b"streamed"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(conn.read_message().unwrap(), Status::Closed);
    }

    #[test]
    fn test_keep_alive_precedence() {
        let (mut conn, mut peer) = pair(CodecKind::Http);
        conn.set_keep_alive(Duration::from_secs(30));
        assert_eq!(
            conn.resolved_keep_alive(),
            KeepAlive::For(Duration::from_secs(30))
        );

        peer.write_all(b"GET / HTTP/1.1\r\nKeep-Alive: timeout=5\r\n\r\n")
            .unwrap();
        conn.read_message().unwrap().ready().unwrap();
        assert_eq!(
            conn.resolved_keep_alive(),
            KeepAlive::For(Duration::from_secs(5))
        );

        peer.write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();
        conn.read_message().unwrap().ready().unwrap();
        assert!(conn.should_close_after_flush());
    }

    #[test]
    fn test_zero_keep_alive_idle_connection_expires() {
        let (mut conn, _peer) = pair(CodecKind::Binary);
        conn.set_keep_alive(Duration::ZERO);
        let idle_since = conn.last_active();
        assert!(!conn.is_expired(idle_since));
        assert!(conn.is_expired(idle_since + Duration::from_secs(3600)));
        assert!(conn.is_expired(idle_since + Duration::from_millis(1)));

        conn.set_system(true);
        assert!(!conn.is_expired(idle_since + Duration::from_secs(3600)));
    }

    #[test]
    fn test_expiry_and_system_exemption() {
        let (mut conn, _peer) = pair(CodecKind::Binary);
        conn.set_keep_alive(Duration::from_millis(1));
        let later = Instant::now() + Duration::from_secs(1);
        assert!(conn.is_expired(later));

        conn.set_system(true);
        assert!(!conn.is_expired(later));
        assert!(!conn.should_close_after_flush());
    }

    #[test]
    fn test_zero_keep_alive_closes_after_flush() {
        let (mut conn, _peer) = pair(CodecKind::Binary);
        conn.set_keep_alive(Duration::ZERO);
        assert_eq!(conn.resolved_keep_alive(), KeepAlive::Close);
        assert!(conn.should_close_after_flush());
    }

    #[test]
    fn test_close_refuses_io() {
        let (mut conn, _peer) = pair(CodecKind::Binary);
        conn.close();
        assert!(matches!(
            conn.write_message(&Message::Binary(BinaryFrame::heartbeat(1, 1))),
            Err(TransportError::InvalidState { .. })
        ));
        assert!(conn.is_expired(Instant::now()));
    }

    #[test]
    fn test_connect_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut conn =
            Connection::connect(addr, CodecKind::Binary, &ConnectionConfig::default()).unwrap();
        assert!(matches!(
            conn.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ));
        let (_accepted, _) = listener.accept().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !conn.finish_connect().unwrap() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.peer_addr(), Some(addr));
    }

    #[test]
    fn test_connect_timeout_async() {
        use crate::scheduler::{Scheduler, SchedulerConfig};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let sched = Scheduler::new(SchedulerConfig::default()).unwrap();
        let conn = sched
            .block_on(Connection::connect_timeout(
                addr,
                CodecKind::Binary,
                &ConnectionConfig::default(),
                NODE_CONNECT_TIMEOUT,
            ))
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
    }
}
