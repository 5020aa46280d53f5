use thiserror::Error;

use crate::connection::ConnectionState;

/// Failures of the byte buffer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// A read asked for more bytes than are readable.
    #[error("insufficient data: wanted {wanted} bytes, {readable} readable")]
    InsufficientData {
        /// Bytes requested.
        wanted: usize,
        /// Bytes currently readable.
        readable: usize,
    },

    /// A cursor was moved outside `0 <= read <= write <= capacity`.
    #[error("index {index} out of range (limit {limit})")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Largest permitted value.
        limit: usize,
    },

    /// The allocator refused to grow the backing storage.
    #[error("out of memory growing buffer to {requested} bytes")]
    OutOfMemory {
        /// Capacity that could not be allocated.
        requested: usize,
    },

    /// Doubling the capacity overflowed `usize`.
    #[error("buffer capacity overflow")]
    CapacityOverflow,
}

/// Protocol-fatal codec failures (the ERR outcome).
#[derive(Debug, Error)]
pub enum CodecError {
    /// A frame header could not be parsed.
    #[error("malformed frame header: {reason}")]
    MalformedHeader {
        /// What was wrong with the header.
        reason: String,
    },

    /// A frame body failed to deserialize.
    #[error("malformed frame body: {0}")]
    MalformedBody(#[from] prost::DecodeError),

    /// A frame body failed to serialize.
    #[error("frame body encode failed: {0}")]
    BodyEncode(#[from] prost::EncodeError),

    /// The body is larger than the header can describe.
    #[error("frame body too large: {size} bytes (max {max_size})")]
    BodyTooLarge {
        /// Encoded body size.
        size: usize,
        /// Largest encodable body.
        max_size: usize,
    },

    /// The HTTP tokenizer rejected the input.
    #[error("HTTP parse error: {0}")]
    HttpParse(String),

    /// A message was missing a field required to encode it.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The request URL could not be split into its components.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// gzip compression or decompression failed.
    #[error("gzip error: {0}")]
    Gzip(String),

    /// The message variant does not match the codec variant.
    #[error("codec {codec} cannot carry a {message} message")]
    MessageKind {
        /// Codec that was asked.
        codec: &'static str,
        /// Message variant supplied.
        message: &'static str,
    },

    /// The output buffer could not hold the encoded frame.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Failures of the descriptor-passing control channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The control message carried no descriptor.
    #[error("control message carried no descriptor")]
    MissingDescriptor,

    /// The control message was truncated by the kernel.
    #[error("control message truncated")]
    Truncated,

    /// A record of the wrong size arrived.
    #[error("short transfer record: {got} of {expected} bytes")]
    ShortRecord {
        /// Bytes received.
        got: usize,
        /// Bytes expected.
        expected: usize,
    },

    /// The record named a codec this build does not know.
    #[error("unknown codec tag {0}")]
    UnknownCodec(i32),

    /// Any other socket error; fatal to the channel.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures of the cooperative scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The configured maximum number of live tasks is reached.
    #[error("task limit reached ({max} live tasks)")]
    TaskLimit {
        /// Configured cap.
        max: usize,
    },

    /// Building the runtime or registering a descriptor failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Connection-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection is in a state that forbids I/O.
    #[error("connection {conn_id} is {state:?}, I/O refused")]
    InvalidState {
        /// Logical connection id.
        conn_id: u64,
        /// Current lifecycle state.
        state: ConnectionState,
    },

    /// An outgoing connection did not complete in time.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Target address.
        addr: String,
        /// Timeout that expired.
        timeout_ms: u64,
    },

    /// The codec rejected inbound or outbound data.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Buffer growth failed.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// The reactor refused to watch the socket.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Fatal socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for connection operations.
pub type Result<T> = std::result::Result<T, TransportError>;
