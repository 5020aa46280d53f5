#![warn(missing_docs)]

//! Skein transport: buffered non-blocking sockets, wire codecs, the
//! single-threaded task scheduler and cross-process socket hand-off.

pub mod buffer;
pub mod channel;
pub mod codec;
pub mod connection;
pub mod error;
pub mod scheduler;
pub mod table;

pub use buffer::ByteBuffer;
pub use channel::{channel_pair, ChannelTransfer, ReceivedSocket, TransferRecord};
pub use codec::{Codec, CodecKind, Message, Status};
pub use connection::{
    Connection, ConnectionConfig, ConnectionId, ConnectionState, ConnectionStats,
    NODE_CONNECT_TIMEOUT,
};
pub use error::{BufferError, ChannelError, CodecError, Result, SchedulerError, TransportError};
pub use scheduler::{
    FdWaiter, Readiness, Scheduler, SchedulerConfig, SchedulerHandle, Signal, WaitFor,
};
pub use table::ConnectionTable;
