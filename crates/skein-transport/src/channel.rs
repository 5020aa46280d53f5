//! Moves accepted sockets between processes over a Unix socket pair.
//!
//! Each transfer is a fixed 16-byte record of four native-endian `i32`
//! fields `{fd, family, codec, is_system}` accompanied by one `SCM_RIGHTS`
//! descriptor. The receiver gets its own duplicate of the socket; the `fd`
//! field only records the sender's descriptor number for diagnostics.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use tracing::{debug, trace, warn};

use crate::codec::{CodecKind, Status};
use crate::error::ChannelError;

/// Size of one transfer record.
pub const RECORD_SIZE: usize = 16;

/// Metadata sent alongside a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRecord {
    /// Descriptor number in the sending process.
    pub fd: RawFd,
    /// Address family (`AF_INET`, `AF_INET6`, `AF_UNIX`).
    pub family: i32,
    /// Codec the receiver should attach.
    pub codec: CodecKind,
    /// Whether the receiver should treat the socket as inter-process.
    pub is_system: bool,
}

impl TransferRecord {
    /// Serializes into the wire record.
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        let fields = [
            self.fd,
            self.family,
            self.codec.as_i32(),
            i32::from(self.is_system),
        ];
        for (chunk, field) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_ne_bytes());
        }
        out
    }

    /// Parses the wire record.
    pub fn from_bytes(raw: &[u8; RECORD_SIZE]) -> Result<Self, ChannelError> {
        let mut fields = [0i32; 4];
        for (field, chunk) in fields.iter_mut().zip(raw.chunks_exact(4)) {
            *field = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let codec = CodecKind::from_i32(fields[2]).ok_or(ChannelError::UnknownCodec(fields[2]))?;
        Ok(Self {
            fd: fields[0],
            family: fields[1],
            codec,
            is_system: fields[3] != 0,
        })
    }
}

/// A descriptor received from the peer process.
#[derive(Debug)]
pub struct ReceivedSocket {
    /// Our duplicate of the socket.
    pub fd: OwnedFd,
    /// Metadata the sender attached.
    pub record: TransferRecord,
}

/// One end of a descriptor-passing channel.
#[derive(Debug)]
pub struct ChannelTransfer {
    stream: UnixStream,
}

/// Creates a connected, non-blocking channel pair.
pub fn channel_pair() -> Result<(ChannelTransfer, ChannelTransfer), ChannelError> {
    let (a, b) = UnixStream::pair()?;
    Ok((ChannelTransfer::new(a)?, ChannelTransfer::new(b)?))
}

impl ChannelTransfer {
    /// Wraps an existing Unix stream socket and makes it non-blocking.
    pub fn new(stream: UnixStream) -> Result<Self, ChannelError> {
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }

    /// Channel descriptor, for readiness registration.
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Sends `fd` with its metadata.
    ///
    /// `Pause` means the channel is full; retry when writable.
    pub fn send_fd(
        &self,
        fd: BorrowedFd<'_>,
        codec: CodecKind,
        is_system: bool,
    ) -> Result<Status<()>, ChannelError> {
        let raw = fd.as_raw_fd();
        let record = TransferRecord {
            fd: raw,
            family: socket_family(fd),
            codec,
            is_system,
        };
        let bytes = record.to_bytes();
        let iov = [IoSlice::new(&bytes)];
        let fds = [raw];
        let cmsgs = [ControlMessage::ScmRights(&fds)];

        let sent = loop {
            match sendmsg::<UnixAddr>(
                self.stream.as_raw_fd(),
                &iov,
                &cmsgs,
                MsgFlags::MSG_NOSIGNAL,
                None,
            ) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(Status::Pause),
                Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => return Ok(Status::Closed),
                Err(errno) => {
                    warn!(fd = raw, error = %errno, "descriptor send failed");
                    return Err(ChannelError::Io(errno.into()));
                }
            }
        };
        if sent != RECORD_SIZE {
            return Err(ChannelError::ShortRecord {
                got: sent,
                expected: RECORD_SIZE,
            });
        }
        trace!(fd = raw, codec = codec.name(), is_system, "descriptor sent");
        Ok(Status::Ready(()))
    }

    /// Receives one descriptor.
    ///
    /// `Pause` means nothing is queued; `Closed` means the peer process closed
    /// its end.
    pub fn recv_fd(&self) -> Result<Status<ReceivedSocket>, ChannelError> {
        let mut bytes = [0u8; RECORD_SIZE];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

        let (received, passed, truncated) = loop {
            let mut iov = [IoSliceMut::new(&mut bytes)];
            match recvmsg::<UnixAddr>(
                self.stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => {
                    let mut passed = Vec::new();
                    for cmsg in msg.cmsgs().map_err(std::io::Error::from)? {
                        if let ControlMessageOwned::ScmRights(fds) = cmsg {
                            passed.extend(fds);
                        }
                    }
                    let truncated = msg.flags.contains(MsgFlags::MSG_CTRUNC);
                    break (msg.bytes, passed, truncated);
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(Status::Pause),
                Err(errno) => {
                    warn!(error = %errno, "descriptor receive failed");
                    return Err(ChannelError::Io(errno.into()));
                }
            }
        };

        // Take ownership first so nothing leaks on the error paths below.
        let mut owned: Vec<OwnedFd> = passed
            .into_iter()
            // SAFETY: SCM_RIGHTS installed these descriptors in our table and
            // nothing else refers to them yet.
            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
            .collect();

        if received == 0 && owned.is_empty() {
            debug!("channel closed by peer");
            return Ok(Status::Closed);
        }
        if truncated {
            return Err(ChannelError::Truncated);
        }
        if received != RECORD_SIZE {
            return Err(ChannelError::ShortRecord {
                got: received,
                expected: RECORD_SIZE,
            });
        }
        let record = TransferRecord::from_bytes(&bytes)?;
        if owned.is_empty() {
            return Err(ChannelError::MissingDescriptor);
        }
        let fd = owned.swap_remove(0);
        trace!(fd = fd.as_raw_fd(), sender_fd = record.fd, "descriptor received");
        Ok(Status::Ready(ReceivedSocket { fd, record }))
    }
}

impl AsFd for ChannelTransfer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

fn socket_family(fd: BorrowedFd<'_>) -> i32 {
    socket2::SockRef::from(&fd)
        .local_addr()
        .map(|addr| i32::from(addr.family()))
        .unwrap_or(libc::AF_UNSPEC)
}
