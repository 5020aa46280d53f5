//! Accepts client sockets and hands each one to a worker, round-robin,
//! over that worker's descriptor channel.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::thread;
use std::time::Duration;

use skein_transport::{ChannelTransfer, CodecKind, Status};
use tracing::{debug, trace, warn};

use crate::error::{Result, ServerError};

/// Back-off between sends while a worker's channel is full.
pub const SEND_RETRY_DELAY: Duration = Duration::from_millis(1);
/// Sends attempted before a client is dropped.
pub const MAX_SEND_ATTEMPTS: usize = 1000;

/// Owns the listening socket and the sending end of every worker channel.
pub struct Acceptor {
    listener: TcpListener,
    workers: Vec<ChannelTransfer>,
    codec: CodecKind,
    next: usize,
}

impl Acceptor {
    pub fn new(listener: TcpListener, workers: Vec<ChannelTransfer>, codec: CodecKind) -> Self {
        Self {
            listener,
            workers,
            codec,
            next: 0,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Passes `stream` to the next worker. Returns the worker index, or
    /// `None` if the worker stayed saturated and the client was dropped.
    pub fn dispatch(&mut self, stream: TcpStream) -> Result<Option<usize>> {
        if self.workers.is_empty() {
            return Err(ServerError::WorkerGone { index: 0 });
        }
        if let Err(e) = stream.set_nodelay(true) {
            trace!(error = %e, "set_nodelay failed");
        }
        let index = self.next;
        self.next = (self.next + 1) % self.workers.len();

        for _ in 0..MAX_SEND_ATTEMPTS {
            match self.workers[index].send_fd(stream.as_fd(), self.codec, false)? {
                Status::Ready(()) => return Ok(Some(index)),
                Status::Pause => thread::sleep(SEND_RETRY_DELAY),
                Status::Closed => return Err(ServerError::WorkerGone { index }),
            }
        }
        warn!(worker = index, "worker channel saturated; dropping client");
        Ok(None)
    }

    /// Accepts forever. Returns only when a worker has gone away.
    pub fn run(mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Some(worker) = self.dispatch(stream)? {
                        debug!(peer = %peer, worker, "client dispatched");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_transport::channel_pair;

    fn listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").unwrap()
    }

    #[test]
    fn test_round_robin() {
        let l = listener();
        let addr = l.local_addr().unwrap();
        let (tx0, rx0) = channel_pair().unwrap();
        let (tx1, rx1) = channel_pair().unwrap();
        let mut acceptor = Acceptor::new(l, vec![tx0, tx1], CodecKind::Http);

        let mut order = Vec::new();
        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(addr).unwrap());
            let (stream, _) = acceptor.listener.accept().unwrap();
            order.push(acceptor.dispatch(stream).unwrap());
        }
        assert_eq!(order, vec![Some(0), Some(1), Some(0)]);

        let Status::Ready(received) = rx0.recv_fd().unwrap() else {
            panic!("worker 0 got nothing");
        };
        assert_eq!(received.record.codec, CodecKind::Http);
        assert!(rx1.recv_fd().unwrap().is_ready());
    }

    #[test]
    fn test_gone_worker_is_fatal() {
        let l = listener();
        let addr = l.local_addr().unwrap();
        let (tx, rx) = channel_pair().unwrap();
        drop(rx);
        let mut acceptor = Acceptor::new(l, vec![tx], CodecKind::Binary);
        let _client = TcpStream::connect(addr).unwrap();
        let (stream, _) = acceptor.listener.accept().unwrap();
        assert!(matches!(
            acceptor.dispatch(stream),
            Err(ServerError::WorkerGone { index: 0 })
        ));
    }

    #[test]
    fn test_no_workers() {
        let l = listener();
        let addr = l.local_addr().unwrap();
        let mut acceptor = Acceptor::new(l, Vec::new(), CodecKind::Binary);
        let _client = TcpStream::connect(addr).unwrap();
        let (stream, _) = acceptor.listener.accept().unwrap();
        assert!(acceptor.dispatch(stream).is_err());
    }
}
