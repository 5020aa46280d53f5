//! One worker thread: a single cooperative scheduler that owns every
//! connection handed to it over its descriptor channel.
//!
//! Shared state lives in `Rc<RefCell<_>>` and is only borrowed between
//! suspension points, never across an `.await`.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use skein_cluster::{CoordinationBridge, NodeRecord, NodeRegistry};
use skein_transport::{
    ChannelTransfer, Connection, ConnectionConfig, ConnectionId, ConnectionTable, FdWaiter,
    Message, ReceivedSocket, Scheduler, SchedulerHandle, Status, WaitFor,
};
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::router::Router;

/// Idle-connection sweep period.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(1);
/// How often coordination events are applied to the registry.
pub const DRAIN_PERIOD: Duration = Duration::from_millis(100);

/// Everything a worker thread needs; built on the spawning thread.
pub struct Worker {
    index: usize,
    config: Arc<ServerConfig>,
    channel: ChannelTransfer,
    bridge: CoordinationBridge,
    self_record: NodeRecord,
}

impl Worker {
    pub fn new(
        index: usize,
        config: Arc<ServerConfig>,
        channel: ChannelTransfer,
        bridge: CoordinationBridge,
        self_record: NodeRecord,
    ) -> Self {
        Self {
            index,
            config,
            channel,
            bridge,
            self_record,
        }
    }

    /// Runs until the descriptor channel closes.
    pub fn run(self) -> Result<()> {
        let scheduler = Scheduler::new(self.config.scheduler_config())?;

        let mut registry = NodeRegistry::new(self.config.registry.clone());
        registry.apply_authoritative_record(self.self_record.clone())?;
        let registry = Rc::new(RefCell::new(registry));
        let table = Rc::new(RefCell::new(ConnectionTable::new()));

        let sweep_table = Rc::clone(&table);
        scheduler.every(SWEEP_PERIOD, move || {
            sweep_table.borrow_mut().close_expired(Instant::now());
        })?;

        let drain_registry = Rc::clone(&registry);
        let bridge = self.bridge.clone();
        let self_record = self.self_record.clone();
        scheduler.every(DRAIN_PERIOD, move || {
            drain_coordination(&bridge, &mut drain_registry.borrow_mut(), &self_record);
        })?;

        let state = Rc::new(WorkerState {
            index: self.index,
            table,
            registry,
            router: Router::new(self.config.node_type.clone()),
            conn_config: self.config.connection_config(),
            handle: scheduler.handle(),
        });

        info!(worker = self.index, "worker started");
        let result = scheduler.block_on(receive_loop(state, self.channel));
        info!(worker = self.index, "worker stopped");
        result
    }
}

/// Applies queued membership events, then puts this node's own record back
/// if a snapshot or delete dropped it. Returns the number of events applied.
fn drain_coordination(
    bridge: &CoordinationBridge,
    registry: &mut NodeRegistry,
    self_record: &NodeRecord,
) -> usize {
    let applied = bridge.drain_into(registry);
    if applied > 0 && registry.record(&self_record.path).is_none() {
        match registry.apply_authoritative_record(self_record.clone()) {
            Ok(()) => debug!(path = %self_record.path, "re-seeded own node record"),
            Err(e) => warn!(path = %self_record.path, error = %e, "cannot re-seed own node record"),
        }
    }
    applied
}

struct WorkerState {
    index: usize,
    table: Rc<RefCell<ConnectionTable>>,
    registry: Rc<RefCell<NodeRegistry>>,
    router: Router,
    conn_config: ConnectionConfig,
    handle: SchedulerHandle,
}

/// Accepts descriptors from the acceptor until it hangs up.
async fn receive_loop(state: Rc<WorkerState>, channel: ChannelTransfer) -> Result<()> {
    let waiter = FdWaiter::new(channel.fd())?;
    loop {
        match channel.recv_fd()? {
            Status::Ready(received) => attach(&state, received),
            Status::Pause => {
                waiter.wait(WaitFor::Read, None).await?;
            }
            Status::Closed => {
                info!(worker = state.index, "descriptor channel closed");
                return Ok(());
            }
        }
    }
}

fn attach(state: &Rc<WorkerState>, received: ReceivedSocket) {
    let record = received.record;
    let conn = match Connection::from_fd(
        received.fd,
        record.codec,
        record.is_system,
        &state.conn_config,
    ) {
        Ok(conn) => conn,
        Err(e) => {
            warn!(worker = state.index, error = %e, "rejecting received socket");
            return;
        }
    };
    let fd = conn.fd();
    let id = state.table.borrow_mut().insert(conn);
    trace!(worker = state.index, conn_id = %id, fd, codec = record.codec.name(), "connection assigned");

    let task_state = Rc::clone(state);
    if let Err(e) = state.handle.spawn(async move { task_state.serve(id, fd).await }) {
        warn!(worker = state.index, conn_id = %id, error = %e, "no task slot; dropping connection");
        if let Some(mut conn) = state.table.borrow_mut().remove(id) {
            conn.close();
        }
    }
}

impl WorkerState {
    async fn serve(&self, id: ConnectionId, fd: std::os::fd::RawFd) {
        match FdWaiter::new(fd) {
            Ok(waiter) => {
                if let Err(e) = self.drive(id, &waiter).await {
                    debug!(conn_id = %id, error = %e, "connection ended with error");
                }
            }
            Err(e) => warn!(conn_id = %id, error = %e, "cannot watch connection"),
        }
        if let Some(mut conn) = self.table.borrow_mut().remove(id) {
            conn.close();
        }
    }

    /// Runs `f` on the connection if it is still open.
    fn with_conn<T>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut Connection) -> skein_transport::Result<T>,
    ) -> Result<Option<T>> {
        let mut table = self.table.borrow_mut();
        match table.get_mut(id) {
            Some(conn) if conn.state().allows_io() => Ok(Some(f(conn)?)),
            _ => Ok(None),
        }
    }

    /// Read, decode, route and reply, one message at a time in arrival order.
    async fn drive(&self, id: ConnectionId, waiter: &FdWaiter) -> Result<()> {
        loop {
            let next = self.with_conn(id, |conn| match conn.fetch_message()? {
                Status::Pause => conn.read_message(),
                other => Ok(other),
            })?;
            match next {
                None | Some(Status::Closed) => return Ok(()),
                Some(Status::Pause) => {
                    waiter.wait(WaitFor::Read, None).await?;
                }
                Some(Status::Ready(msg)) => {
                    if !self.respond(id, waiter, msg).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Sends the reply to `msg`. Returns false once the connection should end.
    async fn respond(&self, id: ConnectionId, waiter: &FdWaiter, msg: Message) -> Result<bool> {
        let Some(reply) = self.router.handle(&self.registry.borrow(), msg) else {
            return Ok(true);
        };
        let Some(mut status) = self.with_conn(id, |conn| conn.write_message(&reply))? else {
            return Ok(false);
        };
        while status.is_pause() {
            waiter.wait(WaitFor::Write, None).await?;
            match self.with_conn(id, Connection::write)? {
                Some(next) => status = next,
                None => return Ok(false),
            }
        }
        if matches!(status, Status::Closed) {
            return Ok(false);
        }
        let close = self
            .with_conn(id, |conn| Ok(conn.should_close_after_flush()))?
            .unwrap_or(true);
        if close {
            debug!(conn_id = %id, "closing after response");
        }
        Ok(!close)
    }
}
