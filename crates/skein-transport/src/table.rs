//! Connections owned by id, with a lookup by cluster node identity.

use std::collections::HashMap;
use std::time::Instant;

use tracing::debug;

use crate::connection::{Connection, ConnectionId};

/// Owns every connection of one worker.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    conns: HashMap<ConnectionId, Connection>,
    by_identity: HashMap<String, ConnectionId>,
}

impl ConnectionTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `conn`, indexing it by node identity if it has one.
    pub fn insert(&mut self, conn: Connection) -> ConnectionId {
        let id = conn.id();
        if let Some(identity) = conn.node_identity() {
            self.by_identity.insert(identity.to_string(), id);
        }
        self.conns.insert(id, conn);
        id
    }

    /// Removes and returns a connection.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.conns.remove(&id)?;
        if let Some(identity) = conn.node_identity() {
            if self.by_identity.get(identity) == Some(&id) {
                self.by_identity.remove(identity);
            }
        }
        Some(conn)
    }

    /// Shared access by id.
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    /// Exclusive access by id.
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    /// Tags a connection with a node identity and indexes it.
    pub fn bind_identity(&mut self, id: ConnectionId, identity: &str) -> bool {
        let Some(conn) = self.conns.get_mut(&id) else {
            return false;
        };
        conn.set_node_identity(identity);
        self.by_identity.insert(identity.to_string(), id);
        true
    }

    /// Connection currently serving a node identity.
    pub fn find_by_identity(&self, identity: &str) -> Option<ConnectionId> {
        self.by_identity.get(identity).copied()
    }

    /// Number of connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// True if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Ids of connections an idle sweep at `now` should evict.
    pub fn expired(&self, now: Instant) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .conns
            .values()
            .filter(|c| c.is_expired(now))
            .map(Connection::id)
            .collect();
        ids.sort();
        ids
    }

    /// Closes every expired connection and returns their ids. The
    /// connections stay in the table; the task driving each one removes it
    /// when it observes the close.
    pub fn close_expired(&mut self, now: Instant) -> Vec<ConnectionId> {
        let ids = self.expired(now);
        for id in &ids {
            if let Some(conn) = self.conns.get_mut(id) {
                conn.close();
            }
        }
        if !ids.is_empty() {
            debug!(count = ids.len(), "closed idle connections");
        }
        ids
    }

    /// Iterates over all connections.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }
}
