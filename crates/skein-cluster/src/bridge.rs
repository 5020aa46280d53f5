//! Hand-off queue between blocking coordination clients and a worker loop.
//!
//! Clients run on their own OS threads and publish events; the worker drains
//! the queue on a timer tick and applies the events to its registry. The
//! registry itself is never touched from another thread.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::record::NodeRecord;
use crate::registry::NodeRegistry;

/// A membership change reported by the coordination service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationEvent {
    /// A record appeared or changed.
    Upsert(NodeRecord),
    /// The record at `path` went away.
    Delete {
        /// Registration path.
        path: String,
    },
    /// Full membership of one node type, e.g. after a reconnect.
    Snapshot {
        /// Node type the snapshot covers.
        node_type: String,
        /// Every live record of that type.
        records: Vec<NodeRecord>,
    },
}

/// Cloneable producer/consumer handle over one FIFO.
#[derive(Debug, Clone, Default)]
pub struct CoordinationBridge {
    queue: Arc<Mutex<VecDeque<CoordinationEvent>>>,
}

impl CoordinationBridge {
    /// Creates an empty bridge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues an event. Safe to call from any thread.
    pub fn publish(&self, event: CoordinationEvent) {
        self.queue.lock().push_back(event);
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Applies every queued event to `registry` in publish order and returns
    /// how many were applied.
    ///
    /// The lock is held only while taking the batch, never while applying it.
    pub fn drain_into(&self, registry: &mut NodeRegistry) -> usize {
        let batch = std::mem::take(&mut *self.queue.lock());
        let count = batch.len();
        for event in batch {
            match event {
                CoordinationEvent::Upsert(record) => {
                    let path = record.path.clone();
                    if let Err(err) = registry.apply_authoritative_record(record) {
                        warn!(path = %path, error = %err, "rejected node record");
                    }
                }
                CoordinationEvent::Delete { path } => {
                    registry.remove_authoritative_record(&path);
                }
                CoordinationEvent::Snapshot { node_type, records } => {
                    registry.reconcile(&node_type, records);
                }
            }
        }
        if count > 0 {
            debug!(count, version = registry.version(), "drained coordination events");
        }
        count
    }
}
