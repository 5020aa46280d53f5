//! File-backed membership feed.
//!
//! Polls a JSON array of [`NodeRecord`]s on a background thread and publishes
//! one [`CoordinationEvent::Snapshot`] per node type whenever the file
//! changes. A type that disappears from the file gets an empty snapshot so its
//! nodes are removed. Missing or malformed files are logged and skipped; the
//! last good membership stays in effect.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bridge::{CoordinationBridge, CoordinationEvent};
use crate::error::Result;
use crate::record::NodeRecord;

/// Reads a membership file.
pub fn load_records(path: &Path) -> Result<Vec<NodeRecord>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Polling membership source feeding one or more bridges.
#[derive(Debug)]
pub struct MembershipFile {
    path: PathBuf,
    poll_interval: Duration,
    bridges: Vec<CoordinationBridge>,
    last_contents: Option<String>,
    types: BTreeSet<String>,
}

impl MembershipFile {
    /// Creates a feed for `path`.
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            bridges: Vec::new(),
            last_contents: None,
            types: BTreeSet::new(),
        }
    }

    /// Adds a bridge that receives every published event.
    pub fn subscribe(&mut self, bridge: CoordinationBridge) {
        self.bridges.push(bridge);
    }

    /// Checks the file once. Returns the number of snapshots published.
    pub fn poll_once(&mut self) -> usize {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "membership file unreadable");
                return 0;
            }
        };
        if self.last_contents.as_deref() == Some(contents.as_str()) {
            return 0;
        }
        let records: Vec<NodeRecord> = match serde_json::from_str(&contents) {
            Ok(r) => r,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "membership file is not valid JSON");
                return 0;
            }
        };
        self.last_contents = Some(contents);

        let mut by_type: BTreeMap<String, Vec<NodeRecord>> = BTreeMap::new();
        for record in records {
            by_type.entry(record.node_type.clone()).or_default().push(record);
        }
        for gone in &self.types {
            by_type.entry(gone.clone()).or_default();
        }
        self.types = by_type
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(node_type, _)| node_type.clone())
            .collect();

        let published = by_type.len();
        for (node_type, records) in by_type {
            debug!(node_type = %node_type, count = records.len(), "publishing membership snapshot");
            let event = CoordinationEvent::Snapshot { node_type, records };
            for bridge in &self.bridges {
                bridge.publish(event.clone());
            }
        }
        published
    }

    /// Starts polling on a dedicated thread.
    pub fn spawn(mut self) -> std::io::Result<MembershipHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        info!(path = %self.path.display(), interval_ms = self.poll_interval.as_millis() as u64, "starting membership feed");
        let thread = thread::Builder::new()
            .name("skein-membership".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    self.poll_once();
                    thread::park_timeout(self.poll_interval);
                }
                debug!("membership feed stopped");
            })?;
        Ok(MembershipHandle {
            stop,
            thread: Some(thread),
        })
    }
}

/// Controls a running membership feed. Dropping it stops the thread.
#[derive(Debug)]
pub struct MembershipHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MembershipHandle {
    /// Asks the feed to stop and waits for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                warn!("membership feed thread panicked");
            }
        }
    }
}

impl Drop for MembershipHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
