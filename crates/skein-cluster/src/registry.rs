//! Consistent-hash registry of cluster nodes.
//!
//! Every physical node (one worker of one host:port) owns a set of virtual
//! positions on the ring of its node type. A routing key is hashed and served
//! by the first virtual position at or after its hash, wrapping to the lowest
//! position. Positions depend only on the identity, the salt and the vnode
//! count, so every process holding the same membership routes identically.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RegistryError, Result};
use crate::hash::{vnode_hashes, HashAlgorithm};
use crate::record::{node_identity, NodeRecord};

/// Registry tuning. Every process in a cluster must agree on all three fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Virtual nodes generated per physical node.
    pub vnode_count: usize,
    /// Hash applied to routing keys.
    pub hash_algorithm: HashAlgorithm,
    /// Prefix mixed into every virtual node digest.
    pub salt: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            vnode_count: 200,
            hash_algorithm: HashAlgorithm::default(),
            salt: "skein".to_string(),
        }
    }
}

/// One worker of one registered host:port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalNode {
    /// `"<host>:<port>.<worker_index>"`.
    pub identity: Arc<str>,
    /// Node type; selects the ring.
    pub node_type: String,
    /// Host.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Worker index, starting at 1.
    pub worker_index: u32,
    /// Ring positions this node actually owns.
    pub vnodes: Vec<u32>,
}

/// Result of comparing local membership with an external path list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    /// Paths known externally but absent locally.
    pub adds: BTreeSet<String>,
    /// Paths held locally but no longer known externally.
    pub dels: BTreeSet<String>,
}

impl MembershipDiff {
    /// True when local and external membership agree.
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.dels.is_empty()
    }
}

/// Nodes and records removed while an update is in flight.
#[derive(Debug, Default)]
struct Displaced {
    nodes: Vec<PhysicalNode>,
    records: Vec<NodeRecord>,
}

/// Consistent-hash registry over all node types.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    config: RegistryConfig,
    rings: HashMap<String, BTreeMap<u32, Arc<str>>>,
    nodes: HashMap<Arc<str>, PhysicalNode>,
    records: BTreeMap<String, NodeRecord>,
    by_host_port: HashMap<String, String>,
    version: u64,
}

impl NodeRegistry {
    /// Creates an empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Bumped on every ring change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Adds one physical node to the ring of `node_type`.
    ///
    /// Returns `Ok(false)` if the identity is already registered. Virtual
    /// positions already owned by another node are skipped; if none remain the
    /// add fails and the ring is left untouched.
    pub fn add_node(
        &mut self,
        node_type: &str,
        host: &str,
        port: u16,
        worker_index: u32,
    ) -> Result<bool> {
        let identity: Arc<str> = Arc::from(node_identity(host, port, worker_index));
        if self.nodes.contains_key(&identity) {
            return Ok(false);
        }

        let ring = self.rings.entry(node_type.to_string()).or_default();
        let mut owned = Vec::with_capacity(self.config.vnode_count);
        for hash in vnode_hashes(&self.config.salt, &identity, self.config.vnode_count) {
            if ring.contains_key(&hash) {
                continue;
            }
            ring.insert(hash, Arc::clone(&identity));
            owned.push(hash);
        }

        if owned.is_empty() {
            if ring.is_empty() {
                self.rings.remove(node_type);
            }
            warn!(identity = %identity, "every virtual node collided");
            return Err(RegistryError::VnodeCollision {
                identity: identity.to_string(),
            });
        }
        if owned.len() < self.config.vnode_count {
            debug!(
                identity = %identity,
                skipped = self.config.vnode_count - owned.len(),
                "skipped colliding virtual nodes"
            );
        }

        self.nodes.insert(
            Arc::clone(&identity),
            PhysicalNode {
                identity,
                node_type: node_type.to_string(),
                host: host.to_string(),
                port,
                worker_index,
                vnodes: owned,
            },
        );
        self.version += 1;
        Ok(true)
    }

    /// Removes a physical node and all its ring positions.
    pub fn remove_node(&mut self, identity: &str) -> bool {
        self.take_node(identity).is_some()
    }

    /// Node serving `key` within `node_type`, or `None` if no node of that
    /// type is registered.
    pub fn lookup(&self, node_type: &str, key: &[u8]) -> Option<&PhysicalNode> {
        let ring = self.rings.get(node_type)?;
        let hash = self.config.hash_algorithm.hash(key);
        let (_, identity) = ring
            .range(hash..)
            .next()
            .or_else(|| ring.iter().next())?;
        self.nodes.get(identity)
    }

    /// Physical node by identity.
    pub fn get(&self, identity: &str) -> Option<&PhysicalNode> {
        self.nodes.get(identity)
    }

    /// Identities registered under `node_type`, sorted.
    pub fn nodes_of_type(&self, node_type: &str) -> Vec<Arc<str>> {
        let mut ids: Vec<_> = self
            .nodes
            .values()
            .filter(|n| n.node_type == node_type)
            .map(|n| Arc::clone(&n.identity))
            .collect();
        ids.sort();
        ids
    }

    /// Number of physical nodes across all types.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Ring positions held for `node_type`.
    pub fn vnode_count(&self, node_type: &str) -> usize {
        self.rings.get(node_type).map_or(0, BTreeMap::len)
    }

    /// Applies one record from the coordination service.
    ///
    /// A record for a host:port that already has a live record under another
    /// path must be strictly newer; the older record is then evicted. Worker
    /// indices above the new `worker_cnt` are dropped and `1..=worker_cnt` are
    /// ensured present. A rejected record leaves the registry unchanged.
    pub fn apply_authoritative_record(&mut self, record: NodeRecord) -> Result<()> {
        record.validate()?;
        let host_port = record.host_port();

        let evict = match self.by_host_port.get(&host_port) {
            Some(current_path) if *current_path != record.path => {
                let current_active_time = self
                    .records
                    .get(current_path)
                    .map_or(0, |r| r.active_time);
                if record.active_time <= current_active_time {
                    return Err(RegistryError::StaleRecord {
                        path: record.path,
                        host_port,
                        active_time: record.active_time,
                        current_path: current_path.clone(),
                        current_active_time,
                    });
                }
                Some(current_path.clone())
            }
            _ => None,
        };

        let previous = self.records.get(&record.path).cloned();
        if let Some(previous) = &previous {
            if *previous == record {
                return Ok(());
            }
            if previous.active_time > record.active_time {
                return Err(RegistryError::StaleRecord {
                    path: record.path,
                    host_port,
                    active_time: record.active_time,
                    current_path: previous.path.clone(),
                    current_active_time: previous.active_time,
                });
            }
        }

        let mut displaced = Displaced::default();
        if let Some(current_path) = evict {
            info!(
                evicted = %current_path,
                path = %record.path,
                host_port = %host_port,
                "newer record replaces live record"
            );
            self.take_record(&current_path, &mut displaced);
        }
        if let Some(previous) = previous {
            if previous.host_port() != host_port || previous.node_type != record.node_type {
                self.take_record(&previous.path, &mut displaced);
            } else {
                for worker in record.worker_cnt + 1..=previous.worker_cnt {
                    displaced.nodes.extend(self.take_node(&previous.identity(worker)));
                }
            }
        }

        let mut added = Vec::new();
        for worker in 1..=record.worker_cnt {
            match self.add_node(&record.node_type, &record.host, record.port, worker) {
                Ok(true) => added.push(record.identity(worker)),
                Ok(false) => {}
                Err(err) => {
                    for identity in &added {
                        self.remove_node(identity);
                    }
                    self.restore(displaced);
                    return Err(err);
                }
            }
        }

        debug!(
            path = %record.path,
            host_port = %host_port,
            workers = record.worker_cnt,
            "applied node record"
        );
        self.by_host_port.insert(host_port, record.path.clone());
        self.records.insert(record.path.clone(), record);
        Ok(())
    }

    /// Removes the record at `path` and every node it implied.
    pub fn remove_authoritative_record(&mut self, path: &str) -> bool {
        let mut displaced = Displaced::default();
        self.take_record(path, &mut displaced);
        !displaced.records.is_empty()
    }

    fn take_node(&mut self, identity: &str) -> Option<PhysicalNode> {
        let node = self.nodes.remove(identity)?;
        if let Some(ring) = self.rings.get_mut(&node.node_type) {
            for hash in &node.vnodes {
                ring.remove(hash);
            }
            if ring.is_empty() {
                self.rings.remove(&node.node_type);
            }
        }
        self.version += 1;
        Some(node)
    }

    fn take_record(&mut self, path: &str, displaced: &mut Displaced) {
        let Some(record) = self.records.remove(path) else {
            return;
        };
        for worker in 1..=record.worker_cnt {
            displaced.nodes.extend(self.take_node(&record.identity(worker)));
        }
        let host_port = record.host_port();
        if self.by_host_port.get(&host_port).map(String::as_str) == Some(path) {
            self.by_host_port.remove(&host_port);
        }
        debug!(path, "removed node record");
        displaced.records.push(record);
    }

    /// Puts back nodes and records taken by an update that failed. Their
    /// ring positions are exactly the ones they held before.
    fn restore(&mut self, displaced: Displaced) {
        for node in displaced.nodes {
            let ring = self.rings.entry(node.node_type.clone()).or_default();
            for hash in &node.vnodes {
                ring.insert(*hash, Arc::clone(&node.identity));
            }
            self.nodes.insert(Arc::clone(&node.identity), node);
        }
        for record in displaced.records {
            self.by_host_port
                .insert(record.host_port(), record.path.clone());
            self.records.insert(record.path.clone(), record);
        }
        self.version += 1;
    }

    /// Compares the local record paths of `node_type` with `known`.
    pub fn diff_against<'a, I>(&self, node_type: &str, known: I) -> MembershipDiff
    where
        I: IntoIterator<Item = &'a str>,
    {
        let known: BTreeSet<String> = known.into_iter().map(str::to_string).collect();
        let local: BTreeSet<String> = self
            .records
            .values()
            .filter(|r| r.node_type == node_type)
            .map(|r| r.path.clone())
            .collect();
        MembershipDiff {
            adds: known.difference(&local).cloned().collect(),
            dels: local.difference(&known).cloned().collect(),
        }
    }

    /// Converges the records of `node_type` to `snapshot`.
    ///
    /// Records missing from the snapshot are removed, then every snapshot
    /// record is applied. Records that fail to apply are logged and skipped.
    pub fn reconcile(&mut self, node_type: &str, snapshot: Vec<NodeRecord>) -> MembershipDiff {
        let diff = self.diff_against(node_type, snapshot.iter().map(|r| r.path.as_str()));
        for path in &diff.dels {
            self.remove_authoritative_record(path);
        }
        for record in snapshot {
            if record.node_type != node_type {
                warn!(path = %record.path, node_type = %record.node_type, "record type mismatch in snapshot");
                continue;
            }
            let path = record.path.clone();
            if let Err(err) = self.apply_authoritative_record(record) {
                warn!(path = %path, error = %err, "rejected node record");
            }
        }
        if !diff.is_empty() {
            info!(
                node_type,
                added = diff.adds.len(),
                removed = diff.dels.len(),
                "reconciled membership"
            );
        }
        diff
    }

    /// Live record at `path`.
    pub fn record(&self, path: &str) -> Option<&NodeRecord> {
        self.records.get(path)
    }

    /// Live records, ordered by path.
    pub fn records(&self) -> impl Iterator<Item = &NodeRecord> {
        self.records.values()
    }

    /// Forgets every node and record.
    pub fn clear(&mut self) {
        self.rings.clear();
        self.nodes.clear();
        self.records.clear();
        self.by_host_port.clear();
        self.version += 1;
    }
}
