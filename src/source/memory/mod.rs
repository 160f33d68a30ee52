//! In-process hierarchical store with watch support
//!
//! [`MemoryStore`] models a ZooKeeper-like tree of nodes: every node has a
//! byte payload, a [`NodeStat`] and named children. Writes bump a store-wide
//! revision and notify matching watches through their own dispatcher thread.
//!
//! # Example
//!
//! ```ignore
//! let store = MemoryStore::new("local");
//! store.set_data("/app/feature", "on")?;
//!
//! let watch = store.node_watch("/app/feature")?;
//! watch.start()?;
//! assert_eq!(watch.current().unwrap().data, "on");
//! ```

mod dispatcher;
mod watch;


use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::Sender;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;
pub use watch::*;

use super::is_within;
use super::join_path;
use super::parent_path;
use super::validate_path;
use super::NodeSnapshot;
use super::NodeStat;
use super::WatchEvent;
use super::ROOT;
use crate::Result;
use crate::SourceError;

#[derive(Debug, Clone)]
struct StoredNode {
    data: Bytes,
    stat: NodeStat,
    children: BTreeSet<String>,
}

impl StoredNode {
    fn new(
        data: Bytes,
        revision: u64,
    ) -> Self {
        Self {
            stat: NodeStat {
                version: 0,
                created_revision: revision,
                modified_revision: revision,
                data_length: data.len(),
                num_children: 0,
            },
            data,
            children: BTreeSet::new(),
        }
    }

    fn snapshot(
        &self,
        path: &str,
    ) -> NodeSnapshot {
        NodeSnapshot {
            path: path.to_string(),
            data: self.data.clone(),
            stat: NodeStat {
                num_children: self.children.len(),
                ..self.stat
            },
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum WatchScope {
    Node(String),
    Tree(String),
}

impl WatchScope {
    fn matches(
        &self,
        changed: &str,
    ) -> bool {
        match self {
            WatchScope::Node(path) => path == changed,
            WatchScope::Tree(root) => is_within(root, changed),
        }
    }
}

struct Registration {
    scope: WatchScope,
    sender: Sender<WatchEvent>,
}

pub(crate) struct StoreInner {
    name: String,
    nodes: RwLock<BTreeMap<String, StoredNode>>,
    revision: AtomicU64,
    watches: DashMap<u64, Registration>,
    next_watch_id: AtomicU64,
}

impl StoreInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn next_watch_id(&self) -> u64 {
        self.next_watch_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_watch(
        &self,
        id: u64,
        scope: WatchScope,
        sender: Sender<WatchEvent>,
    ) {
        trace!(store = %self.name, watch_id = id, ?scope, "Watch registered");
        self.watches.insert(id, Registration { scope, sender });
    }

    pub(crate) fn unregister_watch(
        &self,
        id: u64,
    ) {
        if self.watches.remove(&id).is_some() {
            trace!(store = %self.name, watch_id = id, "Watch unregistered");
        }
    }

    pub(crate) fn get(
        &self,
        path: &str,
    ) -> Option<NodeSnapshot> {
        self.nodes.read().get(path).map(|node| node.snapshot(path))
    }

    pub(crate) fn children(
        &self,
        path: &str,
    ) -> Option<BTreeMap<String, NodeSnapshot>> {
        let nodes = self.nodes.read();
        let parent = nodes.get(path)?;
        Some(
            parent
                .children
                .iter()
                .filter_map(|name| {
                    let child_path = join_path(path, name);
                    nodes.get(&child_path).map(|child| {
                        let snapshot = child.snapshot(&child_path);
                        (child_path, snapshot)
                    })
                })
                .collect(),
        )
    }

    /// Enqueue `event` for every watch whose scope covers one of `changed`.
    /// Called after the write lock is released so listeners observe the update.
    fn notify(
        &self,
        changed: &[String],
    ) {
        for entry in self.watches.iter() {
            let registration = entry.value();
            if changed.iter().any(|path| registration.scope.matches(path)) {
                let _ = registration.sender.try_send(WatchEvent::Changed);
            }
        }
    }

    fn broadcast(
        &self,
        event: WatchEvent,
    ) {
        for entry in self.watches.iter() {
            let _ = entry.value().sender.try_send(event);
        }
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Shared handle to an in-process store
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("name", &self.inner.name)
            .field("revision", &self.inner.revision.load(Ordering::Relaxed))
            .field("watches", &self.inner.watches.len())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Create an empty store holding only the root node
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT.to_string(), StoredNode::new(Bytes::new(), 0));
        info!(store = %name, "Created in-memory store");

        Self {
            inner: Arc::new(StoreInner {
                name,
                nodes: RwLock::new(nodes),
                revision: AtomicU64::new(0),
                watches: DashMap::new(),
                next_watch_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current store-wide revision
    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::SeqCst)
    }

    pub fn get(
        &self,
        path: &str,
    ) -> Option<NodeSnapshot> {
        self.inner.get(path)
    }

    pub fn exists(
        &self,
        path: &str,
    ) -> bool {
        self.inner.nodes.read().contains_key(path)
    }

    /// Names of the direct children of `path`, sorted
    pub fn children(
        &self,
        path: &str,
    ) -> Result<Vec<String>> {
        let nodes = self.inner.nodes.read();
        let node = nodes.get(path).ok_or_else(|| SourceError::NoNode {
            path: path.to_string(),
        })?;
        Ok(node.children.iter().cloned().collect())
    }

    /// Create a node whose parent already exists
    pub fn create(
        &self,
        path: &str,
        data: impl Into<Bytes>,
    ) -> Result<NodeStat> {
        validate_path(path)?;
        let data = data.into();
        let stat = {
            let mut nodes = self.inner.nodes.write();
            if nodes.contains_key(path) {
                return Err(SourceError::NodeExists {
                    path: path.to_string(),
                }
                .into());
            }
            let parent = parent_path(path).ok_or_else(|| SourceError::NodeExists {
                path: path.to_string(),
            })?;
            if !nodes.contains_key(parent) {
                return Err(SourceError::NoNode {
                    path: parent.to_string(),
                }
                .into());
            }
            let revision = self.inner.next_revision();
            Self::insert_node(&mut nodes, path, data, revision)
        };

        debug!(store = %self.inner.name, %path, "Node created");
        self.inner.notify(&[path.to_string()]);
        Ok(stat)
    }

    /// Write `data` to `path`, creating the node and any missing parents
    /// (with empty data) when needed.
    pub fn set_data(
        &self,
        path: &str,
        data: impl Into<Bytes>,
    ) -> Result<NodeStat> {
        validate_path(path)?;
        let data = data.into();
        let mut changed = Vec::new();

        let stat = {
            let mut nodes = self.inner.nodes.write();
            let revision = self.inner.next_revision();

            let mut missing = Vec::new();
            let mut cursor = parent_path(path);
            while let Some(ancestor) = cursor {
                if nodes.contains_key(ancestor) {
                    break;
                }
                missing.push(ancestor.to_string());
                cursor = parent_path(ancestor);
            }
            for ancestor in missing.into_iter().rev() {
                Self::insert_node(&mut nodes, &ancestor, Bytes::new(), revision);
                changed.push(ancestor);
            }

            let stat = match nodes.get_mut(path) {
                Some(node) => {
                    node.stat.version += 1;
                    node.stat.modified_revision = revision;
                    node.stat.data_length = data.len();
                    node.data = data;
                    node.snapshot(path).stat
                }
                None => Self::insert_node(&mut nodes, path, data, revision),
            };
            changed.push(path.to_string());
            stat
        };

        trace!(store = %self.inner.name, %path, version = stat.version, "Node data set");
        self.inner.notify(&changed);
        Ok(stat)
    }

    /// Delete `path`. A missing node is not an error.
    ///
    /// Without `recursive`, a node with children is rejected.
    pub fn remove(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<()> {
        validate_path(path)?;
        if path == ROOT {
            return Err(SourceError::InvalidPath(path.to_string()).into());
        }

        let removed: Vec<String> = {
            let mut nodes = self.inner.nodes.write();
            let Some(node) = nodes.get(path) else {
                warn!(store = %self.inner.name, %path, "Node does not exist and cannot be removed");
                return Ok(());
            };
            if !node.children.is_empty() && !recursive {
                return Err(SourceError::NotEmpty {
                    path: path.to_string(),
                }
                .into());
            }

            let doomed: Vec<String> = nodes
                .keys()
                .filter(|key| is_within(path, key))
                .cloned()
                .collect();
            for key in &doomed {
                nodes.remove(key);
            }

            if let Some(parent) = parent_path(path) {
                let name = &path[path.rfind('/').map(|idx| idx + 1).unwrap_or(0)..];
                if let Some(parent_node) = nodes.get_mut(parent) {
                    parent_node.children.remove(name);
                }
            }
            self.inner.next_revision();
            doomed
        };

        debug!(store = %self.inner.name, %path, removed = removed.len(), "Node removed");
        self.inner.notify(&removed);
        Ok(())
    }

    /// Watch a single path. The watch is inert until `start()`.
    pub fn node_watch(
        &self,
        path: &str,
    ) -> Result<MemoryNodeWatch> {
        validate_path(path)?;
        Ok(MemoryNodeWatch::new(self.inner.clone(), path.to_string()))
    }

    /// Watch the subtree rooted at `root`. The watch is inert until `start()`.
    pub fn tree_watch(
        &self,
        root: &str,
    ) -> Result<MemoryTreeWatch> {
        validate_path(root)?;
        Ok(MemoryTreeWatch::new(self.inner.clone(), root.to_string()))
    }

    /// Simulate a suspended connection: every live watch is told its data may be stale
    pub fn suspend_connection(&self) {
        warn!(store = %self.inner.name, "Connection suspended");
        self.inner.broadcast(WatchEvent::ConnectionSuspended);
    }

    /// Simulate a lost session
    pub fn lose_connection(&self) {
        warn!(store = %self.inner.name, "Connection lost");
        self.inner.broadcast(WatchEvent::ConnectionLost);
    }

    /// Simulate a reconnect: watches resync as if their data changed
    pub fn reconnect(&self) {
        info!(store = %self.inner.name, "Connection re-established");
        self.inner.broadcast(WatchEvent::Changed);
    }

    /// Number of started watches bound to this store
    pub fn watch_count(&self) -> usize {
        self.inner.watches.len()
    }

    fn insert_node(
        nodes: &mut BTreeMap<String, StoredNode>,
        path: &str,
        data: Bytes,
        revision: u64,
    ) -> NodeStat {
        let node = StoredNode::new(data, revision);
        let stat = node.stat;
        nodes.insert(path.to_string(), node);

        if let Some(parent) = parent_path(path) {
            let name = &path[path.rfind('/').map(|idx| idx + 1).unwrap_or(0)..];
            if let Some(parent_node) = nodes.get_mut(parent) {
                parent_node.children.insert(name.to_string());
            }
        }
        stat
    }
}
