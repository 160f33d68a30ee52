//! Watch Source contract
//!
//! A watch source exposes point-in-time snapshots of one path (or of a whole
//! subtree) and delivers change notifications on its own notification
//! thread. Resources only read snapshots; the source alone mutates them and
//! notifies after the update is visible.
//!
//! ```text
//!   store write ──► source cache updated ──► listener(WatchEvent) ──► resource rebuild
//! ```
//!
//! [`memory::MemoryStore`] is the in-process implementation used by the
//! tests and by applications that keep their configuration tree in memory.

pub mod memory;
mod path;


use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
pub use path::*;

use crate::Result;

/// Notification tags delivered to watch listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEvent {
    /// The subtree watch finished its initial full read
    InitialSyncDone,
    /// Data under the watched path was created, updated or removed
    Changed,
    /// The store connection is suspended; cached data may be stale
    ConnectionSuspended,
    /// The store session is gone
    ConnectionLost,
}

/// Version metadata attached to every stored node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStat {
    /// Data version, bumped on every write to the node
    pub version: u64,
    /// Store revision that created the node
    pub created_revision: u64,
    /// Store revision of the last write to the node
    pub modified_revision: u64,
    pub data_length: usize,
    pub num_children: usize,
}

/// Point-in-time read of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub path: String,
    pub data: Bytes,
    pub stat: NodeStat,
}

/// Identifies a registered listener so it can be removed again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Callback invoked on the source's notification thread
pub type Listener = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Watch over a single path
#[cfg_attr(test, automock)]
pub trait NodeWatchSource: Send + Sync + 'static {
    fn path(&self) -> &str;

    /// Begin watching. Calling it again on a started source is a no-op.
    fn start(&self) -> Result<()>;

    /// Current snapshot, `None` when the node does not exist
    fn current(&self) -> Option<NodeSnapshot>;

    fn add_listener(
        &self,
        listener: Listener,
    ) -> ListenerId;

    fn remove_listener(
        &self,
        id: ListenerId,
    );

    /// Release the subscription
    fn close(&self) -> Result<()>;
}

/// Watch over a whole subtree
///
/// `start()` must eventually deliver [`WatchEvent::InitialSyncDone`] to the
/// listeners; notifications before that are not meaningful.
#[cfg_attr(test, automock)]
pub trait TreeWatchSource: Send + Sync + 'static {
    fn root(&self) -> &str;

    fn start(&self) -> Result<()>;

    fn current(
        &self,
        path: &str,
    ) -> Option<NodeSnapshot>;

    /// Direct children of `path` keyed by their full path, `None` when
    /// `path` is not in the watched tree
    fn children(
        &self,
        path: &str,
    ) -> Option<BTreeMap<String, NodeSnapshot>>;

    fn add_listener(
        &self,
        listener: Listener,
    ) -> ListenerId;

    fn remove_listener(
        &self,
        id: ListenerId,
    );

    fn close(&self) -> Result<()>;
}
