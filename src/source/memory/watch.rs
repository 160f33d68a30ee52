use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::dispatcher::Dispatcher;
use super::StoreInner;
use super::WatchScope;
use crate::source::is_within;
use crate::source::Listener;
use crate::source::ListenerId;
use crate::source::NodeSnapshot;
use crate::source::NodeWatchSource;
use crate::source::TreeWatchSource;
use crate::source::WatchEvent;
use crate::Result;
use crate::SourceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchState {
    Idle,
    Started,
    Closed,
}

/// Registration and notification thread shared by node and tree watches
struct WatchCore {
    store: Arc<StoreInner>,
    id: u64,
    scope: WatchScope,
    path: String,
    dispatcher: Dispatcher,
    state: Mutex<WatchState>,
}

impl WatchCore {
    fn new(
        store: Arc<StoreInner>,
        scope: WatchScope,
        path: String,
    ) -> Self {
        let id = store.next_watch_id();
        let dispatcher = Dispatcher::new(format!("{}:{}", store.name(), path));
        Self {
            store,
            id,
            scope,
            path,
            dispatcher,
            state: Mutex::new(WatchState::Idle),
        }
    }

    /// Returns `true` when this call performed the start
    fn start(&self) -> Result<bool> {
        let mut state = self.state.lock();
        match *state {
            WatchState::Started => Ok(false),
            WatchState::Closed => Err(SourceError::Closed {
                path: self.path.clone(),
            }
            .into()),
            WatchState::Idle => {
                self.dispatcher.start()?;
                self.store
                    .register_watch(self.id, self.scope.clone(), self.dispatcher.sender());
                *state = WatchState::Started;
                debug!(store = %self.store.name(), path = %self.path, "Watch started");
                Ok(true)
            }
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if *state == WatchState::Closed {
            return;
        }
        self.store.unregister_watch(self.id);
        *state = WatchState::Closed;
        drop(state);

        self.dispatcher.stop();
        debug!(store = %self.store.name(), path = %self.path, "Watch closed");
    }
}

impl Drop for WatchCore {
    fn drop(&mut self) {
        self.store.unregister_watch(self.id);
    }
}

/// Watch over one path of a [`MemoryStore`](super::MemoryStore)
pub struct MemoryNodeWatch {
    core: WatchCore,
}

impl MemoryNodeWatch {
    pub(super) fn new(
        store: Arc<StoreInner>,
        path: String,
    ) -> Self {
        Self {
            core: WatchCore::new(store, WatchScope::Node(path.clone()), path),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.core.dispatcher.listener_count()
    }
}

impl NodeWatchSource for MemoryNodeWatch {
    fn path(&self) -> &str {
        &self.core.path
    }

    fn start(&self) -> Result<()> {
        self.core.start().map(|_| ())
    }

    fn current(&self) -> Option<NodeSnapshot> {
        self.core.store.get(&self.core.path)
    }

    fn add_listener(
        &self,
        listener: Listener,
    ) -> ListenerId {
        self.core.dispatcher.add_listener(listener)
    }

    fn remove_listener(
        &self,
        id: ListenerId,
    ) {
        self.core.dispatcher.remove_listener(id)
    }

    fn close(&self) -> Result<()> {
        self.core.close();
        Ok(())
    }
}

/// Watch over a subtree of a [`MemoryStore`](super::MemoryStore)
///
/// `start()` registers the watch and then queues
/// [`WatchEvent::InitialSyncDone`]; every later write below the root is
/// reported as [`WatchEvent::Changed`].
pub struct MemoryTreeWatch {
    core: WatchCore,
}

impl MemoryTreeWatch {
    pub(super) fn new(
        store: Arc<StoreInner>,
        root: String,
    ) -> Self {
        Self {
            core: WatchCore::new(store, WatchScope::Tree(root.clone()), root),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.core.dispatcher.listener_count()
    }
}

impl TreeWatchSource for MemoryTreeWatch {
    fn root(&self) -> &str {
        &self.core.path
    }

    fn start(&self) -> Result<()> {
        if self.core.start()? {
            let _ = self.core.dispatcher.sender().send(WatchEvent::InitialSyncDone);
        }
        Ok(())
    }

    fn current(
        &self,
        path: &str,
    ) -> Option<NodeSnapshot> {
        if !is_within(&self.core.path, path) {
            return None;
        }
        self.core.store.get(path)
    }

    fn children(
        &self,
        path: &str,
    ) -> Option<BTreeMap<String, NodeSnapshot>> {
        if !is_within(&self.core.path, path) {
            return None;
        }
        self.core.store.children(path)
    }

    fn add_listener(
        &self,
        listener: Listener,
    ) -> ListenerId {
        self.core.dispatcher.add_listener(listener)
    }

    fn remove_listener(
        &self,
        id: ListenerId,
    ) {
        self.core.dispatcher.remove_listener(id)
    }

    fn close(&self) -> Result<()> {
        self.core.close();
        Ok(())
    }
}
