use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::report_build_failure;
use super::BuildFailureListener;
use super::BuildFn;
use super::DeferredCleanup;
use super::Followup;
use super::Subtree;
use crate::async_task::TaskTracker;
use crate::source::relative_path;
use crate::source::ListenerId;
use crate::source::TreeWatchSource;
use crate::source::WatchEvent;
use crate::BoxError;
use crate::CleanupConfig;
use crate::Error;
use crate::Result;

/// Where a [`TreeResource`] is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeLifecycle {
    Uninitialized,
    /// A caller is waiting for the initial subtree sync
    Initializing,
    Ready,
    Closed,
}

/// Lazily built value backed by a whole watched subtree
///
/// The first [`get`](Self::get) subscribes to the subtree and blocks until
/// the initial sync is complete, then builds the value from the flattened
/// subtree. Every later change rebuilds from the full map.
pub struct TreeResource<E> {
    inner: Arc<TreeInner<E>>,
}

impl<E> Clone for TreeResource<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> std::fmt::Debug for TreeResource<E> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("TreeResource")
            .field("root", &self.inner.root)
            .field("lifecycle", &self.inner.state.lock().lifecycle)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct TreeState {
    lifecycle: TreeLifecycle,
    listener: Option<ListenerId>,
    /// Initial sync delivered by the source
    synced: bool,
}

pub(crate) struct TreeInner<E> {
    root: String,
    source: Arc<dyn TreeWatchSource>,
    factory: BuildFn<Subtree, E>,
    cleanup: Arc<DeferredCleanup<E>>,
    build_failure_listeners: Vec<BuildFailureListener<Subtree>>,
    tracker: Arc<TaskTracker>,
    cleanup_config: CleanupConfig,
    init_timeout: Option<Duration>,
    value: ArcSwapOption<E>,
    closed: AtomicBool,
    state: Mutex<TreeState>,
    changed: Condvar,
}

impl<E: Send + Sync + 'static> TreeResource<E> {
    pub(crate) fn from_inner(inner: TreeInner<E>) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Current value, subscribing and building it on first access.
    ///
    /// The first call blocks until the source reports its initial sync, up
    /// to the configured `tree.init_timeout_ms`.
    pub fn get(&self) -> Result<Arc<E>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::closed(&self.inner.root));
        }
        if let Some(value) = self.inner.value.load_full() {
            return Ok(value);
        }
        self.inner.initialize()
    }

    /// Dispose of the current value and release the subscription. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn close_quietly(&self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.close() {
            warn!(root = %self.inner.root, "Failed to close tree resource: {}", e);
        }
    }

    /// Close, then wait for outstanding cleanup tasks.
    ///
    /// Returns `Ok(false)` when `timeout` expired first.
    pub fn close_and_join(
        &self,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        self.close()?;
        Ok(self.inner.tracker.wait_idle(timeout))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn lifecycle(&self) -> TreeLifecycle {
        self.inner.state.lock().lifecycle
    }

    pub fn root(&self) -> &str {
        &self.inner.root
    }

    pub fn pending_tasks(&self) -> usize {
        self.inner.tracker.inflight()
    }
}

impl<E: Send + Sync + 'static> TreeInner<E> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        root: String,
        source: Arc<dyn TreeWatchSource>,
        factory: BuildFn<Subtree, E>,
        cleanup: Arc<DeferredCleanup<E>>,
        build_failure_listeners: Vec<BuildFailureListener<Subtree>>,
        tracker: Arc<TaskTracker>,
        cleanup_config: CleanupConfig,
        init_timeout: Option<Duration>,
    ) -> Self {
        Self {
            root,
            source,
            factory,
            cleanup,
            build_failure_listeners,
            tracker,
            cleanup_config,
            init_timeout,
            value: ArcSwapOption::empty(),
            closed: AtomicBool::new(false),
            state: Mutex::new(TreeState {
                lifecycle: TreeLifecycle::Uninitialized,
                listener: None,
                synced: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn initialize(self: &Arc<Self>) -> Result<Arc<E>> {
        let mut state = self.state.lock();
        loop {
            let lifecycle = state.lifecycle;
            match lifecycle {
                TreeLifecycle::Closed => return Err(Error::closed(&self.root)),
                TreeLifecycle::Ready => {
                    if let Some(value) = self.value.load_full() {
                        return Ok(value);
                    }
                    // The first build failed; try again
                    let (subtree, outcome) = self.build_initial();
                    drop(state);
                    return self.finish_initial(subtree, outcome);
                }
                TreeLifecycle::Initializing => self.changed.wait(&mut state),
                TreeLifecycle::Uninitialized => break,
            }
        }

        state.lifecycle = TreeLifecycle::Initializing;
        if state.listener.is_none() {
            match self.attach() {
                Ok(id) => state.listener = Some(id),
                Err(e) => {
                    state.lifecycle = TreeLifecycle::Uninitialized;
                    self.changed.notify_all();
                    return Err(e);
                }
            }
        }

        self.await_initial_sync(&mut state)?;

        state.lifecycle = TreeLifecycle::Ready;
        let (subtree, outcome) = self.build_initial();
        self.changed.notify_all();
        drop(state);
        self.finish_initial(subtree, outcome)
    }

    /// Wait on the condition variable, which releases the lock so the
    /// notification thread can deliver the sync.
    fn await_initial_sync(
        &self,
        state: &mut MutexGuard<'_, TreeState>,
    ) -> Result<()> {
        let deadline = self.init_timeout.map(|timeout| Instant::now() + timeout);
        while !state.synced && state.lifecycle == TreeLifecycle::Initializing {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(state, deadline).timed_out() && !state.synced {
                        if state.lifecycle == TreeLifecycle::Initializing {
                            state.lifecycle = TreeLifecycle::Uninitialized;
                            self.changed.notify_all();
                        }
                        warn!(root = %self.root, "Initial sync timed out");
                        return Err(Error::InitTimeout {
                            path: self.root.clone(),
                            timeout: self.init_timeout.unwrap_or_default(),
                        });
                    }
                }
                None => self.changed.wait(state),
            }
        }

        if state.lifecycle == TreeLifecycle::Closed {
            return Err(Error::closed(&self.root));
        }
        Ok(())
    }

    fn attach(self: &Arc<Self>) -> Result<ListenerId> {
        let weak = Arc::downgrade(self);
        let id = self.source.add_listener(Arc::new(move |event: WatchEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_event(event);
            }
        }));

        if let Err(e) = self.source.start() {
            self.source.remove_listener(id);
            return Err(e);
        }
        debug!(root = %self.root, %id, "Attached to subtree watch");
        Ok(id)
    }

    /// Caller holds the state lock
    fn build_initial(&self) -> (Subtree, std::result::Result<Arc<E>, BoxError>) {
        let subtree = flatten_subtree(self.source.as_ref(), &self.root);
        let outcome = (self.factory)(&subtree);
        if let Ok(value) = &outcome {
            self.value.store(Some(value.clone()));
            info!(root = %self.root, nodes = subtree.len(), "Tree resource built");
        }
        (subtree, outcome)
    }

    /// Notify about the first build, with the state lock released
    fn finish_initial(
        &self,
        subtree: Subtree,
        outcome: std::result::Result<Arc<E>, BoxError>,
    ) -> Result<Arc<E>> {
        match outcome {
            Ok(value) => {
                self.cleanup.schedule(Some(value.clone()), None);
                Ok(value)
            }
            Err(e) => {
                error!(root = %self.root, "Failed to build tree resource: {}", e);
                report_build_failure(&self.root, &self.build_failure_listeners, &subtree, &e);
                Err(Error::build(&self.root, e))
            }
        }
    }

    fn on_event(
        &self,
        event: WatchEvent,
    ) {
        let mut state = self.state.lock();
        if state.lifecycle == TreeLifecycle::Closed {
            return;
        }

        if !state.synced {
            if event == WatchEvent::InitialSyncDone {
                debug!(root = %self.root, "Initial sync done");
                state.synced = true;
                self.changed.notify_all();
            } else {
                debug!(root = %self.root, ?event, "Ignoring event before initial sync");
            }
            return;
        }

        match event {
            WatchEvent::ConnectionSuspended | WatchEvent::ConnectionLost => {
                warn!(root = %self.root, ?event, "Connection trouble, keeping last value");
                return;
            }
            WatchEvent::InitialSyncDone | WatchEvent::Changed => {}
        }

        if state.lifecycle != TreeLifecycle::Ready {
            return;
        }
        let followup = self.rebuild();
        drop(state);
        followup.run(&self.root, &self.cleanup, &self.build_failure_listeners);
    }

    /// Caller holds the state lock
    fn rebuild(&self) -> Followup<E, Subtree> {
        let subtree = flatten_subtree(self.source.as_ref(), &self.root);
        match (self.factory)(&subtree) {
            Ok(new) => {
                let old = self.value.swap(Some(new.clone()));
                debug!(root = %self.root, nodes = subtree.len(), "Tree resource rebuilt");
                Followup::Swapped {
                    new: Some(new),
                    old,
                }
            }
            Err(error) => {
                error!(root = %self.root, "Failed to rebuild tree resource, keeping previous value: {}", error);
                Followup::BuildFailed {
                    input: subtree,
                    error,
                }
            }
        }
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        state.lifecycle = TreeLifecycle::Closed;
        let listener = state.listener.take();
        let current = self.value.swap(None);
        self.changed.notify_all();
        drop(state);

        if let Some(id) = listener {
            self.source.remove_listener(id);
        }
        let source_result = self.source.close();
        info!(root = %self.root, "Tree resource closed");

        let disposal_result = match current {
            Some(current) => self.cleanup.dispose_now(&current),
            None => Ok(()),
        };

        if self.cleanup_config.join_on_close
            && !self.tracker.wait_idle(self.cleanup_config.join_timeout())
        {
            warn!(
                root = %self.root,
                pending = self.tracker.inflight(),
                "Cleanup tasks still running after close"
            );
        }
        source_result.and(disposal_result)
    }
}

/// Depth-first walk of everything below `root`.
///
/// Keys are paths with the `root` prefix stripped (see
/// [`relative_path`]); `root` itself is not part of the map.
pub fn flatten_subtree(
    source: &dyn TreeWatchSource,
    root: &str,
) -> Subtree {
    let mut subtree = Subtree::new();
    let mut pending = vec![root.to_string()];
    while let Some(path) = pending.pop() {
        let Some(children) = source.children(&path) else {
            continue;
        };
        for (child_path, snapshot) in children {
            subtree.insert(relative_path(root, &child_path).to_string(), snapshot);
            pending.push(child_path);
        }
    }
    subtree
}
