use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::existence::AtomicExistence;
use super::report_build_failure;
use super::BuildFailureListener;
use super::BuildFn;
use super::DeferredCleanup;
use super::ExistenceState;
use super::Followup;
use super::RefreshStrategy;
use crate::async_task::TaskPool;
use crate::async_task::TaskTracker;
use crate::source::ListenerId;
use crate::source::NodeSnapshot;
use crate::source::NodeWatchSource;
use crate::source::WatchEvent;
use crate::BoxError;
use crate::CleanupConfig;
use crate::Error;
use crate::Result;

/// Lazily built value backed by a single watched node
///
/// The first [`get`](Self::get) attaches to the watch source and runs the
/// build factory; later calls return the cached `Arc<E>` without locking.
/// Each change of the node rebuilds the value and hands the superseded one
/// to a deferred cleanup task.
///
/// Cloning is cheap: clones share the same value and lifecycle.
pub struct NodeResource<E> {
    inner: Arc<NodeInner<E>>,
}

impl<E> Clone for NodeResource<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> std::fmt::Debug for NodeResource<E> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("NodeResource")
            .field("path", &self.inner.path)
            .field("existence", &self.inner.existence.load())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct NodeState {
    listener: Option<ListenerId>,
    /// Bumped for every change notification
    generation: u64,
    /// Generation of the published value
    applied: u64,
}

pub(crate) struct NodeInner<E> {
    pub(crate) path: String,
    pub(crate) source: Arc<dyn NodeWatchSource>,
    pub(crate) factory: BuildFn<NodeSnapshot, E>,
    pub(crate) refresh: RefreshStrategy<E>,
    pub(crate) empty: Option<Arc<E>>,
    pub(crate) cleanup: Arc<DeferredCleanup<E>>,
    pub(crate) build_failure_listeners: Vec<BuildFailureListener<NodeSnapshot>>,
    pub(crate) pool: TaskPool,
    pub(crate) tracker: Arc<TaskTracker>,
    pub(crate) cleanup_config: CleanupConfig,
    value: ArcSwapOption<E>,
    existence: AtomicExistence,
    closed: AtomicBool,
    state: Mutex<NodeState>,
}

impl<E: Send + Sync + 'static> NodeResource<E> {
    pub(crate) fn from_inner(inner: NodeInner<E>) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Current value, building it on first access.
    ///
    /// Returns the empty object (or `None` when none was configured) while
    /// the node does not exist.
    pub fn get(&self) -> Result<Option<Arc<E>>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::closed(&inner.path));
        }
        if inner.existence.load() == ExistenceState::NotExists {
            return Ok(inner.empty.clone());
        }
        if let Some(value) = inner.value.load_full() {
            return Ok(Some(value));
        }
        inner.initialize()
    }

    /// Release the watch and dispose of the current value.
    ///
    /// Idempotent. The value is disposed with a single predicate call; a
    /// superseded value still waiting in a cleanup task is left to that task.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// [`close`](Self::close) that only logs failures
    pub fn close_quietly(&self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.close() {
            warn!(path = %self.inner.path, "Failed to close resource: {}", e);
        }
    }

    /// Close, then wait for this resource's refresh and cleanup tasks.
    ///
    /// Returns `Ok(false)` when `timeout` expired first. Must not be called
    /// from a change callback or a cleanup predicate of the same resource.
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

    pub fn existence(&self) -> ExistenceState {
        self.inner.existence.load()
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Number of refresh and cleanup tasks still running
    pub fn pending_tasks(&self) -> usize {
        self.inner.tracker.inflight()
    }
}

impl<E: Send + Sync + 'static> NodeInner<E> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        path: String,
        source: Arc<dyn NodeWatchSource>,
        factory: BuildFn<NodeSnapshot, E>,
        refresh: RefreshStrategy<E>,
        empty: Option<Arc<E>>,
        cleanup: Arc<DeferredCleanup<E>>,
        build_failure_listeners: Vec<BuildFailureListener<NodeSnapshot>>,
        pool: TaskPool,
        tracker: Arc<TaskTracker>,
        cleanup_config: CleanupConfig,
    ) -> Self {
        Self {
            path,
            source,
            factory,
            refresh,
            empty,
            cleanup,
            build_failure_listeners,
            pool,
            tracker,
            cleanup_config,
            value: ArcSwapOption::empty(),
            existence: AtomicExistence::default(),
            closed: AtomicBool::new(false),
            state: Mutex::new(NodeState::default()),
        }
    }

    /// Slow path of `get()`: everything is re-checked under the lock, the
    /// change callback fires after it is released
    fn initialize(self: &Arc<Self>) -> Result<Option<Arc<E>>> {
        let (snapshot, outcome) = {
            let mut state = self.state.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::closed(&self.path));
            }
            if self.existence.load() == ExistenceState::NotExists {
                return Ok(self.empty.clone());
            }
            if let Some(value) = self.value.load_full() {
                return Ok(Some(value));
            }

            if state.listener.is_none() {
                state.listener = Some(self.attach()?);
            }

            let Some(snapshot) = self.source.current() else {
                self.existence.store(ExistenceState::NotExists);
                warn!(path = %self.path, "Node does not exist, serving empty object");
                return Ok(self.empty.clone());
            };

            self.existence.store(ExistenceState::Exists);
            let outcome = (self.factory)(&snapshot);
            if let Ok(value) = &outcome {
                state.applied = state.generation;
                self.value.store(Some(value.clone()));
                debug!(path = %self.path, version = snapshot.stat.version, "Resource built");
            }
            (snapshot, outcome)
        };

        match outcome {
            Ok(value) => {
                self.cleanup.schedule(Some(value.clone()), self.empty.clone());
                Ok(Some(value))
            }
            Err(e) => {
                error!(path = %self.path, "Failed to build resource: {}", e);
                report_build_failure(&self.path, &self.build_failure_listeners, &snapshot, &e);
                Err(Error::build(&self.path, e))
            }
        }
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
        debug!(path = %self.path, %id, "Attached to node watch");
        Ok(id)
    }

    fn on_event(
        self: &Arc<Self>,
        event: WatchEvent,
    ) {
        if event != WatchEvent::Changed {
            debug!(path = %self.path, ?event, "Ignoring watch event");
            return;
        }

        let mut state = self.state.lock();
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        state.generation += 1;
        let generation = state.generation;

        let Some(snapshot) = self.source.current() else {
            state.applied = generation;
            self.existence.store(ExistenceState::NotExists);
            let removed = self.value.swap(None);
            drop(state);
            if let Some(old) = removed {
                info!(path = %self.path, "Node removed, releasing resource");
                self.cleanup.schedule(self.empty.clone(), Some(old));
            }
            return;
        };

        self.existence.store(ExistenceState::Exists);
        trace!(path = %self.path, generation, version = snapshot.stat.version, "Refreshing resource");

        match &self.refresh {
            RefreshStrategy::Inline => {
                let result = (self.factory)(&snapshot);
                let followup = self.complete_refresh(&mut state, generation, snapshot, result);
                drop(state);
                followup.run(&self.path, &self.cleanup, &self.build_failure_listeners);
            }
            RefreshStrategy::Blocking(factory) => {
                drop(state);
                let factory = factory.clone();
                let this = self.clone();
                self.pool.spawn_task(&format!("refresh [{}]", self.path), &self.tracker, async move {
                    let input = snapshot.clone();
                    let result = tokio::task::spawn_blocking(move || factory(&input))
                        .await
                        .unwrap_or_else(|join_error| Err(Box::new(join_error) as BoxError));
                    this.finish_refresh(generation, snapshot, result);
                    Ok(())
                });
            }
            RefreshStrategy::Async(factory) => {
                drop(state);
                let future = factory(&snapshot);
                let this = self.clone();
                self.pool.spawn_task(&format!("refresh [{}]", self.path), &self.tracker, async move {
                    let result = future.await;
                    this.finish_refresh(generation, snapshot, result);
                    Ok(())
                });
            }
        }
    }

    fn finish_refresh(
        &self,
        generation: u64,
        snapshot: NodeSnapshot,
        result: std::result::Result<Arc<E>, BoxError>,
    ) {
        let followup = {
            let mut state = self.state.lock();
            self.complete_refresh(&mut state, generation, snapshot, result)
        };
        followup.run(&self.path, &self.cleanup, &self.build_failure_listeners);
    }

    /// Publish a refresh result, unless it is stale or the resource closed
    fn complete_refresh(
        &self,
        state: &mut NodeState,
        generation: u64,
        snapshot: NodeSnapshot,
        result: std::result::Result<Arc<E>, BoxError>,
    ) -> Followup<E, NodeSnapshot> {
        let new = match result {
            Ok(new) => new,
            Err(error) => {
                error!(path = %self.path, "Failed to rebuild resource, keeping previous value: {}", error);
                return Followup::BuildFailed {
                    input: snapshot,
                    error,
                };
            }
        };

        let current = self.value.load_full();
        let unchanged = current.as_ref().is_some_and(|current| Arc::ptr_eq(current, &new));
        let orphan = if unchanged {
            Followup::Nothing
        } else {
            Followup::Discard(new.clone())
        };
        if self.closed.load(Ordering::Acquire) {
            debug!(path = %self.path, "Refresh finished after close, disposing result");
            return orphan;
        }
        if generation < state.applied {
            debug!(
                path = %self.path,
                generation,
                applied = state.applied,
                "Discarding stale refresh result"
            );
            return orphan;
        }

        state.applied = generation;
        let old = self.value.swap(Some(new.clone())).or_else(|| self.empty.clone());
        debug!(path = %self.path, version = snapshot.stat.version, "Resource refreshed");
        Followup::Swapped {
            new: Some(new),
            old,
        }
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let listener = state.listener.take();
        let current = self.value.swap(None);
        drop(state);

        if let Some(id) = listener {
            self.source.remove_listener(id);
        }
        let source_result = self.source.close();
        info!(path = %self.path, "Resource closed");

        let disposal_result = match current {
            Some(current) => self.cleanup.dispose_now(&current),
            None => Ok(()),
        };

        if self.cleanup_config.join_on_close
            && !self.tracker.wait_idle(self.cleanup_config.join_timeout())
        {
            warn!(
                path = %self.path,
                pending = self.tracker.inflight(),
                "Cleanup tasks still running after close"
            );
        }
        source_result.and(disposal_result)
    }
}
