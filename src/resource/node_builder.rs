use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use super::cleanup::dispose_predicate;
use super::cleanup::CleanupSettings;
use super::node::NodeInner;
use super::BuildFailureListener;
use super::BuildFn;
use super::Disposable;
use super::NodeResource;
use super::RefreshStrategy;
use crate::async_task::TaskPool;
use crate::async_task::TaskTracker;
use crate::source::NodeSnapshot;
use crate::source::NodeWatchSource;
use crate::BoxError;
use crate::Error;
use crate::ResourceConfig;
use crate::Result;

/// Builder state before a factory fixes the value type
#[derive(Debug, Default)]
pub struct Unset;

/// Builder state once the value type is known
pub struct NodeFactory<E> {
    factory: BuildFn<NodeSnapshot, E>,
    refresh: RefreshStrategy<E>,
    empty: Option<Arc<E>>,
    cleanup: CleanupSettings<E>,
    build_failure_listeners: Vec<BuildFailureListener<NodeSnapshot>>,
}

/// Type-safe builder for [`NodeResource`]
///
/// ```ignore
/// let resource = NodeResource::builder(store.node_watch("/app/config")?)
///     .bytes_factory(|data| Ok(parse(data)?))
///     .on_change(|new, old| info!("config swapped"))
///     .with_dispose()
///     .build()?;
/// ```
pub struct NodeResourceBuilder<T> {
    source: Arc<dyn NodeWatchSource>,
    config: ResourceConfig,
    pool: Option<TaskPool>,
    typed: T,
}

// Anchored on `Unset` so `NodeResource::builder(..)` needs no type annotation;
// the factory picks the real value type.
impl NodeResource<Unset> {
    pub fn builder(source: impl NodeWatchSource) -> NodeResourceBuilder<Unset> {
        NodeResourceBuilder::new(Arc::new(source))
    }
}

impl NodeResourceBuilder<Unset> {
    pub fn new(source: Arc<dyn NodeWatchSource>) -> Self {
        Self {
            source,
            config: ResourceConfig::default(),
            pool: None,
            typed: Unset,
        }
    }

    /// Build the value from the node snapshot
    pub fn factory<E, F>(
        self,
        factory: F,
    ) -> NodeResourceBuilder<NodeFactory<E>>
    where
        E: Send + Sync + 'static,
        F: Fn(&NodeSnapshot) -> std::result::Result<E, BoxError> + Send + Sync + 'static,
    {
        self.arc_factory(move |snapshot| factory(snapshot).map(Arc::new))
    }

    /// Factory that may hand back an already shared value.
    ///
    /// Returning the published `Arc` again makes the refresh a no-op swap.
    pub fn arc_factory<E, F>(
        self,
        factory: F,
    ) -> NodeResourceBuilder<NodeFactory<E>>
    where
        E: Send + Sync + 'static,
        F: Fn(&NodeSnapshot) -> std::result::Result<Arc<E>, BoxError> + Send + Sync + 'static,
    {
        NodeResourceBuilder {
            source: self.source,
            config: self.config,
            pool: self.pool,
            typed: NodeFactory {
                factory: Arc::new(factory),
                refresh: RefreshStrategy::Inline,
                empty: None,
                cleanup: CleanupSettings::default(),
                build_failure_listeners: Vec::new(),
            },
        }
    }

    /// Factory over the raw node data
    pub fn bytes_factory<E, F>(
        self,
        factory: F,
    ) -> NodeResourceBuilder<NodeFactory<E>>
    where
        E: Send + Sync + 'static,
        F: Fn(&[u8]) -> std::result::Result<E, BoxError> + Send + Sync + 'static,
    {
        self.factory(move |snapshot| factory(&snapshot.data))
    }
}

impl<T> NodeResourceBuilder<T> {
    pub fn config(
        mut self,
        config: ResourceConfig,
    ) -> Self {
        self.config = config;
        self
    }

    /// Pool for refresh and cleanup tasks. Defaults to [`TaskPool::shared`].
    ///
    /// The runtime behind `pool` must outlive the resource.
    pub fn task_pool(
        mut self,
        pool: TaskPool,
    ) -> Self {
        self.pool = Some(pool);
        self
    }
}

impl<E: Send + Sync + 'static> NodeResourceBuilder<NodeFactory<E>> {
    /// Run refreshes on the pool's blocking threads instead of the
    /// notification thread. The first build still uses the build factory.
    pub fn blocking_refresh<R, F>(
        mut self,
        refresh: F,
    ) -> Self
    where
        R: Into<Arc<E>>,
        F: Fn(&NodeSnapshot) -> std::result::Result<R, BoxError> + Send + Sync + 'static,
    {
        self.typed.refresh = RefreshStrategy::Blocking(Arc::new(move |snapshot: &NodeSnapshot| {
            into_arc::<E, R>(refresh(snapshot))
        }));
        self
    }

    /// Refresh through a future driven by the task pool
    pub fn async_refresh<R, Fut, F>(
        mut self,
        refresh: F,
    ) -> Self
    where
        R: Into<Arc<E>> + 'static,
        Fut: Future<Output = std::result::Result<R, BoxError>> + Send + 'static,
        F: Fn(&NodeSnapshot) -> Fut + Send + Sync + 'static,
    {
        self.typed.refresh = RefreshStrategy::Async(Arc::new(
            move |snapshot: &NodeSnapshot| -> BoxFuture<'static, std::result::Result<Arc<E>, BoxError>> {
                refresh(snapshot).map(into_arc::<E, R>).boxed()
            },
        ));
        self
    }

    /// Served by `get()` while the node does not exist. Never disposed.
    pub fn empty_object(
        mut self,
        empty: impl Into<Arc<E>>,
    ) -> Self {
        self.typed.empty = Some(empty.into());
        self
    }

    pub fn on_change(
        mut self,
        callback: impl Fn(Option<&Arc<E>>, Option<&Arc<E>>) + Send + Sync + 'static,
    ) -> Self {
        self.typed.cleanup.on_change = Some(Arc::new(callback));
        self
    }

    /// Disposes of superseded values; `false` retries after the wait interval
    pub fn cleanup_predicate(
        mut self,
        predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.typed.cleanup.predicate(predicate);
        self
    }

    /// Fallible disposal; an error is logged and retried
    pub fn cleanup_consumer<Err: std::fmt::Debug>(
        mut self,
        consumer: impl Fn(&E) -> std::result::Result<(), Err> + Send + Sync + 'static,
    ) -> Self {
        self.typed.cleanup.consumer(consumer);
        self
    }

    pub fn build_failure_listener(
        mut self,
        listener: impl Fn(&NodeSnapshot, &BoxError) + Send + Sync + 'static,
    ) -> Self {
        self.typed.build_failure_listeners.push(Arc::new(listener));
        self
    }

    pub fn disposal_failure_listener(
        mut self,
        listener: impl Fn(&Error) + Send + Sync + 'static,
    ) -> Self {
        self.typed.cleanup.disposal_failure_listeners.push(Arc::new(listener));
        self
    }

    pub fn build(self) -> Result<NodeResource<E>> {
        let config = self.config.validate()?;
        let pool = match self.pool {
            Some(pool) => pool,
            None => TaskPool::shared()?,
        };
        let tracker = Arc::new(TaskTracker::default());
        let path = self.source.path().to_string();

        let typed = self.typed;
        let cleanup = typed.cleanup.into_cleanup(
            path.clone(),
            &config.cleanup,
            typed.empty.clone(),
            pool.clone(),
            tracker.clone(),
        );

        Ok(NodeResource::from_inner(NodeInner::new(
            path,
            self.source,
            typed.factory,
            typed.refresh,
            typed.empty,
            cleanup,
            typed.build_failure_listeners,
            pool,
            tracker,
            config.cleanup,
        )))
    }
}

impl<E: Disposable + Send + Sync + 'static> NodeResourceBuilder<NodeFactory<E>> {
    /// Dispose of superseded values through [`Disposable::dispose`]
    pub fn with_dispose(mut self) -> Self {
        self.typed.cleanup.predicate(dispose_predicate::<E>());
        self
    }
}

fn into_arc<E, R: Into<Arc<E>>>(
    result: std::result::Result<R, BoxError>
) -> std::result::Result<Arc<E>, BoxError> {
    result.map(Into::into)
}
