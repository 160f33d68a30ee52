use std::sync::Arc;

use super::cleanup::dispose_predicate;
use super::cleanup::CleanupSettings;
use super::tree::TreeInner;
use super::BuildFailureListener;
use super::BuildFn;
use super::Disposable;
use super::Subtree;
use super::TreeResource;
use super::Unset;
use crate::async_task::TaskPool;
use crate::async_task::TaskTracker;
use crate::source::NodeSnapshot;
use crate::source::TreeWatchSource;
use crate::BoxError;
use crate::Error;
use crate::ResourceConfig;
use crate::Result;

/// Builder state once the value type is known
pub struct TreeFactory<E> {
    factory: BuildFn<Subtree, E>,
    cleanup: CleanupSettings<E>,
    build_failure_listeners: Vec<BuildFailureListener<Subtree>>,
}

/// Type-safe builder for [`TreeResource`]
pub struct TreeResourceBuilder<T> {
    source: Arc<dyn TreeWatchSource>,
    config: ResourceConfig,
    pool: Option<TaskPool>,
    typed: T,
}

impl TreeResource<Unset> {
    pub fn builder(source: impl TreeWatchSource) -> TreeResourceBuilder<Unset> {
        TreeResourceBuilder::new(Arc::new(source))
    }
}

impl TreeResourceBuilder<Unset> {
    pub fn new(source: Arc<dyn TreeWatchSource>) -> Self {
        Self {
            source,
            config: ResourceConfig::default(),
            pool: None,
            typed: Unset,
        }
    }

    /// Build the value from the flattened subtree
    pub fn factory<E, F>(
        self,
        factory: F,
    ) -> TreeResourceBuilder<TreeFactory<E>>
    where
        E: Send + Sync + 'static,
        F: Fn(&Subtree) -> std::result::Result<E, BoxError> + Send + Sync + 'static,
    {
        self.arc_factory(move |subtree| factory(subtree).map(Arc::new))
    }

    pub fn arc_factory<E, F>(
        self,
        factory: F,
    ) -> TreeResourceBuilder<TreeFactory<E>>
    where
        E: Send + Sync + 'static,
        F: Fn(&Subtree) -> std::result::Result<Arc<E>, BoxError> + Send + Sync + 'static,
    {
        TreeResourceBuilder {
            source: self.source,
            config: self.config,
            pool: self.pool,
            typed: TreeFactory {
                factory: Arc::new(factory),
                cleanup: CleanupSettings::default(),
                build_failure_listeners: Vec::new(),
            },
        }
    }

    /// Factory over the snapshots of every node below the root, in path order
    pub fn children_factory<E, F>(
        self,
        factory: F,
    ) -> TreeResourceBuilder<TreeFactory<E>>
    where
        E: Send + Sync + 'static,
        F: Fn(&[NodeSnapshot]) -> std::result::Result<E, BoxError> + Send + Sync + 'static,
    {
        self.factory(move |subtree| {
            let children: Vec<NodeSnapshot> = subtree.values().cloned().collect();
            factory(&children)
        })
    }
}

impl<T> TreeResourceBuilder<T> {
    pub fn config(
        mut self,
        config: ResourceConfig,
    ) -> Self {
        self.config = config;
        self
    }

    pub fn task_pool(
        mut self,
        pool: TaskPool,
    ) -> Self {
        self.pool = Some(pool);
        self
    }
}

impl<E: Send + Sync + 'static> TreeResourceBuilder<TreeFactory<E>> {
    pub fn on_change(
        mut self,
        callback: impl Fn(Option<&Arc<E>>, Option<&Arc<E>>) + Send + Sync + 'static,
    ) -> Self {
        self.typed.cleanup.on_change = Some(Arc::new(callback));
        self
    }

    pub fn cleanup_predicate(
        mut self,
        predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.typed.cleanup.predicate(predicate);
        self
    }

    pub fn cleanup_consumer<Err: std::fmt::Debug>(
        mut self,
        consumer: impl Fn(&E) -> std::result::Result<(), Err> + Send + Sync + 'static,
    ) -> Self {
        self.typed.cleanup.consumer(consumer);
        self
    }

    pub fn build_failure_listener(
        mut self,
        listener: impl Fn(&Subtree, &BoxError) + Send + Sync + 'static,
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

    pub fn build(self) -> Result<TreeResource<E>> {
        let config = self.config.validate()?;
        let pool = match self.pool {
            Some(pool) => pool,
            None => TaskPool::shared()?,
        };
        let tracker = Arc::new(TaskTracker::default());
        let root = self.source.root().to_string();

        let typed = self.typed;
        let cleanup =
            typed.cleanup.into_cleanup(root.clone(), &config.cleanup, None, pool, tracker.clone());

        Ok(TreeResource::from_inner(TreeInner::new(
            root,
            self.source,
            typed.factory,
            cleanup,
            typed.build_failure_listeners,
            tracker,
            config.cleanup.clone(),
            config.tree.init_timeout(),
        )))
    }
}

impl<E: Disposable + Send + Sync + 'static> TreeResourceBuilder<TreeFactory<E>> {
    /// Dispose of superseded values through [`Disposable::dispose`]
    pub fn with_dispose(mut self) -> Self {
        self.typed.cleanup.predicate(dispose_predicate::<E>());
        self
    }
}
