//! Watched resources
//!
//! A watched resource turns a [`NodeWatchSource`](crate::source::NodeWatchSource)
//! or [`TreeWatchSource`](crate::source::TreeWatchSource) into a lazily built,
//! auto-refreshing value:
//!
//! ```text
//! get() ──first call──► attach listener ─► snapshot ─► factory ─► publish
//!   │
//!   └──later calls────► published value (lock free)
//!
//! change event ─► rebuild ─► swap ─► DeferredCleanup(old) ─► on_change(new, old)
//! ```
//!
//! # Locking
//!
//! Every resource owns one mutex guarding its value, existence state and
//! closed flag. The fast path of `get()` reads the value published through
//! an `ArcSwapOption` and never takes the lock; the slow path, the change
//! handler and `close()` hold it for the whole check-and-mutate sequence,
//! so at most one build runs per resource at a time. Change callbacks and
//! failure listeners run after it is released and may call back into the
//! resource, `close()` included.
//!
//! # Identity
//!
//! Values are handed out as `Arc<E>`. Whether a rebuild replaced the value
//! is decided by `Arc::ptr_eq`, so a factory returning the same `Arc` again
//! is a no-op swap and nothing gets disposed.

mod cleanup;
mod existence;
mod node;
mod node_builder;
mod tree;
mod tree_builder;

#[cfg(test)]
mod tree_test;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use cleanup::*;
pub use existence::*;
use futures::future::BoxFuture;
pub use node::*;
pub use node_builder::*;
pub use tree::*;
pub use tree_builder::*;

use crate::source::NodeSnapshot;
use crate::BoxError;
use crate::Error;

/// Flattened subtree: path relative to the watched root → snapshot
pub type Subtree = BTreeMap<String, NodeSnapshot>;

/// Values that hold something to release when superseded
///
/// Builders offer `with_dispose()` for such types: the superseded value's
/// `dispose()` is called by the deferred cleanup, and an error makes the
/// cleanup retry.
pub trait Disposable {
    fn dispose(&self) -> Result<(), BoxError>;
}

/// Invoked with `(new, old)` whenever the published value changes
pub type ChangeCallback<E> = Arc<dyn Fn(Option<&Arc<E>>, Option<&Arc<E>>) + Send + Sync>;

/// Disposes of a value; `false` asks the cleanup task to retry later
pub type CleanupPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Notified with the input and the error whenever a factory fails
pub type BuildFailureListener<S> = Arc<dyn Fn(&S, &BoxError) + Send + Sync>;

/// Notified when a deferred cleanup fails for good
pub type DisposalFailureListener = Arc<dyn Fn(&Error) + Send + Sync>;

pub(crate) type BuildFn<S, E> = Arc<dyn Fn(&S) -> Result<Arc<E>, BoxError> + Send + Sync>;

pub(crate) type AsyncBuildFn<S, E> =
    Arc<dyn Fn(&S) -> BoxFuture<'static, Result<Arc<E>, BoxError>> + Send + Sync>;

/// How a node resource rebuilds after a change notification
pub(crate) enum RefreshStrategy<E> {
    /// Build factory on the notification thread
    Inline,
    /// Blocking factory on the task pool's blocking threads
    Blocking(BuildFn<NodeSnapshot, E>),
    /// Future returned by the factory, driven by the task pool
    Async(AsyncBuildFn<NodeSnapshot, E>),
}

/// Notification work decided under a resource's state lock.
///
/// Run only after the guard is dropped: callbacks and listeners may call
/// back into the same resource.
#[must_use]
pub(crate) enum Followup<E, S> {
    Nothing,
    /// Built but never published
    Discard(Arc<E>),
    Swapped {
        new: Option<Arc<E>>,
        old: Option<Arc<E>>,
    },
    BuildFailed {
        input: S,
        error: BoxError,
    },
}

impl<E: Send + Sync + 'static, S> Followup<E, S> {
    pub(crate) fn run(
        self,
        path: &str,
        cleanup: &Arc<DeferredCleanup<E>>,
        listeners: &[BuildFailureListener<S>],
    ) {
        match self {
            Followup::Nothing => {}
            Followup::Discard(orphan) => cleanup.discard(orphan),
            Followup::Swapped { new, old } => cleanup.schedule(new, old),
            Followup::BuildFailed { input, error } => {
                report_build_failure(path, listeners, &input, &error)
            }
        }
    }
}

/// Call every listener, logging (never propagating) listener panics
pub(crate) fn report_build_failure<S>(
    path: &str,
    listeners: &[BuildFailureListener<S>],
    input: &S,
    error: &BoxError,
) {
    for listener in listeners {
        if let Err(payload) =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(input, error)))
        {
            tracing::error!(
                %path,
                "Build failure listener panicked: {}",
                crate::errors::panic_message(payload.as_ref())
            );
        }
    }
}
