//! Deferred, retrying disposal of superseded values
//!
//! When a rebuild replaces a value, the old instance may still be in use by
//! readers that fetched it just before the swap. Instead of disposing it on
//! the thread that detected the change, a cleanup task is spawned on the
//! resource's [`TaskPool`]:
//!
//! ```text
//! loop {
//!     sleep(wait)            // skipped when wait = 0
//!     predicate(old)?        // on a blocking thread
//!         true  => break
//!         false => retry     // until max_attempts, unbounded by default
//! }
//! on_change(new, old)
//! ```
//!
//! A predicate panic ends the task: it is logged and forwarded to the
//! disposal-failure listeners, so the missing `on_change` call is never
//! silent. The same goes for a task dropped before it finished, which is
//! what happens to tasks of a runtime that shuts down.

use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use super::ChangeCallback;
use super::CleanupPredicate;
use super::Disposable;
use super::DisposalFailureListener;
use crate::async_task::TaskPool;
use crate::async_task::TaskTracker;
use crate::errors::panic_message;
use crate::CleanupConfig;
use crate::Error;
use crate::Result;

/// Cleanup-related builder inputs shared by node and tree builders
pub(crate) struct CleanupSettings<E> {
    pub(crate) predicate: Option<CleanupPredicate<E>>,
    pub(crate) on_change: Option<ChangeCallback<E>>,
    pub(crate) disposal_failure_listeners: Vec<DisposalFailureListener>,
}

impl<E> Default for CleanupSettings<E> {
    fn default() -> Self {
        Self {
            predicate: None,
            on_change: None,
            disposal_failure_listeners: Vec::new(),
        }
    }
}

impl<E: Send + Sync + 'static> CleanupSettings<E> {
    pub(crate) fn predicate(
        &mut self,
        predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) {
        self.predicate = Some(Arc::new(predicate));
    }

    /// Adapt a fallible consumer: an error is logged and the cleanup retried
    pub(crate) fn consumer<Err>(
        &mut self,
        consumer: impl Fn(&E) -> std::result::Result<(), Err> + Send + Sync + 'static,
    ) where
        Err: std::fmt::Debug,
    {
        self.predicate(move |value| match consumer(value) {
            Ok(()) => true,
            Err(e) => {
                error!("fail to dispose resource: {:?}", e);
                false
            }
        });
    }

    pub(crate) fn into_cleanup(
        self,
        path: String,
        config: &CleanupConfig,
        empty: Option<Arc<E>>,
        pool: TaskPool,
        tracker: Arc<TaskTracker>,
    ) -> Arc<DeferredCleanup<E>> {
        let predicate: CleanupPredicate<E> = match self.predicate {
            Some(predicate) => predicate,
            None => Arc::new(|_: &E| true),
        };
        Arc::new(DeferredCleanup {
            path,
            predicate,
            on_change: self.on_change,
            empty,
            wait: config.wait_interval(),
            max_attempts: config.attempt_limit(),
            failure_listeners: self.disposal_failure_listeners,
            pool,
            tracker,
        })
    }
}

/// Predicate for [`Disposable`] values: success unless `dispose()` fails
pub(crate) fn dispose_predicate<E: Disposable>() -> impl Fn(&E) -> bool + Send + Sync + 'static {
    |value: &E| match value.dispose() {
        Ok(()) => true,
        Err(e) => {
            error!("fail to dispose resource: {}", e);
            false
        }
    }
}

pub struct DeferredCleanup<E> {
    path: String,
    predicate: CleanupPredicate<E>,
    on_change: Option<ChangeCallback<E>>,
    empty: Option<Arc<E>>,
    wait: Duration,
    max_attempts: Option<u32>,
    failure_listeners: Vec<DisposalFailureListener>,
    pool: TaskPool,
    tracker: Arc<TaskTracker>,
}

impl<E> std::fmt::Debug for DeferredCleanup<E> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("DeferredCleanup")
            .field("path", &self.path)
            .field("wait", &self.wait)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl<E: Send + Sync + 'static> DeferredCleanup<E> {
    /// Hand a superseded value over for disposal.
    ///
    /// A cleanup task is spawned only when `old` is a real value (not the
    /// empty object) and a different instance than `new`. Otherwise the
    /// change callback fires right away on the calling thread.
    pub(crate) fn schedule(
        self: &Arc<Self>,
        new: Option<Arc<E>>,
        old: Option<Arc<E>>,
    ) {
        let old = match old {
            Some(old) if !self.is_empty_object(&old) && !same_instance(new.as_ref(), &old) => old,
            old => {
                self.notify_change(new.as_ref(), old.as_ref());
                return;
            }
        };

        trace!(path = %self.path, "Scheduling cleanup of superseded resource");
        let this = self.clone();
        let unfinished = Unfinished::arm(self.clone());
        self.pool.spawn_task(&format!("cleanup [{}]", self.path), &self.tracker, async move {
            let result = this.run(new, old).await;
            unfinished.disarm();
            result
        });
    }

    /// Dispose of a value that was built but never published, without any
    /// change notification.
    pub(crate) fn discard(
        self: &Arc<Self>,
        orphan: Arc<E>,
    ) {
        if self.is_empty_object(&orphan) {
            return;
        }
        let this = self.clone();
        let unfinished = Unfinished::arm(self.clone());
        self.pool.spawn_task(&format!("discard [{}]", self.path), &self.tracker, async move {
            let result = this.dispose_until_done(&orphan).await;
            unfinished.disarm();
            result
        });
    }

    /// Single synchronous disposal attempt, used by `close()`.
    ///
    /// A predicate answering `false` is only logged; a panic becomes
    /// [`Error::Disposal`].
    pub(crate) fn dispose_now(
        &self,
        value: &Arc<E>,
    ) -> Result<()> {
        if self.is_empty_object(value) {
            return Ok(());
        }
        match catch_unwind(AssertUnwindSafe(|| (self.predicate)(value))) {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(path = %self.path, "Resource was not disposed on close");
                Ok(())
            }
            Err(payload) => Err(Error::disposal(&self.path, panic_message(payload.as_ref()))),
        }
    }

    /// Fire the change callback, logging (never propagating) its panics
    pub(crate) fn notify_change(
        &self,
        new: Option<&Arc<E>>,
        old: Option<&Arc<E>>,
    ) {
        if let Some(callback) = &self.on_change {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(new, old))) {
                error!(
                    path = %self.path,
                    "resource change callback error: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    pub(crate) fn is_empty_object(
        &self,
        value: &Arc<E>,
    ) -> bool {
        self.empty.as_ref().is_some_and(|empty| Arc::ptr_eq(empty, value))
    }

    async fn run(
        self: Arc<Self>,
        new: Option<Arc<E>>,
        old: Arc<E>,
    ) -> Result<()> {
        self.dispose_until_done(&old).await?;
        debug!(path = %self.path, "Superseded resource disposed");
        self.notify_change(new.as_ref(), Some(&old));
        Ok(())
    }

    async fn dispose_until_done(
        &self,
        value: &Arc<E>,
    ) -> Result<()> {
        let mut attempts: u32 = 0;
        loop {
            if !self.wait.is_zero() {
                tokio::time::sleep(self.wait).await;
            }
            attempts += 1;

            let predicate = self.predicate.clone();
            let target = value.clone();
            match tokio::task::spawn_blocking(move || predicate(&target)).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    if let Some(max) = self.max_attempts {
                        if attempts >= max {
                            let e = Error::disposal(
                                &self.path,
                                format!("predicate still failing after {attempts} attempts"),
                            );
                            self.report_failure(&e);
                            return Err(e);
                        }
                    }
                    debug!(path = %self.path, attempts, "Resource not disposed yet, retrying");
                }
                Err(join_error) => {
                    let reason = if join_error.is_panic() {
                        panic_message(join_error.into_panic().as_ref())
                    } else {
                        join_error.to_string()
                    };
                    let e = Error::disposal(&self.path, reason);
                    self.report_failure(&e);
                    return Err(e);
                }
            }
        }
    }

    fn report_failure(
        &self,
        error: &Error,
    ) {
        for listener in &self.failure_listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(error))) {
                error!(
                    path = %self.path,
                    "Disposal failure listener panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

/// Reports a cleanup task dropped before reaching an outcome, polled or not
struct Unfinished<E: Send + Sync + 'static> {
    cleanup: Option<Arc<DeferredCleanup<E>>>,
}

impl<E: Send + Sync + 'static> Unfinished<E> {
    fn arm(cleanup: Arc<DeferredCleanup<E>>) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    fn disarm(mut self) {
        self.cleanup = None;
    }
}

impl<E: Send + Sync + 'static> Drop for Unfinished<E> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            warn!(path = %cleanup.path, "Cleanup task dropped before it finished");
            cleanup.report_failure(&Error::disposal(
                &cleanup.path,
                "cleanup task dropped before it finished, task pool shut down",
            ));
        }
    }
}

fn same_instance<E>(
    new: Option<&Arc<E>>,
    old: &Arc<E>,
) -> bool {
    new.is_some_and(|new| Arc::ptr_eq(new, old))
}
