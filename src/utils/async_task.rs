use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use lazy_static::lazy_static;
use parking_lot::Condvar;
use parking_lot::Mutex;
use tokio::runtime::Builder;
use tokio::runtime::Handle;
use tokio::runtime::Runtime;
use tracing::debug;
use tracing::error;

use crate::Error;
use crate::Result;

lazy_static! {
    /// Runtime backing every resource that was not given its own handle.
    /// Created on first use and never torn down.
    static ref SHARED_RUNTIME: std::result::Result<Runtime, String> = Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("watched-resource-worker")
        .enable_time()
        .build()
        .map_err(|e| e.to_string());
}

/// Worker pool that runs refresh builds and deferred cleanup tasks
#[derive(Clone, Debug)]
pub struct TaskPool {
    handle: Handle,
}

impl TaskPool {
    /// Pool backed by the lazily created process-wide runtime
    pub fn shared() -> Result<Self> {
        match &*SHARED_RUNTIME {
            Ok(runtime) => Ok(Self {
                handle: runtime.handle().clone(),
            }),
            Err(e) => Err(Error::Io(io::Error::new(io::ErrorKind::Other, e.clone()))),
        }
    }

    /// Pool backed by an application-owned runtime.
    ///
    /// Tasks spawned after that runtime shut down are dropped unfinished.
    pub fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a detached task tracked by `tracker`; its error is logged, never propagated
    pub(crate) fn spawn_task<Fut>(
        &self,
        name: &str,
        tracker: &Arc<TaskTracker>,
        task: Fut,
    ) where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.to_string();
        let guard = tracker.begin();
        self.handle.spawn(async move {
            let _guard = guard;
            if let Err(e) = task.await {
                error!("spawned task: {name} stopped or encountered an error: {:?}", e);
            }
        });
    }
}

/// Counts in-flight tasks of one resource so `close` can optionally join them
#[derive(Debug, Default)]
pub(crate) struct TaskTracker {
    inflight: Mutex<usize>,
    idle: Condvar,
}

impl TaskTracker {
    pub(crate) fn begin(self: &Arc<Self>) -> TaskGuard {
        *self.inflight.lock() += 1;
        TaskGuard {
            tracker: self.clone(),
        }
    }

    pub(crate) fn inflight(&self) -> usize {
        *self.inflight.lock()
    }

    /// Block until no task is in flight. Returns `false` on timeout.
    pub(crate) fn wait_idle(
        &self,
        timeout: Option<Duration>,
    ) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inflight = self.inflight.lock();
        while *inflight > 0 {
            match deadline {
                Some(deadline) => {
                    if self.idle.wait_until(&mut inflight, deadline).timed_out() {
                        return *inflight == 0;
                    }
                }
                None => self.idle.wait(&mut inflight),
            }
        }
        true
    }
}

/// Marks one tracked task; dropping it (also on unwind) ends the task
pub(crate) struct TaskGuard {
    tracker: Arc<TaskTracker>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let mut inflight = self.tracker.inflight.lock();
        *inflight = inflight.saturating_sub(1);
        if *inflight == 0 {
            debug!("All tracked tasks finished");
            self.tracker.idle.notify_all();
        }
    }
}
