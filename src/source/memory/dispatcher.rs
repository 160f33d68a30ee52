//! Per-watch notification thread
//!
//! ```text
//! store mutation ──try_send──► event queue ──► dispatcher thread ──► listeners (in order)
//! ```
//!
//! Every watch owns one dispatcher, so notifications for one watched path
//! are delivered serially and never on the writer's thread.

use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use crossbeam_channel::bounded;
use crossbeam_channel::unbounded;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use crate::errors::panic_message;
use crate::source::Listener;
use crate::source::ListenerId;
use crate::source::WatchEvent;
use crate::Result;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

type Listeners = Arc<RwLock<Vec<(ListenerId, Listener)>>>;

pub(crate) struct Dispatcher {
    name: String,
    listeners: Listeners,
    event_tx: Sender<WatchEvent>,
    event_rx: Receiver<WatchEvent>,
    stop_tx: Mutex<Option<Sender<()>>>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub(crate) fn new(name: String) -> Self {
        let (event_tx, event_rx) = unbounded();
        Self {
            name,
            listeners: Arc::new(RwLock::new(Vec::new())),
            event_tx,
            event_rx,
            stop_tx: Mutex::new(None),
            thread_handle: Mutex::new(None),
        }
    }

    /// Sender used by the store to enqueue events for this watch
    pub(crate) fn sender(&self) -> Sender<WatchEvent> {
        self.event_tx.clone()
    }

    pub(crate) fn add_listener(
        &self,
        listener: Listener,
    ) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        trace!(watch = %self.name, %id, "Listener added");
        id
    }

    pub(crate) fn remove_listener(
        &self,
        id: ListenerId,
    ) {
        self.listeners.write().retain(|(lid, _)| *lid != id);
        trace!(watch = %self.name, %id, "Listener removed");
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Spawn the dispatcher thread. Calling it on a running dispatcher is a no-op.
    pub(crate) fn start(&self) -> Result<()> {
        let mut thread_handle = self.thread_handle.lock();
        if thread_handle.is_some() {
            return Ok(());
        }

        // Never sent on: dropping the sender is the stop signal
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let events = self.event_rx.clone();
        let listeners = self.listeners.clone();
        let name = self.name.clone();

        // Installed first, so a concurrent stop() always finds the signal
        *self.stop_tx.lock() = Some(stop_tx);
        match thread::Builder::new()
            .name(format!("watch-[{}]", self.name))
            .spawn(move || Self::run(&name, &events, &stop_rx, &listeners))
        {
            Ok(handle) => {
                *thread_handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.stop_tx.lock().take();
                Err(e.into())
            }
        }
    }

    /// Stop the dispatcher thread and wait for it to exit.
    ///
    /// When called from a listener (i.e. on the dispatcher thread itself) the
    /// thread is signalled but not joined.
    pub(crate) fn stop(&self) {
        drop(self.stop_tx.lock().take());

        if let Some(handle) = self.thread_handle.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(watch = %self.name, "Dispatcher thread ended with a panic");
            }
        }
    }

    /// Deliver queued events until the stop sender goes away
    fn run(
        name: &str,
        events: &Receiver<WatchEvent>,
        stop: &Receiver<()>,
        listeners: &Listeners,
    ) {
        trace!(watch = %name, "Delivering events");
        let mut delivered = 0u64;
        loop {
            crossbeam_channel::select! {
                recv(stop) -> _ => break,
                recv(events) -> event => {
                    let Ok(event) = event else {
                        warn!(watch = %name, "Event queue disconnected, stopping delivery");
                        break;
                    };
                    Self::dispatch(name, listeners, event);
                    delivered += 1;
                }
            }
        }
        debug!(watch = %name, delivered, "Stopped delivering events");
    }

    fn dispatch(
        name: &str,
        listeners: &Listeners,
        event: WatchEvent,
    ) {
        // Listeners may add or remove listeners, so deliver from a copy.
        let current: Vec<(ListenerId, Listener)> = listeners.read().clone();
        trace!(watch = %name, ?event, listeners = current.len(), "Dispatching event");

        for (id, listener) in current {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                error!(
                    watch = %name,
                    %id,
                    ?event,
                    "Listener panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
