use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;

use crate::source::Listener;
use crate::source::WatchEvent;
use crate::BoxError;
use crate::Disposable;

/// Poll `condition` every few milliseconds until it holds or `timeout` expires
pub(crate) fn wait_until(
    timeout: Duration,
    mut condition: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Listener that records every event it receives
pub(crate) fn recording_listener() -> (Listener, Arc<Mutex<Vec<WatchEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let listener: Listener = Arc::new(move |event| sink.lock().push(event));
    (listener, events)
}

/// Resource value that remembers whether it was disposed
#[derive(Debug)]
pub(crate) struct Tracked {
    pub(crate) value: String,
    pub(crate) disposed: AtomicBool,
    pub(crate) dispose_calls: AtomicUsize,
}

impl Tracked {
    pub(crate) fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            disposed: AtomicBool::new(false),
            dispose_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Disposable for Tracked {
    fn dispose(&self) -> Result<(), BoxError> {
        self.dispose_calls.fetch_add(1, Ordering::SeqCst);
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Build a [`Tracked`] value from raw node bytes
pub(crate) fn tracked_from_bytes(data: &[u8]) -> Result<Tracked, BoxError> {
    Ok(Tracked::new(std::str::from_utf8(data)?))
}

/// Records `(new, old)` pairs handed to a change callback
pub(crate) type ChangeLog = Arc<Mutex<Vec<(Option<String>, Option<String>)>>>;

pub(crate) fn change_log() -> ChangeLog {
    Arc::new(Mutex::new(Vec::new()))
}
