use std::collections::BTreeMap;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use super::flatten_subtree;
use super::Subtree;
use super::TreeLifecycle;
use super::TreeResource;
use crate::source::memory::MemoryStore;
use crate::source::Listener;
use crate::source::ListenerId;
use crate::source::MockTreeWatchSource;
use crate::source::NodeSnapshot;
use crate::source::NodeStat;
use crate::source::WatchEvent;
use crate::test_utils::change_log;
use crate::test_utils::wait_until;
use crate::test_utils::ChangeLog;
use crate::test_utils::Tracked;
use crate::BoxError;
use crate::Error;
use crate::ResourceConfig;
use crate::TreeConfig;

const WAIT: Duration = Duration::from_secs(2);

fn snapshot(
    path: &str,
    data: &'static str,
) -> NodeSnapshot {
    NodeSnapshot {
        path: path.to_string(),
        data: Bytes::from_static(data.as_bytes()),
        stat: NodeStat::default(),
    }
}

/// `/a` with `/a/b = X` and `/a/b/c = Y`
fn sample_store() -> MemoryStore {
    let store = MemoryStore::new("tree-test");
    store.set_data("/a", "root".to_string()).unwrap();
    store.set_data("/a/b", "X".to_string()).unwrap();
    store.set_data("/a/b/c", "Y".to_string()).unwrap();
    store
}

/// Joins `key=value` pairs of the subtree, in key order
fn render(subtree: &Subtree) -> Result<Tracked, BoxError> {
    let mut parts = Vec::new();
    for (key, node) in subtree {
        parts.push(format!("{key}={}", std::str::from_utf8(&node.data)?));
    }
    Ok(Tracked::new(parts.join(",")))
}

fn recording(
    log: &ChangeLog
) -> impl Fn(Option<&Arc<Tracked>>, Option<&Arc<Tracked>>) + Send + Sync + 'static {
    let log = log.clone();
    move |new: Option<&Arc<Tracked>>, old: Option<&Arc<Tracked>>| {
        log.lock().push((
            new.map(|v| v.value.clone()),
            old.map(|v| v.value.clone()),
        ));
    }
}

/// Mock subtree `/a` that records its listener instead of starting a sync
fn silent_source(slot: Arc<Mutex<Option<Listener>>>) -> MockTreeWatchSource {
    let mut source = MockTreeWatchSource::new();
    source.expect_root().return_const("/a".to_string());
    source.expect_add_listener().times(1).returning(move |listener| {
        *slot.lock() = Some(listener);
        ListenerId(1)
    });
    source.expect_start().returning(|| Ok(()));
    source.expect_children().returning(|path: &str| match path {
        "/a" => Some(BTreeMap::from([("/a/b".to_string(), snapshot("/a/b", "X"))])),
        "/a/b" => Some(BTreeMap::from([("/a/b/c".to_string(), snapshot("/a/b/c", "Y"))])),
        "/a/b/c" => Some(BTreeMap::new()),
        _ => None,
    });
    source.expect_remove_listener().return_const(());
    source.expect_close().returning(|| Ok(()));
    source
}

#[test]
fn test_flatten_subtree_uses_relative_keys() {
    let store = sample_store();
    let watch = store.tree_watch("/a").unwrap();

    let subtree = flatten_subtree(&watch, "/a");

    let keys: Vec<&str> = subtree.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["/b", "/b/c"]);
    assert_eq!(subtree["/b"].data, Bytes::from_static(b"X"));
    assert_eq!(subtree["/b/c"].data, Bytes::from_static(b"Y"));
    assert_eq!(subtree["/b/c"].path, "/a/b/c");
}

#[test]
fn test_flatten_subtree_below_store_root_strips_only_the_slash() {
    let store = sample_store();
    let watch = store.tree_watch("/").unwrap();

    let subtree = flatten_subtree(&watch, "/");

    let keys: Vec<&str> = subtree.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["a", "a/b", "a/b/c"]);
    assert_eq!(subtree["a/b"].path, "/a/b");
}

#[test]
fn test_flatten_subtree_of_missing_root_is_empty() {
    let store = MemoryStore::new("tree-test");
    let watch = store.tree_watch("/missing").unwrap();

    assert!(flatten_subtree(&watch, "/missing").is_empty());
}

#[test]
fn test_get_builds_after_initial_sync() {
    let store = sample_store();
    let log = change_log();
    let resource = TreeResource::builder(store.tree_watch("/a").unwrap())
        .factory(render)
        .on_change(recording(&log))
        .build()
        .unwrap();
    assert_eq!(resource.lifecycle(), TreeLifecycle::Uninitialized);

    let first = resource.get().unwrap();
    let second = resource.get().unwrap();

    assert_eq!(first.value, "/b=X,/b/c=Y");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(resource.lifecycle(), TreeLifecycle::Ready);
    assert_eq!(*log.lock(), vec![(Some("/b=X,/b/c=Y".to_string()), None)]);
    assert_eq!(resource.root(), "/a");
}

#[test]
fn test_change_below_root_rebuilds_and_disposes_old_value() {
    let store = sample_store();
    let log = change_log();
    let resource = TreeResource::builder(store.tree_watch("/a").unwrap())
        .factory(render)
        .on_change(recording(&log))
        .with_dispose()
        .build()
        .unwrap();

    let before = resource.get().unwrap();
    store.set_data("/a/d", "Z".to_string()).unwrap();

    assert!(wait_until(WAIT, || resource.get().unwrap().value == "/b=X,/b/c=Y,/d=Z"));
    assert!(wait_until(WAIT, || before.is_disposed()));
    assert!(wait_until(WAIT, || log.lock().len() == 2));
    assert_eq!(
        log.lock()[1],
        (
            Some("/b=X,/b/c=Y,/d=Z".to_string()),
            Some("/b=X,/b/c=Y".to_string())
        )
    );
}

#[test]
fn test_reused_instance_notifies_on_the_notification_thread() {
    let store = sample_store();
    let log = change_log();
    let shared = Arc::new(Tracked::new("shared"));
    let handed_out = shared.clone();
    let build_threads = Arc::new(Mutex::new(Vec::new()));
    let callback_threads = Arc::new(Mutex::new(Vec::new()));
    let (builds_on, callbacks_on) = (build_threads.clone(), callback_threads.clone());
    let record = recording(&log);
    let resource = TreeResource::builder(store.tree_watch("/a").unwrap())
        .arc_factory(move |_: &Subtree| {
            builds_on.lock().push(thread::current().id());
            Ok(handed_out.clone())
        })
        .on_change(move |new: Option<&Arc<Tracked>>, old: Option<&Arc<Tracked>>| {
            callbacks_on.lock().push(thread::current().id());
            record(new, old);
        })
        .with_dispose()
        .build()
        .unwrap();

    resource.get().unwrap();
    store.set_data("/a/d", "Z".to_string()).unwrap();

    assert!(wait_until(WAIT, || log.lock().len() == 2));
    assert_eq!(
        log.lock()[1],
        (Some("shared".to_string()), Some("shared".to_string()))
    );
    let refresh_thread = build_threads.lock()[1];
    assert_ne!(refresh_thread, thread::current().id());
    assert_eq!(callback_threads.lock()[1], refresh_thread);
    assert_eq!(resource.pending_tasks(), 0);
    assert!(!shared.is_disposed());
}

#[test]
fn test_change_callback_can_inspect_and_close_its_resource() {
    let store = sample_store();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let slot: Arc<Mutex<Option<TreeResource<Tracked>>>> = Arc::new(Mutex::new(None));
    let target = slot.clone();
    let resource = TreeResource::builder(store.tree_watch("/a").unwrap())
        .factory(render)
        .on_change(move |_: Option<&Arc<Tracked>>, old: Option<&Arc<Tracked>>| {
            if old.is_none() {
                return;
            }
            if let Some(resource) = target.lock().take() {
                sink.lock().push(resource.lifecycle());
                resource.close_quietly();
            }
        })
        .build()
        .unwrap();
    *slot.lock() = Some(resource.clone());

    resource.get().unwrap();
    store.set_data("/a/d", "Z".to_string()).unwrap();

    assert!(wait_until(WAIT, || resource.is_closed()));
    assert_eq!(*seen.lock(), vec![TreeLifecycle::Ready]);
    assert_eq!(resource.lifecycle(), TreeLifecycle::Closed);
    assert!(wait_until(WAIT, || store.watch_count() == 0));
}

#[test]
fn test_failed_rebuild_keeps_previous_value() {
    let store = sample_store();
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = failures.clone();
    let resource = TreeResource::builder(store.tree_watch("/a").unwrap())
        .factory(|subtree: &Subtree| {
            if subtree.contains_key("/poison") {
                return Err("poisoned subtree".into());
            }
            render(subtree)
        })
        .build_failure_listener(move |subtree: &Subtree, e: &BoxError| {
            sink.lock().push((subtree.len(), e.to_string()));
        })
        .build()
        .unwrap();

    let before = resource.get().unwrap();
    store.set_data("/a/poison", "1".to_string()).unwrap();

    assert!(wait_until(WAIT, || failures.lock().len() == 1));
    assert_eq!(failures.lock()[0], (3, "poisoned subtree".to_string()));
    assert!(Arc::ptr_eq(&before, &resource.get().unwrap()));
}

#[test]
fn test_connection_events_keep_last_value() {
    let store = sample_store();
    let builds = Arc::new(AtomicU32::new(0));
    let counter = builds.clone();
    let resource = TreeResource::builder(store.tree_watch("/a").unwrap())
        .factory(move |subtree: &Subtree| {
            counter.fetch_add(1, Ordering::SeqCst);
            render(subtree)
        })
        .build()
        .unwrap();

    let before = resource.get().unwrap();
    store.suspend_connection();
    store.lose_connection();
    thread::sleep(Duration::from_millis(50));

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&before, &resource.get().unwrap()));
}

#[test]
fn test_children_factory_sees_every_node() {
    let store = sample_store();
    let resource = TreeResource::builder(store.tree_watch("/a").unwrap())
        .children_factory(|children: &[NodeSnapshot]| {
            Ok(children.iter().map(|node| node.path.clone()).collect::<Vec<_>>())
        })
        .build()
        .unwrap();

    assert_eq!(*resource.get().unwrap(), vec!["/a/b".to_string(), "/a/b/c".to_string()]);
}

#[test]
fn test_concurrent_first_get_builds_once() {
    let store = sample_store();
    let builds = Arc::new(AtomicU32::new(0));
    let counter = builds.clone();
    let resource = TreeResource::builder(store.tree_watch("/a").unwrap())
        .factory(move |subtree: &Subtree| {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            render(subtree)
        })
        .build()
        .unwrap();

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let resource = resource.clone();
            thread::spawn(move || resource.get().unwrap())
        })
        .collect();
    let values: Vec<Arc<Tracked>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
}

#[test]
fn test_init_timeout_then_retry_after_sync() {
    let slot = Arc::new(Mutex::new(None));
    let config = ResourceConfig {
        tree: TreeConfig {
            init_timeout_ms: 100,
        },
        ..Default::default()
    };
    let resource = TreeResource::builder(silent_source(slot.clone()))
        .factory(render)
        .config(config)
        .build()
        .unwrap();

    let err = resource.get().unwrap_err();
    assert!(matches!(
        err,
        Error::InitTimeout { ref path, timeout } if path == "/a" && timeout == Duration::from_millis(100)
    ));
    assert_eq!(resource.lifecycle(), TreeLifecycle::Uninitialized);

    let listener = slot.lock().clone().unwrap();
    listener(WatchEvent::InitialSyncDone);

    // The subscription survived the timeout, so no second add_listener
    assert_eq!(resource.get().unwrap().value, "/b=X,/b/c=Y");
    assert_eq!(resource.lifecycle(), TreeLifecycle::Ready);
}

#[test]
fn test_events_before_initial_sync_are_ignored() {
    let slot = Arc::new(Mutex::new(None));
    let builds = Arc::new(AtomicU32::new(0));
    let counter = builds.clone();
    let config = ResourceConfig {
        tree: TreeConfig { init_timeout_ms: 50 },
        ..Default::default()
    };
    let resource = TreeResource::builder(silent_source(slot.clone()))
        .factory(move |subtree: &Subtree| {
            counter.fetch_add(1, Ordering::SeqCst);
            render(subtree)
        })
        .config(config)
        .build()
        .unwrap();

    assert!(resource.get().is_err());
    let listener = slot.lock().clone().unwrap();
    listener(WatchEvent::Changed);
    listener(WatchEvent::ConnectionLost);

    assert_eq!(builds.load(Ordering::SeqCst), 0);
    assert!(matches!(resource.get(), Err(Error::InitTimeout { .. })));
}

#[test]
fn test_close_wakes_callers_waiting_for_sync() {
    let slot = Arc::new(Mutex::new(None));
    let resource = TreeResource::builder(silent_source(slot.clone()))
        .factory(render)
        .build()
        .unwrap();

    let waiter = {
        let resource = resource.clone();
        thread::spawn(move || resource.get())
    };
    assert!(wait_until(WAIT, || resource.lifecycle() == TreeLifecycle::Initializing));

    resource.close().unwrap();

    let result = waiter.join().unwrap();
    assert!(result.unwrap_err().is_closed());
    assert_eq!(resource.lifecycle(), TreeLifecycle::Closed);
}

#[test]
fn test_get_after_close_fails() {
    let store = sample_store();
    let resource = TreeResource::builder(store.tree_watch("/a").unwrap())
        .factory(render)
        .with_dispose()
        .build()
        .unwrap();

    let value = resource.get().unwrap();
    resource.close().unwrap();
    resource.close_quietly();

    assert!(value.is_disposed());
    assert_eq!(value.dispose_calls.load(Ordering::SeqCst), 1);
    assert!(resource.get().unwrap_err().is_closed());
    assert!(resource.is_closed());
    assert_eq!(store.watch_count(), 0);
}
