use std::sync::Arc;

use parking_lot::Mutex;
use watched_resource::registry::memory_store;
use watched_resource::source::NodeSnapshot;
use watched_resource::source::TreeWatchSource;
use watched_resource::BoxError;
use watched_resource::Error;
use watched_resource::ResourceConfig;
use watched_resource::SourceError;
use watched_resource::TreeConfig;
use watched_resource::TreeLifecycle;
use watched_resource::TreeResource;

use crate::commons::eventually;
use crate::commons::WAIT;

fn endpoints(children: &[NodeSnapshot]) -> Result<Vec<String>, BoxError> {
    children
        .iter()
        .filter(|node| !node.data.is_empty())
        .map(|node| Ok(std::str::from_utf8(&node.data)?.to_string()))
        .collect()
}

/// Service instances registered under `/services/api` drive the endpoint list.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_endpoint_list_tracks_registrations() {
    let store = memory_store("service-registry:2181", None);
    store.set_data("/services/api/i-1", "10.0.1.1:80".to_string()).unwrap();
    store.set_data("/services/api/i-2", "10.0.1.2:80".to_string()).unwrap();
    store.set_data("/services/web/i-9", "10.0.9.9:80".to_string()).unwrap();

    let swaps = Arc::new(Mutex::new(0usize));
    let counter = swaps.clone();
    let resource = TreeResource::builder(store.tree_watch("/services/api").unwrap())
        .children_factory(endpoints)
        .on_change(move |_, _| *counter.lock() += 1)
        .build()
        .unwrap();

    let initial = resource.get().unwrap();
    assert_eq!(*initial, vec!["10.0.1.1:80", "10.0.1.2:80"]);
    assert_eq!(resource.lifecycle(), TreeLifecycle::Ready);

    store.set_data("/services/api/i-3", "10.0.1.3:80".to_string()).unwrap();
    assert!(eventually(WAIT, || resource.get().unwrap().len() == 3).await);

    store.remove("/services/api/i-1", false).unwrap();
    assert!(
        eventually(WAIT, || {
            *resource.get().unwrap() == vec!["10.0.1.2:80".to_string(), "10.0.1.3:80".to_string()]
        })
        .await
    );

    // Writes outside the root do not trigger rebuilds
    let before = *swaps.lock();
    store.set_data("/services/web/i-8", "10.0.9.8:80".to_string()).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(*swaps.lock(), before);

    resource.close().unwrap();
    assert!(matches!(resource.get(), Err(Error::Closed { .. })));
}

/// A watch that was closed before the first `get()` cannot be started.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_closed_watch_cannot_initialize() {
    let store = memory_store("service-registry:2181", Some("closed"));
    let watch = store.tree_watch("/services").unwrap();
    TreeWatchSource::close(&watch).unwrap();

    let config = ResourceConfig {
        tree: TreeConfig {
            init_timeout_ms: 500,
        },
        ..Default::default()
    };
    let resource = TreeResource::builder(watch)
        .children_factory(endpoints)
        .config(config)
        .build()
        .unwrap();

    let result = tokio::task::spawn_blocking({
        let resource = resource.clone();
        move || resource.get()
    })
    .await
    .unwrap();
    assert!(matches!(result, Err(Error::Source(SourceError::Closed { .. }))));
    assert_eq!(resource.lifecycle(), TreeLifecycle::Uninitialized);
}
