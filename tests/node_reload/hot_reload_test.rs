use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use watched_resource::registry::memory_store;
use watched_resource::BoxError;
use watched_resource::ExistenceState;
use watched_resource::NodeResource;
use watched_resource::ResourceConfig;

use crate::commons::eventually;
use crate::commons::Pool;
use crate::commons::WAIT;

fn config_from_toml(contents: &str) -> ResourceConfig {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    ResourceConfig::default()
        .with_override_config(file.path().to_str().unwrap())
        .unwrap()
        .validate()
        .unwrap()
}

/// A database pool follows its endpoint node through updates, a bad write,
/// removal and re-creation.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_follows_endpoint_node() {
    let store = memory_store("hot-reload:2181", Some("it"));
    store.set_data("/db/primary", "10.0.0.1:5432".to_string()).unwrap();

    let config = config_from_toml(
        r#"
        [cleanup]
        wait_ms = 20
        join_on_close = true
        join_timeout_ms = 2000
        "#,
    );
    assert_eq!(config.cleanup.wait_ms, 20);

    let failures = Arc::new(Mutex::new(Vec::new()));
    let failure_sink = failures.clone();
    let resource = NodeResource::builder(store.node_watch("/db/primary").unwrap())
        .bytes_factory(Pool::parse)
        .build_failure_listener(move |_, e: &BoxError| failure_sink.lock().push(e.to_string()))
        .config(config)
        .with_dispose()
        .build()
        .unwrap();

    let first = resource.get().unwrap().unwrap();
    assert_eq!(first.endpoint, "10.0.0.1:5432");

    store.set_data("/db/primary", "10.0.0.2:5432".to_string()).unwrap();
    assert!(
        eventually(WAIT, || {
            resource.get().unwrap().is_some_and(|p| p.endpoint == "10.0.0.2:5432")
        })
        .await
    );
    assert!(eventually(WAIT, || first.is_released()).await);

    let second = resource.get().unwrap().unwrap();
    store.set_data("/db/primary", "not-an-endpoint".to_string()).unwrap();
    assert!(eventually(WAIT, || failures.lock().len() == 1).await);
    assert!(Arc::ptr_eq(&second, &resource.get().unwrap().unwrap()));

    store.remove("/db/primary", false).unwrap();
    assert!(eventually(WAIT, || resource.existence() == ExistenceState::NotExists).await);
    assert!(resource.get().unwrap().is_none());
    assert!(eventually(WAIT, || second.is_released()).await);

    store.set_data("/db/primary", "10.0.0.3:5432".to_string()).unwrap();
    assert!(
        eventually(WAIT, || {
            resource.get().unwrap().is_some_and(|p| p.endpoint == "10.0.0.3:5432")
        })
        .await
    );

    let third = resource.get().unwrap().unwrap();
    let joined = tokio::task::spawn_blocking({
        let resource = resource.clone();
        move || resource.close_and_join(Some(WAIT))
    })
    .await
    .unwrap()
    .unwrap();
    assert!(joined);
    assert_eq!(third.releases(), 1);
    assert!(resource.get().unwrap_err().is_closed());
}

/// Two resources over the same registry store see the same writes.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resources_share_registry_store() {
    let writer = memory_store("hot-reload:2181", Some("shared"));
    let reader = memory_store("hot-reload:2181", Some("shared"));
    writer.set_data("/feature/flags", "a:1".to_string()).unwrap();

    let resource = NodeResource::builder(reader.node_watch("/feature/flags").unwrap())
        .bytes_factory(Pool::parse)
        .build()
        .unwrap();

    assert_eq!(resource.get().unwrap().unwrap().endpoint, "a:1");

    writer.set_data("/feature/flags", "b:2".to_string()).unwrap();
    assert!(
        eventually(WAIT, || resource.get().unwrap().is_some_and(|p| p.endpoint == "b:2")).await
    );
    resource.close_quietly();
}
