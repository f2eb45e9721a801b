use std::sync::Arc;
use std::time::Duration;

use d_registry::ClientPusher;
use d_registry::FuzzyWatchClientConfig;
use d_registry::FuzzyWatchEventWatcher;
use d_registry::FuzzyWatchServerConfig;
use once_cell::sync::OnceCell;

use crate::common::keys;
use crate::common::pattern;
use crate::common::wait_until;
use crate::common::DroppingPusher;
use crate::common::RecordingWatcher;
use crate::common::TestCluster;
use crate::enable_logger;

#[tokio::test]
async fn test_removed_watcher_cancels_pattern_on_server() {
    enable_logger();
    let cluster = TestCluster::start(FuzzyWatchServerConfig::default());
    cluster.register("svc-a");
    let client = cluster.connect("c1");
    let watcher = RecordingWatcher::new();
    let handle: Arc<dyn FuzzyWatchEventWatcher> = watcher.clone();

    client
        .watch_with_service_keys(pattern("svc*"), handle.clone())
        .await
        .unwrap()
        .wait_timeout(Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(cluster.server.index().watched_clients_of(&pattern("svc*")).len(), 1);

    assert!(client.remove_watcher(&pattern("svc*"), &handle));
    wait_until(|| client.context_count() == 0).await;
    wait_until(|| cluster.server.index().watched_clients_of(&pattern("svc*")).is_empty()).await;

    // nothing is delivered once detached
    cluster.register("svc-b");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(watcher.live_keys(), keys(&["svc-a"]));

    cluster.stop().await;
}

#[tokio::test]
async fn test_released_client_patterns_are_trimmed() {
    enable_logger();
    let config = FuzzyWatchServerConfig {
        trim_interval_ms: 50,
        ..Default::default()
    };
    let cluster = TestCluster::start(config);
    let client = cluster.connect("c1");
    client
        .watch_with_service_keys(pattern("svc*"), RecordingWatcher::new())
        .await
        .unwrap()
        .wait_timeout(Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(cluster.server.index().pattern_count(), 1);

    client.shutdown().await;
    cluster.pusher.disconnect("c1");
    cluster.server.on_client_release("c1");

    wait_until(|| cluster.server.index().pattern_count() == 0).await;

    cluster.stop().await;
}

#[tokio::test]
async fn test_lost_change_push_is_repaired_by_full_sync() {
    enable_logger();
    let dropping = OnceCell::new();
    let cluster = TestCluster::start_with(FuzzyWatchServerConfig::default(), |pusher| {
        let pusher = Arc::new(DroppingPusher::new(pusher, 1));
        let _ = dropping.set(pusher.clone());
        pusher as Arc<dyn ClientPusher>
    });
    cluster.register("svc-a");
    let config = FuzzyWatchClientConfig {
        resync_interval_ms: 50,
        retry_delay_ms: 50,
        full_sync_interval_ms: 200,
        ..Default::default()
    };
    let client = cluster.connect_with_config("c1", config);
    let watcher = RecordingWatcher::new();
    client
        .watch_with_service_keys(pattern("svc*"), watcher.clone())
        .await
        .unwrap()
        .wait_timeout(Duration::from_secs(2))
        .await
        .unwrap();

    // the only push announcing svc-b never reaches the client
    cluster.register("svc-b");
    wait_until(|| dropping.get().map(|p| p.drops_left()) == Some(0)).await;

    wait_until(|| watcher.live_keys() == keys(&["svc-a", "svc-b"])).await;
    let context = client.get_fuzzy_watch_context(&pattern("svc*")).unwrap();
    wait_until(|| context.is_consistent_with_server()).await;
    assert_eq!(context.received_service_keys(), keys(&["svc-a", "svc-b"]));
    assert_eq!(watcher.event_count(), 2);

    cluster.stop().await;
}
