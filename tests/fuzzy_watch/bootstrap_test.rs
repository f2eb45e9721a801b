use std::sync::Arc;
use std::time::Duration;

use d_registry::proto::ChangedType;
use d_registry::FuzzyWatchEventWatcher;
use d_registry::FuzzyWatchServerConfig;
use d_registry::SyncType;

use crate::common::keys;
use crate::common::pattern;
use crate::common::wait_until;
use crate::common::RecordingWatcher;
use crate::common::TestCluster;
use crate::enable_logger;

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_bootstrap_delivers_current_matches() {
    enable_logger();
    let cluster = TestCluster::start(FuzzyWatchServerConfig::default());
    cluster.register("svc-a");
    cluster.register("svc-b");
    cluster.register("other");

    let client = cluster.connect("c1");
    let watcher = RecordingWatcher::new();
    let future = client
        .watch_with_service_keys(pattern("svc*"), watcher.clone())
        .await
        .unwrap();

    let snapshot = future.wait_timeout(BOOTSTRAP_TIMEOUT).await.unwrap();

    assert_eq!(snapshot, keys(&["svc-a", "svc-b"]));
    assert_eq!(watcher.live_keys(), keys(&["svc-a", "svc-b"]));
    let context = client.get_fuzzy_watch_context(&pattern("svc*")).unwrap();
    assert!(context.is_consistent_with_server());

    cluster.stop().await;
}

#[tokio::test]
async fn test_incremental_changes_reach_every_client() {
    enable_logger();
    let cluster = TestCluster::start(FuzzyWatchServerConfig::default());
    cluster.register("svc-a");

    let first = cluster.connect("c1");
    let second = cluster.connect("c2");
    let w1 = RecordingWatcher::new();
    let w2 = RecordingWatcher::new();
    let f1 = first
        .watch_with_service_keys(pattern("svc*"), w1.clone())
        .await
        .unwrap();
    let f2 = second
        .watch_with_service_keys(pattern("svc-b"), w2.clone())
        .await
        .unwrap();
    f1.wait_timeout(BOOTSTRAP_TIMEOUT).await.unwrap();
    assert!(f2.wait_timeout(BOOTSTRAP_TIMEOUT).await.unwrap().is_empty());

    cluster.register("svc-b");
    cluster.register("other");
    wait_until(|| w1.live_keys() == keys(&["svc-a", "svc-b"]) && w2.event_count() == 1).await;

    cluster.deregister("svc-a");
    wait_until(|| w1.live_keys() == keys(&["svc-b"])).await;

    let events = w2.events();
    assert_eq!(events[0].service_name, "svc-b");
    assert_eq!(events[0].changed_type, ChangedType::Add);
    assert_eq!(events[0].sync_type, SyncType::ResourceChanged);
    // svc-a is outside the second client's pattern
    assert_eq!(w2.event_count(), 1);

    cluster.stop().await;
}

#[tokio::test]
async fn test_second_watcher_is_caught_up_locally() {
    enable_logger();
    let cluster = TestCluster::start(FuzzyWatchServerConfig::default());
    cluster.register("svc-a");
    cluster.register("svc-b");

    let client = cluster.connect("c1");
    let first = RecordingWatcher::new();
    client
        .watch_with_service_keys(pattern("svc*"), first.clone())
        .await
        .unwrap()
        .wait_timeout(BOOTSTRAP_TIMEOUT)
        .await
        .unwrap();

    let second = RecordingWatcher::new();
    let second_dyn: Arc<dyn FuzzyWatchEventWatcher> = second.clone();
    let future = client
        .watch_with_service_keys(pattern("svc*"), second_dyn)
        .await
        .unwrap();
    assert!(future.is_done());

    client.drain_notifications().await;
    assert_eq!(second.live_keys(), keys(&["svc-a", "svc-b"]));
    assert_eq!(first.event_count(), 2);
    assert_eq!(client.context_count(), 1);

    cluster.stop().await;
}

#[tokio::test]
async fn test_resync_after_reconnect_streams_only_the_difference() {
    enable_logger();
    let cluster = TestCluster::start(FuzzyWatchServerConfig::default());
    cluster.register("svc-a");
    cluster.register("svc-b");

    let client = cluster.connect("c1");
    let watcher = RecordingWatcher::new();
    client
        .watch_with_service_keys(pattern("svc*"), watcher.clone())
        .await
        .unwrap()
        .wait_timeout(BOOTSTRAP_TIMEOUT)
        .await
        .unwrap();

    // changes while the client is unreachable are lost on the wire
    cluster.pusher.disconnect("c1");
    cluster.deregister("svc-a");
    cluster.register("svc-c");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(watcher.live_keys(), keys(&["svc-a", "svc-b"]));

    cluster.pusher.connect("c1", &client);
    client.reset_consistence_status();

    wait_until(|| watcher.live_keys() == keys(&["svc-b", "svc-c"])).await;
    let context = client.get_fuzzy_watch_context(&pattern("svc*")).unwrap();
    wait_until(|| context.is_consistent_with_server()).await;
    assert_eq!(context.received_service_keys(), keys(&["svc-b", "svc-c"]));
    // svc-b was never redelivered
    assert_eq!(watcher.event_count(), 4);

    cluster.stop().await;
}
