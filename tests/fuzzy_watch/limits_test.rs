use std::time::Duration;

use d_registry::Error;
use d_registry::FuzzyWatchServerConfig;
use d_registry::LoopbackGateway;
use d_registry::WatchError;

use crate::common::keys;
use crate::common::pattern;
use crate::common::wait_until;
use crate::common::RecordingWatcher;
use crate::common::TestCluster;
use crate::enable_logger;

fn limited(
    max_pattern_count: usize,
    max_matched_service_count: usize,
) -> FuzzyWatchServerConfig {
    FuzzyWatchServerConfig {
        max_pattern_count,
        max_matched_service_count,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_server_without_fuzzy_watch_is_rejected_locally() {
    enable_logger();
    let cluster = TestCluster::start(FuzzyWatchServerConfig::default());
    let client = cluster.connect_with(LoopbackGateway::new("c1", cluster.server.clone()).without_fuzzy_watch());

    let result = client
        .register_fuzzy_watcher(pattern("svc*"), RecordingWatcher::new())
        .await;

    assert!(matches!(result, Err(Error::Watch(WatchError::CapabilityUnsupported))));
    assert_eq!(client.context_count(), 0);
    assert_eq!(cluster.server.index().pattern_count(), 0);

    cluster.stop().await;
}

#[tokio::test]
async fn test_pattern_over_limit_is_reported_once() {
    enable_logger();
    let cluster = TestCluster::start(limited(1, 10));
    let client = cluster.connect("c1");
    let accepted = RecordingWatcher::new();
    let rejected = RecordingWatcher::new();

    client
        .register_fuzzy_watcher(pattern("svc*"), accepted.clone())
        .await
        .unwrap();
    let context = client
        .register_fuzzy_watcher(pattern("other*"), rejected.clone())
        .await
        .unwrap();

    wait_until(|| rejected.pattern_over_limit_count() == 1).await;
    assert!(!context.is_consistent_with_server());
    assert_eq!(accepted.pattern_over_limit_count(), 0);
    assert_eq!(cluster.server.index().pattern_count(), 1);

    // later resync passes keep retrying but do not repeat the callback
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(rejected.pattern_over_limit_count(), 1);

    cluster.stop().await;
}

#[tokio::test]
async fn test_matched_service_cap_truncates_and_reports() {
    enable_logger();
    let cluster = TestCluster::start(limited(20, 2));
    for name in ["svc-a", "svc-b", "svc-c"] {
        cluster.register(name);
    }
    let client = cluster.connect("c1");
    let watcher = RecordingWatcher::new();

    let snapshot = client
        .watch_with_service_keys(pattern("svc*"), watcher.clone())
        .await
        .unwrap()
        .wait_timeout(Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(snapshot, keys(&["svc-a", "svc-b"]));
    wait_until(|| watcher.service_over_limit_count() == 1).await;

    // a freed slot is backfilled with the untracked match
    cluster.deregister("svc-a");
    wait_until(|| watcher.live_keys() == keys(&["svc-b", "svc-c"])).await;

    cluster.stop().await;
}
