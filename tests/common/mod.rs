use std::collections::BTreeSet;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use d_registry::proto::ChangedType;
use d_registry::proto::ServerPush;
use d_registry::ClientPusher;
use d_registry::FuzzyPattern;
use d_registry::FuzzyWatchChangeEvent;
use d_registry::FuzzyWatchClientConfig;
use d_registry::FuzzyWatchEventWatcher;
use d_registry::FuzzyWatchPushService;
use d_registry::FuzzyWatchServerConfig;
use d_registry::InMemoryCatalog;
use d_registry::LoopbackGateway;
use d_registry::LoopbackPusher;
use d_registry::NetworkError;
use d_registry::ServerPatternIndex;
use d_registry::Service;
use d_registry::ServiceKey;
use d_registry::TracedGateway;
use d_registry::WatcherError;
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub const NAMESPACE: &str = "public";
pub const GROUP: &str = "DEFAULT_GROUP";

pub type TestRegistry = d_registry::ClientWatchRegistry<TracedGateway<LoopbackGateway>>;

pub fn pattern(service_pattern: &str) -> FuzzyPattern {
    FuzzyPattern::generate(service_pattern, GROUP, NAMESPACE)
}

pub fn service(name: &str) -> Service {
    Service::new(NAMESPACE, GROUP, name)
}

pub fn keys(names: &[&str]) -> BTreeSet<ServiceKey> {
    names.iter().map(|name| service(name).key()).collect()
}

pub async fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[derive(Default)]
pub struct RecordingWatcher {
    events: Mutex<Vec<FuzzyWatchChangeEvent>>,
    pattern_over_limit: AtomicUsize,
    service_over_limit: AtomicUsize,
}

impl RecordingWatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<FuzzyWatchChangeEvent> {
        self.events.lock().clone()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn live_keys(&self) -> BTreeSet<ServiceKey> {
        let mut live = BTreeSet::new();
        for event in self.events.lock().iter() {
            match event.changed_type {
                ChangedType::Add => live.insert(event.service_key()),
                ChangedType::Delete => live.remove(&event.service_key()),
            };
        }
        live
    }

    pub fn pattern_over_limit_count(&self) -> usize {
        self.pattern_over_limit.load(Ordering::SeqCst)
    }

    pub fn service_over_limit_count(&self) -> usize {
        self.service_over_limit.load(Ordering::SeqCst)
    }
}

impl FuzzyWatchEventWatcher for RecordingWatcher {
    fn on_event(
        &self,
        event: &FuzzyWatchChangeEvent,
    ) -> Result<(), WatcherError> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn on_pattern_over_limit(&self) {
        self.pattern_over_limit.fetch_add(1, Ordering::SeqCst);
    }

    fn on_service_reach_up_limit(&self) {
        self.service_over_limit.fetch_add(1, Ordering::SeqCst);
    }
}

/// Loses the first `n` `ChangeNotify` pushes on the wire, forwards everything else.
pub struct DroppingPusher {
    inner: Arc<LoopbackPusher>,
    drops_left: AtomicUsize,
}

impl DroppingPusher {
    pub fn new(
        inner: Arc<LoopbackPusher>,
        n: usize,
    ) -> Self {
        Self {
            inner,
            drops_left: AtomicUsize::new(n),
        }
    }

    pub fn drops_left(&self) -> usize {
        self.drops_left.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientPusher for DroppingPusher {
    async fn push(
        &self,
        client_id: &str,
        push: ServerPush,
    ) -> d_registry::Result<()> {
        let dropped = matches!(push, ServerPush::ChangeNotify { .. })
            && self
                .drops_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if dropped {
            return Err(NetworkError::ClientNotConnected(client_id.to_string()).into());
        }
        self.inner.push(client_id, push).await
    }
}

pub fn client_config() -> FuzzyWatchClientConfig {
    FuzzyWatchClientConfig {
        resync_interval_ms: 100,
        retry_delay_ms: 50,
        ..Default::default()
    }
}

/// One server wired to any number of in-process clients.
pub struct TestCluster {
    pub catalog: Arc<InMemoryCatalog>,
    pub server: Arc<FuzzyWatchPushService>,
    pub pusher: Arc<LoopbackPusher>,
    clients: Mutex<Vec<Arc<TestRegistry>>>,
}

impl TestCluster {
    pub fn start(config: FuzzyWatchServerConfig) -> Self {
        Self::start_with(config, |pusher| pusher as Arc<dyn ClientPusher>)
    }

    /// Starts a cluster whose server pushes through `wrap(loopback)`.
    pub fn start_with<F>(
        config: FuzzyWatchServerConfig,
        wrap: F,
    ) -> Self
    where
        F: FnOnce(Arc<LoopbackPusher>) -> Arc<dyn ClientPusher>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let catalog = Arc::new(InMemoryCatalog::with_event_sink(tx));
        let index = Arc::new(ServerPatternIndex::new(catalog.clone(), config));
        let pusher = Arc::new(LoopbackPusher::new());
        let server = Arc::new(FuzzyWatchPushService::new(index, wrap(pusher.clone())));
        server.start(rx);

        Self {
            catalog,
            server,
            pusher,
            clients: Mutex::new(Vec::new()),
        }
    }

    pub fn connect(
        &self,
        client_id: &str,
    ) -> Arc<TestRegistry> {
        self.connect_with(LoopbackGateway::new(client_id, self.server.clone()))
    }

    pub fn connect_with_config(
        &self,
        client_id: &str,
        config: FuzzyWatchClientConfig,
    ) -> Arc<TestRegistry> {
        self.attach(LoopbackGateway::new(client_id, self.server.clone()), config)
    }

    pub fn connect_with(
        &self,
        gateway: LoopbackGateway,
    ) -> Arc<TestRegistry> {
        self.attach(gateway, client_config())
    }

    fn attach(
        &self,
        gateway: LoopbackGateway,
        config: FuzzyWatchClientConfig,
    ) -> Arc<TestRegistry> {
        let client_id = gateway.client_id().to_string();
        let registry = Arc::new(TestRegistry::new(TracedGateway::new(gateway), config));
        registry.start();
        self.pusher.connect(client_id, &registry);
        self.clients.lock().push(registry.clone());
        registry
    }

    pub fn register(
        &self,
        name: &str,
    ) -> bool {
        self.catalog.register(service(name))
    }

    pub fn deregister(
        &self,
        name: &str,
    ) -> bool {
        self.catalog.deregister(&service(name))
    }

    pub async fn stop(&self) {
        let clients: Vec<_> = self.clients.lock().drain(..).collect();
        for client in clients {
            client.shutdown().await;
        }
        self.server.stop().await;
    }
}
