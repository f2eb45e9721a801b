//! Client side fuzzy watch manager.
//!
//! # Architecture
//!
//! ```text
//! transport receive path:
//!   on_server_push() -> send(notify queue)            [non-blocking]
//!                              ↓
//! notify worker task:
//!   recv() -> route to ClientWatchContext -> WatcherWrapper -> user watcher
//!
//! resync loop task (fixed period, or rung by the bell):
//!   execute_naming_fuzzy_watch() -> register inconsistent contexts
//!                                -> resync consistent contexts (no network)
//!                                -> re-register consistent contexts once per full sync interval
//!                                -> drop contexts empty for N sweeps
//! ```
//!
//! Watcher callbacks only ever run on the notify worker, so a slow watcher
//! delays later notifications but never the receipt of server messages.

use std::fmt;
use std::sync::Arc;
use std::sync::Weak;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::bootstrap::BootstrapFuture;
use super::context::AttachOutcome;
use super::context::ClientWatchContext;
use super::watcher::FuzzyWatchEventWatcher;
use super::watcher::WatcherWrapper;
use crate::proto::AbilityKey;
use crate::proto::FuzzyWatchErrorCode;
use crate::proto::ServerPush;
use crate::proto::WatchRegister;
use crate::proto::WatchRegisterAck;
use crate::FuzzyPattern;
use crate::FuzzyWatchClientConfig;
use crate::NetworkError;
use crate::RemoteWatchGateway;
use crate::Result;
use crate::ServerPushSink;
use crate::WatchError;

const FUZZY_WATCH_REQUEST: &str = "fuzzy_watch";

enum NotifyTask {
    Push(ServerPush),
    /// Replay received keys to a watcher attached to a consistent context
    CatchUp {
        pattern: String,
        wrapper: Arc<WatcherWrapper>,
    },
    Resync(String),
    OverLimit {
        pattern: String,
        code: FuzzyWatchErrorCode,
    },
    Flush(oneshot::Sender<()>),
}

pub struct ClientWatchRegistry<G>
where
    G: RemoteWatchGateway,
{
    gateway: G,
    config: FuzzyWatchClientConfig,

    /// Canonical pattern string -> context
    contexts: DashMap<String, Arc<ClientWatchContext>>,

    notify_tx: mpsc::UnboundedSender<NotifyTask>,
    /// Taken by `start`
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<NotifyTask>>>,

    /// Wakes the resync loop ahead of its period
    resync_bell: Arc<Notify>,

    /// Start of the last full sync pass, `None` forces one on the next pass
    last_full_sync: Mutex<Option<Instant>>,

    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<G> fmt::Debug for ClientWatchRegistry<G>
where
    G: RemoteWatchGateway,
{
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ClientWatchRegistry")
            .field("contexts", &self.contexts.len())
            .field("config", &self.config)
            .finish()
    }
}

impl<G> ClientWatchRegistry<G>
where
    G: RemoteWatchGateway,
{
    pub fn new(
        gateway: G,
        config: FuzzyWatchClientConfig,
    ) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Self {
            gateway,
            config,
            contexts: DashMap::new(),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
            resync_bell: Arc::new(Notify::new()),
            last_full_sync: Mutex::new(Some(Instant::now())),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the notify worker and the resync loop. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Some(notify_rx) = self.notify_rx.lock().take() else {
            warn!("fuzzy watch registry already started");
            return;
        };

        let worker = tokio::spawn(Self::run_notify_worker(
            Arc::downgrade(self),
            notify_rx,
            self.shutdown.clone(),
        ));
        let resync = tokio::spawn(Self::run_resync_loop(
            Arc::downgrade(self),
            self.resync_bell.clone(),
            self.shutdown.clone(),
            self.config.resync_interval(),
        ));
        self.handles.lock().extend([worker, resync]);
        info!("fuzzy watch registry started");
    }

    /// Stops the background tasks and waits for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("fuzzy watch background task failed: {:?}", e);
            }
        }
        info!("fuzzy watch registry stopped");
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Attaches `watcher` to `pattern`, registering the pattern with the server
    /// if this is the first watcher for it.
    ///
    /// # Errors
    /// - [`WatchError::CapabilityUnsupported`] if the server did not advertise
    ///   fuzzy watch (no local state is created), or answered `Unsupported`
    /// - transport errors of the first registration round trip; the new
    ///   context is rolled back
    pub async fn register_fuzzy_watcher(
        &self,
        pattern: FuzzyPattern,
        watcher: Arc<dyn FuzzyWatchEventWatcher>,
    ) -> Result<Arc<ClientWatchContext>> {
        if !self.gateway.is_ability_supported(AbilityKey::ServerFuzzyWatch) {
            warn!(pattern = %pattern, "server does not support fuzzy watch");
            return Err(WatchError::CapabilityUnsupported.into());
        }

        let key = pattern.to_string();
        let (context, created) = loop {
            let (context, created) = match self.contexts.entry(key.clone()) {
                Entry::Occupied(entry) => (entry.get().clone(), false),
                Entry::Vacant(entry) => {
                    let context = Arc::new(ClientWatchContext::new(
                        pattern.clone(),
                        self.config.watcher_retry_limit,
                    ));
                    entry.insert(context.clone());
                    (context, true)
                }
            };

            match context.add_watcher(watcher.clone()) {
                AttachOutcome::Added(wrapper) => {
                    if context.is_consistent_with_server() {
                        self.enqueue(NotifyTask::CatchUp {
                            pattern: key.clone(),
                            wrapper,
                        });
                    }
                    break (context, created);
                }
                AttachOutcome::Duplicate => {
                    debug!(pattern = %key, "watcher already registered on pattern");
                    break (context, created);
                }
                AttachOutcome::Removed => {
                    // lost a race with the sweep, the next round finds or creates a fresh context
                    trace!(pattern = %key, "fuzzy watch context removed concurrently, retrying");
                }
            }
        };

        if !created {
            return Ok(context);
        }

        info!(pattern = %key, "registering new fuzzy watch pattern");
        let ack = match self.send_request(context.build_register_request()).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!(pattern = %key, "initial fuzzy watch registration failed: {}", e);
                self.rollback(&key, &context, &watcher);
                return Err(e);
            }
        };

        if ack.error == Some(FuzzyWatchErrorCode::Unsupported) {
            self.rollback(&key, &context, &watcher);
            return Err(WatchError::CapabilityUnsupported.into());
        }
        self.handle_ack(&key, &context, &ack);
        Ok(context)
    }

    /// Registers and returns the future of the pattern's first consistent snapshot.
    pub async fn watch_with_service_keys(
        &self,
        pattern: FuzzyPattern,
        watcher: Arc<dyn FuzzyWatchEventWatcher>,
    ) -> Result<BootstrapFuture> {
        let context = self.register_fuzzy_watcher(pattern, watcher).await?;
        Ok(context.create_new_future())
    }

    /// Detaches `watcher` from `pattern`. The context stays until the resync loop removes it.
    pub fn remove_watcher(
        &self,
        pattern: &FuzzyPattern,
        watcher: &Arc<dyn FuzzyWatchEventWatcher>,
    ) -> bool {
        match self.get_fuzzy_watch_context(pattern) {
            Some(context) => context.remove_watcher(watcher),
            None => false,
        }
    }

    pub fn get_fuzzy_watch_context(
        &self,
        pattern: &FuzzyPattern,
    ) -> Option<Arc<ClientWatchContext>> {
        self.contexts.get(&pattern.to_string()).map(|e| e.value().clone())
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Marks every context inconsistent and wakes the resync loop. Called after reconnect.
    pub fn reset_consistence_status(&self) {
        for entry in self.contexts.iter() {
            entry.value().set_consistent_with_server(false);
        }
        info!(contexts = self.contexts.len(), "fuzzy watch consistence reset");
        self.notify_fuzzy_watch_sync();
    }

    /// Wakes the resync loop.
    pub fn notify_fuzzy_watch_sync(&self) {
        self.resync_bell.notify_one();
    }

    /// Waits until every notification queued so far has been delivered.
    pub async fn drain_notifications(&self) {
        let started = self.notify_rx.lock().is_none();
        if !started {
            debug!("notify worker not started, nothing to drain");
            return;
        }
        let (tx, rx) = oneshot::channel();
        self.enqueue(NotifyTask::Flush(tx));
        let _ = rx.await;
    }

    /// One pass of the background resync loop.
    pub async fn execute_naming_fuzzy_watch(&self) {
        let contexts: Vec<(String, Arc<ClientWatchContext>)> = self
            .contexts
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let full_sync = self.take_full_sync_due();
        let mut transport_failed = false;
        let mut full_sync_failed = false;
        for (key, context) in contexts {
            let empty_sweeps = context.observe_sweep();
            if empty_sweeps > 0 {
                self.sweep_empty_context(&key, &context, empty_sweeps).await;
                continue;
            }

            let consistent = context.is_consistent_with_server();
            if consistent {
                self.enqueue(NotifyTask::Resync(key.clone()));
                if !full_sync {
                    continue;
                }
                debug!(pattern = %key, "full sync of consistent fuzzy watch context");
            } else {
                debug!(pattern = %key, "re-registering inconsistent fuzzy watch context");
            }

            match self.send_request(context.build_register_request()).await {
                Ok(ack) => self.handle_ack(&key, &context, &ack),
                Err(e) => {
                    warn!(pattern = %key, "fuzzy watch resync failed: {}", e);
                    transport_failed |= e.is_transient();
                    full_sync_failed |= consistent;
                }
            }
        }

        if full_sync_failed {
            *self.last_full_sync.lock() = None;
        }
        if transport_failed {
            self.schedule_retry();
        }
    }

    /// Whether this pass re-registers consistent contexts too. Restarts the interval when it does.
    fn take_full_sync_due(&self) -> bool {
        let mut last = self.last_full_sync.lock();
        let due = match *last {
            Some(at) => at.elapsed() >= self.config.full_sync_interval(),
            None => true,
        };
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    async fn sweep_empty_context(
        &self,
        key: &str,
        context: &Arc<ClientWatchContext>,
        empty_sweeps: u32,
    ) {
        if empty_sweeps < self.config.empty_sweeps_before_removal {
            debug!(pattern = %key, empty_sweeps, "fuzzy watch context has no watchers");
            return;
        }

        let removed = self
            .contexts
            .remove_if(key, |_, c| Arc::ptr_eq(c, context) && c.try_mark_removed())
            .is_some();
        if !removed {
            return;
        }
        info!(pattern = %key, "fuzzy watch context removed");

        let cancel = WatchRegister::cancel(context.pattern().clone());
        if let Err(e) = self.send_request(cancel).await {
            debug!(pattern = %key, "cancel watch not delivered: {}", e);
        }

        // a context created for the same pattern meanwhile may have been cancelled along
        if let Some(successor) = self.contexts.get(key).map(|e| e.value().clone()) {
            info!(pattern = %key, "pattern re-watched during removal, scheduling re-registration");
            successor.set_consistent_with_server(false);
            self.notify_fuzzy_watch_sync();
        }
    }

    fn handle_ack(
        &self,
        key: &str,
        context: &Arc<ClientWatchContext>,
        ack: &WatchRegisterAck,
    ) {
        match ack.error {
            None => {
                trace!(pattern = %key, "fuzzy watch registration acknowledged");
                context.clear_over_limit_ts();
            }
            Some(code) if code.is_over_limit() => {
                warn!(pattern = %key, code = code.code(), "fuzzy watch registration over limit");
                self.enqueue(NotifyTask::OverLimit {
                    pattern: key.to_string(),
                    code,
                });
            }
            Some(code) => {
                warn!(pattern = %key, code = code.code(), "fuzzy watch registration rejected");
            }
        }
    }

    /// Undoes a failed first registration. A context another caller has joined
    /// meanwhile stays; it is still inconsistent, so the resync loop registers it.
    fn rollback(
        &self,
        key: &str,
        context: &Arc<ClientWatchContext>,
        watcher: &Arc<dyn FuzzyWatchEventWatcher>,
    ) {
        context.remove_watcher(watcher);
        let removed = self
            .contexts
            .remove_if(key, |_, c| Arc::ptr_eq(c, context) && c.try_mark_removed())
            .is_some();
        if removed {
            debug!(pattern = %key, "new fuzzy watch context rolled back");
        } else {
            info!(pattern = %key, "new fuzzy watch context kept for joined watchers");
        }
    }

    async fn send_request(
        &self,
        request: WatchRegister,
    ) -> Result<WatchRegisterAck> {
        let duration = self.config.request_timeout();
        match timeout(duration, self.gateway.fuzzy_watch(request)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout {
                request_type: FUZZY_WATCH_REQUEST,
                duration,
            }
            .into()),
        }
    }

    fn schedule_retry(&self) {
        let bell = self.resync_bell.clone();
        let token = self.shutdown.clone();
        let delay = self.config.retry_delay();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(delay) => bell.notify_one(),
            }
        });
    }

    fn enqueue(
        &self,
        task: NotifyTask,
    ) {
        if self.notify_tx.send(task).is_err() {
            warn!("notify worker stopped, notification dropped");
        }
    }

    fn process(
        &self,
        task: NotifyTask,
    ) {
        match task {
            NotifyTask::Push(push) => self.dispatch_push(&push),
            NotifyTask::CatchUp { pattern, wrapper } => {
                if let Some(context) = self.context_by_key(&pattern) {
                    context.catch_up_watcher(&wrapper);
                }
            }
            NotifyTask::Resync(pattern) => {
                if let Some(context) = self.context_by_key(&pattern) {
                    context.sync_fuzzy_watchers();
                }
            }
            NotifyTask::OverLimit { pattern, code } => {
                if let Some(context) = self.context_by_key(&pattern) {
                    context.notify_over_limit_watchers(code);
                }
            }
            NotifyTask::Flush(tx) => {
                let _ = tx.send(());
            }
        }
    }

    fn dispatch_push(
        &self,
        push: &ServerPush,
    ) {
        if let Some(pattern) = push.pattern() {
            match self.get_fuzzy_watch_context(pattern) {
                Some(context) => context.on_event(push),
                None => debug!(pattern = %pattern, "push for unknown fuzzy watch pattern"),
            }
            return;
        }

        if let ServerPush::ChangeNotify { key, .. } = push {
            let targets: Vec<Arc<ClientWatchContext>> = self
                .contexts
                .iter()
                .filter(|e| e.value().pattern().matches(key))
                .map(|e| e.value().clone())
                .collect();
            for context in targets {
                context.on_event(push);
            }
        }
    }

    fn context_by_key(
        &self,
        key: &str,
    ) -> Option<Arc<ClientWatchContext>> {
        self.contexts.get(key).map(|e| e.value().clone())
    }

    async fn run_notify_worker(
        registry: Weak<Self>,
        mut notify_rx: mpsc::UnboundedReceiver<NotifyTask>,
        shutdown: CancellationToken,
    ) {
        loop {
            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                task = notify_rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            let Some(registry) = registry.upgrade() else {
                break;
            };
            registry.process(task);
        }
        debug!("fuzzy watch notify worker exited");
    }

    async fn run_resync_loop(
        registry: Weak<Self>,
        bell: Arc<Notify>,
        shutdown: CancellationToken,
        period: std::time::Duration,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(period) => {}
                _ = bell.notified() => {}
            }
            let Some(registry) = registry.upgrade() else {
                break;
            };
            registry.execute_naming_fuzzy_watch().await;
        }
        debug!("fuzzy watch resync loop exited");
    }
}

impl<G> ServerPushSink for ClientWatchRegistry<G>
where
    G: RemoteWatchGateway,
{
    fn on_server_push(
        &self,
        push: ServerPush,
    ) {
        trace!(?push, "server push received");
        self.enqueue(NotifyTask::Push(push));
    }
}

impl<G> Drop for ClientWatchRegistry<G>
where
    G: RemoteWatchGateway,
{
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
