//! Push layer of the server.
//!
//! Turns registrations into bootstrap streams and catalog mutations into
//! `ChangeNotify` fan-out. Bootstrap streams and fan-out rounds serialize on
//! one lock, so every bootstrap snapshot reflects all changes fanned out
//! before it, and a pattern still bootstrapping for a client receives no
//! `ChangeNotify` until its `FinishInitNotify` went out.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::index::FuzzyWatchIndexEvent;
use super::index::ServerPatternIndex;
use crate::proto::ChangedType;
use crate::proto::FuzzyWatchErrorCode;
use crate::proto::NotifyItem;
use crate::proto::ServerPush;
use crate::proto::WatchRegister;
use crate::proto::WatchRegisterAck;
use crate::proto::WatchType;
use crate::utils::scoped_timer::ScopedTimer;
use crate::CatalogEvent;
use crate::ClientPusher;
use crate::Error;
use crate::FuzzyPattern;
use crate::NetworkError;
use crate::Service;
use crate::ServiceChangeType;
use crate::WatchError;

const PUSH_REQUEST: &str = "fuzzy_watch_push";

pub struct FuzzyWatchPushService {
    index: Arc<ServerPatternIndex>,
    pusher: Arc<dyn ClientPusher>,

    /// Orders bootstrap streams against change fan-out
    fanout: tokio::sync::Mutex<()>,

    /// (client id, pattern) pairs whose bootstrap has not finished
    bootstrapping: Mutex<HashSet<(String, String)>>,

    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for FuzzyWatchPushService {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("FuzzyWatchPushService")
            .field("index", &self.index)
            .field("bootstrapping", &self.bootstrapping.lock().len())
            .finish()
    }
}

impl FuzzyWatchPushService {
    pub fn new(
        index: Arc<ServerPatternIndex>,
        pusher: Arc<dyn ClientPusher>,
    ) -> Self {
        Self {
            index,
            pusher,
            fanout: tokio::sync::Mutex::new(()),
            bootstrapping: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn index(&self) -> &Arc<ServerPatternIndex> {
        &self.index
    }

    /// Spawns the trim loop and the consumer of catalog mutation events.
    pub fn start(
        self: &Arc<Self>,
        events: mpsc::UnboundedReceiver<CatalogEvent>,
    ) {
        let trim = tokio::spawn(Self::run_trim_loop(self.clone()));
        let consumer = tokio::spawn(Self::run_event_loop(self.clone(), events));
        self.handles.lock().extend([trim, consumer]);
        info!("fuzzy watch push service started");
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("fuzzy watch push task failed: {:?}", e);
            }
        }
        info!("fuzzy watch push service stopped");
    }

    /// Answers one client registration. A successful `Watch` spawns the
    /// bootstrap stream for the client.
    pub fn handle_register(
        self: &Arc<Self>,
        client_id: &str,
        request: WatchRegister,
    ) -> WatchRegisterAck {
        if request.watch_type == WatchType::CancelWatch {
            self.index.remove_fuzzy_watch_context(&request.pattern, client_id);
            return WatchRegisterAck::ok();
        }

        if let Err(e) = self.index.sync_fuzzy_watcher_context(&request.pattern, client_id) {
            return match e {
                Error::Watch(WatchError::PatternOverLimit { .. }) => {
                    WatchRegisterAck::error(FuzzyWatchErrorCode::PatternOverLimit)
                }
                other => {
                    error!(client_id, pattern = %request.pattern, "fuzzy watch registration failed: {}", other);
                    WatchRegisterAck::error(FuzzyWatchErrorCode::Unsupported)
                }
            };
        }

        self.bootstrapping
            .lock()
            .insert((client_id.to_string(), request.pattern.to_string()));

        let this = self.clone();
        let client_id = client_id.to_string();
        tokio::spawn(async move {
            this.stream_bootstrap(&client_id, request).await;
        });
        WatchRegisterAck::ok()
    }

    async fn stream_bootstrap(
        &self,
        client_id: &str,
        request: WatchRegister,
    ) {
        let _guard = self.fanout.lock().await;
        let _timer = ScopedTimer::new("fuzzy_watch_bootstrap");

        let pattern = request.pattern;
        let marker = (client_id.to_string(), pattern.to_string());
        let matched = self.index.match_service_keys(&pattern).unwrap_or_default();

        let missing: Vec<NotifyItem> = matched
            .difference(&request.received_keys)
            .cloned()
            .map(NotifyItem::add)
            .collect();
        let batch_size = self.index.config().init_notify_batch_size.max(1);
        debug!(
            client_id,
            pattern = %pattern,
            missing = missing.len(),
            initializing = request.initializing,
            "[fuzzy-watch] bootstrap stream"
        );

        let mut delivered = true;
        for batch in missing.chunks(batch_size) {
            let push = ServerPush::InitNotify {
                pattern: pattern.clone(),
                items: batch.to_vec(),
            };
            if !self.push_to(client_id, push).await {
                delivered = false;
                break;
            }
        }
        if delivered {
            delivered = self
                .push_to(
                    client_id,
                    ServerPush::FinishInitNotify {
                        pattern: pattern.clone(),
                    },
                )
                .await;
        }
        self.bootstrapping.lock().remove(&marker);
        if !delivered {
            // the client re-registers from its resync loop
            warn!(client_id, pattern = %pattern, "[fuzzy-watch] bootstrap stream interrupted");
            return;
        }

        for stale in request.received_keys.difference(&matched) {
            let push = ServerPush::ChangeNotify {
                pattern: Some(pattern.clone()),
                key: stale.clone(),
                changed_type: ChangedType::Delete,
            };
            self.push_to(client_id, push).await;
        }

        if self.index.is_over_limit(&pattern) {
            let push = ServerPush::LoadEvent {
                pattern: pattern.clone(),
                code: FuzzyWatchErrorCode::ServiceOverLimit,
            };
            self.push_to(client_id, push).await;
        }
    }

    /// Applies a catalog mutation and notifies every affected subscriber.
    pub async fn on_service_changed(
        &self,
        service: &Service,
        change_type: ServiceChangeType,
    ) {
        let _guard = self.fanout.lock().await;

        if self.index.get_fuzzy_watched_clients(service).is_empty() {
            // no subscriber anywhere; the index still tracks membership
            self.index.sync_service_context_detailed(service, change_type);
            trace!(service = ?service, "no fuzzy watch subscriber");
            return;
        }

        let outcome = self.index.sync_service_context_detailed(service, change_type);
        if outcome.is_empty() {
            return;
        }

        let key = service.key();
        let changed_type = match change_type {
            ServiceChangeType::DeleteService => ChangedType::Delete,
            _ => ChangedType::Add,
        };

        let mut pushes = Vec::new();
        for pattern in &outcome.changed_patterns {
            for client_id in self.ready_subscribers(pattern) {
                pushes.push((
                    client_id,
                    ServerPush::ChangeNotify {
                        pattern: Some(pattern.clone()),
                        key: key.clone(),
                        changed_type,
                    },
                ));
            }
        }
        for (pattern, backfilled) in &outcome.backfilled {
            for client_id in self.ready_subscribers(pattern) {
                pushes.push((
                    client_id,
                    ServerPush::ChangeNotify {
                        pattern: Some(pattern.clone()),
                        key: backfilled.clone(),
                        changed_type: ChangedType::Add,
                    },
                ));
            }
        }
        for pattern in &outcome.over_limit_transitions {
            for client_id in self.ready_subscribers(pattern) {
                pushes.push((
                    client_id,
                    ServerPush::LoadEvent {
                        pattern: pattern.clone(),
                        code: FuzzyWatchErrorCode::ServiceOverLimit,
                    },
                ));
            }
        }

        debug!(key = %key, ?changed_type, pushes = pushes.len(), "[fuzzy-watch] fan-out");
        join_all(
            pushes
                .into_iter()
                .map(|(client_id, push)| async move { self.push_to(&client_id, push).await }),
        )
        .await;
    }

    /// The client disconnected.
    pub fn on_client_release(
        &self,
        client_id: &str,
    ) {
        self.bootstrapping.lock().retain(|(id, _)| id != client_id);
        self.index.on_event(FuzzyWatchIndexEvent::ClientReleased {
            client_id: client_id.to_string(),
        });
    }

    fn ready_subscribers(
        &self,
        pattern: &FuzzyPattern,
    ) -> Vec<String> {
        let pattern_key = pattern.to_string();
        let bootstrapping = self.bootstrapping.lock();
        self.index
            .watched_clients_of(pattern)
            .into_iter()
            .filter(|client_id| !bootstrapping.contains(&(client_id.clone(), pattern_key.clone())))
            .collect()
    }

    async fn push_to(
        &self,
        client_id: &str,
        push: ServerPush,
    ) -> bool {
        let duration = self.index.config().push_timeout();
        let result = match timeout(duration, self.pusher.push(client_id, push)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout {
                request_type: PUSH_REQUEST,
                duration,
            }
            .into()),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(client_id, "[fuzzy-watch] push failed: {}", e);
                false
            }
        }
    }

    async fn run_trim_loop(self: Arc<Self>) {
        let mut ticker = interval(self.index.config().trim_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.index.trim_fuzzy_watch_context();
                    if !removed.is_empty() {
                        debug!(removed = removed.len(), "[fuzzy-watch] trim sweep");
                    }
                }
            }
        }
        debug!("fuzzy watch trim loop exited");
    }

    async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<CatalogEvent>,
    ) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.on_service_changed(&event.service, event.change_type).await;
        }
        debug!("fuzzy watch catalog event loop exited");
    }
}
