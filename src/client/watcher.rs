use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::proto::ChangedType;
use crate::proto::FuzzyWatchErrorCode;
use crate::FuzzyPattern;
use crate::KeyState;
use crate::ServiceKey;
use crate::WatcherError;

/// Why a change is being delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncType {
    /// Part of the bootstrap snapshot (or a catch-up of it)
    InitNotify,
    /// Incremental server change
    ResourceChanged,
    /// Redelivery by the resync pass
    DiffSync,
}

/// Change delivered to a watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzyWatchChangeEvent {
    pub namespace: String,
    pub group_name: String,
    pub service_name: String,
    pub changed_type: ChangedType,
    pub sync_type: SyncType,
}

impl FuzzyWatchChangeEvent {
    pub(crate) fn new(
        key: &ServiceKey,
        changed_type: ChangedType,
        sync_type: SyncType,
    ) -> Self {
        Self {
            namespace: key.namespace.clone(),
            group_name: key.group.clone(),
            service_name: key.name.clone(),
            changed_type,
            sync_type,
        }
    }

    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::new(
            self.namespace.clone(),
            self.group_name.clone(),
            self.service_name.clone(),
        )
    }
}

/// User supplied callbacks of a fuzzy watch.
///
/// Identity is the identity of the `Arc` that holds the watcher: registering
/// the same `Arc` twice on a pattern is a no-op.
///
/// A watcher that returns an error (or panics) from `on_event` does not affect
/// its siblings; the item is retried by the next resync pass.
pub trait FuzzyWatchEventWatcher: Send + Sync + 'static {
    fn on_event(
        &self,
        event: &FuzzyWatchChangeEvent,
    ) -> std::result::Result<(), WatcherError>;

    /// The server refused the pattern because its namespace holds too many patterns
    fn on_pattern_over_limit(&self) {}

    /// The pattern matches more services than the server tracks
    fn on_service_reach_up_limit(&self) {}
}

pub(crate) fn same_watcher(
    a: &Arc<dyn FuzzyWatchEventWatcher>,
    b: &Arc<dyn FuzzyWatchEventWatcher>,
) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[derive(Default)]
struct SyncState {
    /// Keys this watcher has been told about
    synced: BTreeSet<ServiceKey>,
    /// Failed delivery attempts per key still awaiting redelivery
    failures: HashMap<ServiceKey, u32>,
}

/// Per (pattern, watcher) delivery bookkeeping.
pub(crate) struct WatcherWrapper {
    id: String,
    watcher: Arc<dyn FuzzyWatchEventWatcher>,
    state: Mutex<SyncState>,
}

impl fmt::Debug for WatcherWrapper {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("WatcherWrapper").field("id", &self.id).finish()
    }
}

impl WatcherWrapper {
    pub(crate) fn new(watcher: Arc<dyn FuzzyWatchEventWatcher>) -> Self {
        Self {
            id: nanoid::nanoid!(),
            watcher,
            state: Mutex::new(SyncState::default()),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn wraps(
        &self,
        watcher: &Arc<dyn FuzzyWatchEventWatcher>,
    ) -> bool {
        same_watcher(&self.watcher, watcher)
    }

    pub(crate) fn synced_keys(&self) -> BTreeSet<ServiceKey> {
        self.state.lock().synced.clone()
    }

    /// Forgets the failed attempts of `key`; a newer change replaced that item.
    pub(crate) fn supersede(
        &self,
        key: &ServiceKey,
    ) {
        self.state.lock().failures.remove(key);
    }

    /// Whether delivering `changed_type` for `key` would change what this watcher knows.
    pub(crate) fn needs(
        &self,
        key: &ServiceKey,
        changed_type: ChangedType,
    ) -> bool {
        let state = self.state.lock();
        match changed_type {
            ChangedType::Add => !state.synced.contains(key),
            ChangedType::Delete => state.synced.contains(key),
        }
    }

    /// Differences between `received` and what this watcher knows.
    ///
    /// With `include_failed == false` keys whose delivery already failed are
    /// left to the resync pass. Failure counters of keys that no longer differ
    /// are dropped.
    pub(crate) fn pending_items(
        &self,
        received: &BTreeSet<ServiceKey>,
        include_failed: bool,
    ) -> Vec<KeyState> {
        let mut state = self.state.lock();
        let items = crate::diff_service_keys(received, &state.synced);
        state
            .failures
            .retain(|key, _| items.iter().any(|item| &item.key == key));
        items
            .into_iter()
            .filter(|item| include_failed || !state.failures.contains_key(&item.key))
            .collect()
    }

    /// Invokes the watcher once. Returns `true` on success.
    pub(crate) fn deliver(
        &self,
        pattern: &FuzzyPattern,
        key: &ServiceKey,
        changed_type: ChangedType,
        sync_type: SyncType,
        retry_limit: u32,
    ) -> bool {
        let event = FuzzyWatchChangeEvent::new(key, changed_type, sync_type);
        let outcome = match catch_unwind(AssertUnwindSafe(|| self.watcher.on_event(&event))) {
            Ok(result) => result,
            Err(payload) => Err(WatcherError::Panicked(panic_message(payload))),
        };

        let mut state = self.state.lock();
        match outcome {
            Ok(()) => {
                debug!(
                    pattern = %pattern,
                    watcher = %self.id,
                    key = %key,
                    ?changed_type,
                    ?sync_type,
                    "[notify-watcher-ok]"
                );
                state.failures.remove(key);
                apply(&mut state.synced, key, changed_type);
                true
            }
            Err(e) => {
                let attempts = {
                    let counter = state.failures.entry(key.clone()).or_insert(0);
                    *counter += 1;
                    *counter
                };
                if attempts > retry_limit {
                    error!(
                        pattern = %pattern,
                        watcher = %self.id,
                        key = %key,
                        attempts,
                        "[notify-watcher-error] giving up after retries: {}",
                        e
                    );
                    state.failures.remove(key);
                    apply(&mut state.synced, key, changed_type);
                } else {
                    warn!(
                        pattern = %pattern,
                        watcher = %self.id,
                        key = %key,
                        attempts,
                        "[notify-watcher-error] will retry on next resync: {}",
                        e
                    );
                }
                false
            }
        }
    }

    pub(crate) fn notify_over_limit(
        &self,
        pattern: &FuzzyPattern,
        code: FuzzyWatchErrorCode,
    ) {
        let result = catch_unwind(AssertUnwindSafe(|| match code {
            FuzzyWatchErrorCode::PatternOverLimit => self.watcher.on_pattern_over_limit(),
            FuzzyWatchErrorCode::ServiceOverLimit => self.watcher.on_service_reach_up_limit(),
            FuzzyWatchErrorCode::Unsupported => {}
        }));
        if let Err(payload) = result {
            error!(
                pattern = %pattern,
                watcher = %self.id,
                ?code,
                "over limit callback panicked: {}",
                panic_message(payload)
            );
        }
    }
}

fn apply(
    synced: &mut BTreeSet<ServiceKey>,
    key: &ServiceKey,
    changed_type: ChangedType,
) {
    match changed_type {
        ChangedType::Add => {
            synced.insert(key.clone());
        }
        ChangedType::Delete => {
            synced.remove(key);
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
