//! Client side state of one fuzzy pattern.
//!
//! A [`ClientWatchContext`] holds the keys the server reported for the pattern
//! (`received_keys`), the watchers registered on it, and the bootstrap
//! promise. Delivery to watchers always goes through their
//! [`WatcherWrapper`], which remembers what each watcher has been told; every
//! notification path only delivers where the wrapper's view differs from the
//! change, so a key is never reported twice to the same watcher.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::debug;
use tracing::info;
use tracing::trace;

use super::bootstrap::BootstrapFuture;
use super::bootstrap::BootstrapPromise;
use super::watcher::FuzzyWatchEventWatcher;
use super::watcher::SyncType;
use super::watcher::WatcherWrapper;
use crate::proto::ChangedType;
use crate::proto::FuzzyWatchErrorCode;
use crate::proto::ServerPush;
use crate::proto::WatchRegister;
use crate::utils::time::timestamp_millis;
use crate::FuzzyPattern;
use crate::ServiceKey;

/// Result of attaching a watcher to a context.
#[derive(Debug)]
pub(crate) enum AttachOutcome {
    Added(Arc<WatcherWrapper>),
    /// The same watcher is already registered
    Duplicate,
    /// The context was dropped from the registry; attach to a fresh one
    Removed,
}

pub struct ClientWatchContext {
    pattern: FuzzyPattern,

    /// Authoritative key set as last reported by the server
    received_keys: RwLock<BTreeSet<ServiceKey>>,

    watchers: Mutex<Vec<Arc<WatcherWrapper>>>,

    /// Set once `FinishInitNotify` arrived, cleared by a connection reset
    consistent_with_server: AtomicBool,

    /// `true` until the first bootstrap completed
    initializing: AtomicBool,

    /// Marked stale: no watchers left, pending removal by the resync loop
    discard: AtomicBool,

    empty_sweeps: AtomicU32,

    /// Dropped from the registry; set under the watchers lock
    removed: AtomicBool,

    /// At most one unresolved promise
    bootstrap: Mutex<Option<BootstrapPromise>>,

    /// Milliseconds of the last pattern over-limit notification, 0 = none
    pattern_over_limit_ts: AtomicU64,
    /// Milliseconds of the last service over-limit notification, 0 = none
    service_over_limit_ts: AtomicU64,

    watcher_retry_limit: u32,
}

impl fmt::Debug for ClientWatchContext {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ClientWatchContext")
            .field("pattern", &self.pattern.to_string())
            .field("received_keys", &self.received_keys.read().len())
            .field("watchers", &self.watchers.lock().len())
            .field("consistent_with_server", &self.is_consistent_with_server())
            .field("discard", &self.is_discard())
            .finish()
    }
}

impl ClientWatchContext {
    pub(crate) fn new(
        pattern: FuzzyPattern,
        watcher_retry_limit: u32,
    ) -> Self {
        Self {
            pattern,
            received_keys: RwLock::new(BTreeSet::new()),
            watchers: Mutex::new(Vec::new()),
            consistent_with_server: AtomicBool::new(false),
            initializing: AtomicBool::new(true),
            discard: AtomicBool::new(false),
            empty_sweeps: AtomicU32::new(0),
            removed: AtomicBool::new(false),
            bootstrap: Mutex::new(None),
            pattern_over_limit_ts: AtomicU64::new(0),
            service_over_limit_ts: AtomicU64::new(0),
            watcher_retry_limit,
        }
    }

    pub fn pattern(&self) -> &FuzzyPattern {
        &self.pattern
    }

    pub fn is_consistent_with_server(&self) -> bool {
        self.consistent_with_server.load(Ordering::Acquire)
    }

    pub(crate) fn set_consistent_with_server(
        &self,
        consistent: bool,
    ) {
        self.consistent_with_server.store(consistent, Ordering::Release);
    }

    pub fn is_initializing(&self) -> bool {
        self.initializing.load(Ordering::Acquire)
    }

    pub fn is_discard(&self) -> bool {
        self.discard.load(Ordering::Acquire)
    }

    pub fn received_service_keys(&self) -> BTreeSet<ServiceKey> {
        self.received_keys.read().clone()
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().len()
    }

    pub fn has_watchers(&self) -> bool {
        !self.watchers.lock().is_empty()
    }

    pub fn contains_watcher(
        &self,
        watcher: &Arc<dyn FuzzyWatchEventWatcher>,
    ) -> bool {
        self.watchers.lock().iter().any(|w| w.wraps(watcher))
    }

    /// Keys the given watcher has been told about, `None` if it is not registered here.
    pub fn synced_keys_of(
        &self,
        watcher: &Arc<dyn FuzzyWatchEventWatcher>,
    ) -> Option<BTreeSet<ServiceKey>> {
        self.watchers
            .lock()
            .iter()
            .find(|w| w.wraps(watcher))
            .map(|w| w.synced_keys())
    }

    /// Adds a watcher unless it is already registered or the context left the registry.
    pub(crate) fn add_watcher(
        &self,
        watcher: Arc<dyn FuzzyWatchEventWatcher>,
    ) -> AttachOutcome {
        let mut watchers = self.watchers.lock();
        if self.removed.load(Ordering::Acquire) {
            return AttachOutcome::Removed;
        }
        if watchers.iter().any(|w| w.wraps(&watcher)) {
            return AttachOutcome::Duplicate;
        }
        let wrapper = Arc::new(WatcherWrapper::new(watcher));
        watchers.push(wrapper.clone());
        self.discard.store(false, Ordering::Release);
        self.empty_sweeps.store(0, Ordering::Release);
        debug!(pattern = %self.pattern, watcher = wrapper.id(), "watcher registered");
        AttachOutcome::Added(wrapper)
    }

    /// Marks the context removed if it still has no watcher. A removed
    /// context refuses every later [`Self::add_watcher`].
    pub(crate) fn try_mark_removed(&self) -> bool {
        let watchers = self.watchers.lock();
        if !watchers.is_empty() {
            return false;
        }
        self.removed.store(true, Ordering::Release);
        true
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Removes a watcher. The context is marked stale when it becomes empty.
    pub(crate) fn remove_watcher(
        &self,
        watcher: &Arc<dyn FuzzyWatchEventWatcher>,
    ) -> bool {
        let mut watchers = self.watchers.lock();
        let before = watchers.len();
        watchers.retain(|w| !w.wraps(watcher));
        let removed = watchers.len() != before;
        if removed && watchers.is_empty() {
            self.discard.store(true, Ordering::Release);
            info!(pattern = %self.pattern, "last watcher removed, context marked stale");
        }
        removed
    }

    /// Records one sweep of the resync loop. Returns the number of consecutive
    /// sweeps that found the context without watchers.
    pub(crate) fn observe_sweep(&self) -> u32 {
        if self.has_watchers() {
            self.empty_sweeps.store(0, Ordering::Release);
            return 0;
        }
        self.discard.store(true, Ordering::Release);
        self.empty_sweeps.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Future of the pattern's first consistent snapshot.
    ///
    /// Shares the pending promise if one exists, resolves immediately if the
    /// context is already consistent.
    pub fn create_new_future(&self) -> BootstrapFuture {
        let mut slot = self.bootstrap.lock();
        if let Some(promise) = slot.as_ref() {
            if !promise.is_resolved() {
                return promise.subscribe();
            }
        }
        if self.is_consistent_with_server() {
            return BootstrapPromise::resolved(self.received_service_keys());
        }
        let promise = BootstrapPromise::new();
        let future = promise.subscribe();
        *slot = Some(promise);
        future
    }

    /// Registration request reflecting the current state.
    pub(crate) fn build_register_request(&self) -> WatchRegister {
        let mut request = WatchRegister::watch(self.pattern.clone());
        request.received_keys = self.received_service_keys();
        request.initializing = self.is_initializing();
        request
    }

    /// Applies one server push addressed to this context.
    pub(crate) fn on_event(
        &self,
        push: &ServerPush,
    ) {
        match push {
            ServerPush::InitNotify { items, .. } => {
                self.initializing.store(true, Ordering::Release);
                for item in items {
                    self.apply_change(&item.key, item.changed_type, SyncType::InitNotify);
                }
            }
            ServerPush::FinishInitNotify { .. } => self.finish_init(),
            ServerPush::ChangeNotify { key, changed_type, .. } => {
                if self.pattern.matches(key) {
                    self.apply_change(key, *changed_type, SyncType::ResourceChanged);
                } else {
                    trace!(pattern = %self.pattern, key = %key, "change does not match pattern");
                }
            }
            ServerPush::LoadEvent { code, .. } => {
                self.notify_over_limit_watchers(*code);
            }
        }
    }

    fn apply_change(
        &self,
        key: &ServiceKey,
        changed_type: ChangedType,
        sync_type: SyncType,
    ) {
        {
            let mut received = self.received_keys.write();
            match changed_type {
                ChangedType::Add => received.insert(key.clone()),
                ChangedType::Delete => received.remove(key),
            };
        }
        for wrapper in self.watchers_snapshot() {
            wrapper.supersede(key);
            if wrapper.needs(key, changed_type) {
                wrapper.deliver(&self.pattern, key, changed_type, sync_type, self.watcher_retry_limit);
            }
        }
    }

    fn finish_init(&self) {
        self.initializing.store(false, Ordering::Release);
        self.set_consistent_with_server(true);
        let snapshot = self.received_service_keys();
        if let Some(promise) = self.bootstrap.lock().take() {
            promise.resolve(snapshot.clone());
        }
        info!(pattern = %self.pattern, keys = snapshot.len(), "bootstrap finished");
        for wrapper in self.watchers_snapshot() {
            self.deliver_pending(&wrapper, &snapshot, false, SyncType::InitNotify);
        }
    }

    /// Replays the received keys to a newly added watcher that is still attached.
    pub(crate) fn catch_up_watcher(
        &self,
        wrapper: &Arc<WatcherWrapper>,
    ) {
        if !self.watchers.lock().iter().any(|w| Arc::ptr_eq(w, wrapper)) {
            return;
        }
        let received = self.received_service_keys();
        self.deliver_pending(wrapper, &received, false, SyncType::InitNotify);
    }

    /// Resync pass: redelivers every difference between the received keys and
    /// each watcher's view, including items whose delivery failed before.
    pub fn sync_fuzzy_watchers(&self) {
        let received = self.received_service_keys();
        for wrapper in self.watchers_snapshot() {
            self.deliver_pending(&wrapper, &received, true, SyncType::DiffSync);
        }
    }

    fn deliver_pending(
        &self,
        wrapper: &WatcherWrapper,
        received: &BTreeSet<ServiceKey>,
        include_failed: bool,
        sync_type: SyncType,
    ) {
        for item in wrapper.pending_items(received, include_failed) {
            let changed_type = if item.exists {
                ChangedType::Add
            } else {
                ChangedType::Delete
            };
            wrapper.deliver(&self.pattern, &item.key, changed_type, sync_type, self.watcher_retry_limit);
        }
    }

    /// Invokes the matching over-limit callback on every watcher, at most
    /// once until [`Self::clear_over_limit_ts`]. Returns whether callbacks ran.
    pub fn notify_over_limit_watchers(
        &self,
        code: FuzzyWatchErrorCode,
    ) -> bool {
        let ts = match code {
            FuzzyWatchErrorCode::PatternOverLimit => &self.pattern_over_limit_ts,
            FuzzyWatchErrorCode::ServiceOverLimit => &self.service_over_limit_ts,
            FuzzyWatchErrorCode::Unsupported => return false,
        };
        let now = timestamp_millis().max(1);
        if ts.compare_exchange(0, now, Ordering::AcqRel, Ordering::Acquire).is_err() {
            debug!(pattern = %self.pattern, ?code, "over limit already reported, suppressed");
            return false;
        }
        info!(pattern = %self.pattern, ?code, "notifying watchers of over limit");
        for wrapper in self.watchers_snapshot() {
            wrapper.notify_over_limit(&self.pattern, code);
        }
        true
    }

    pub fn clear_over_limit_ts(&self) {
        self.pattern_over_limit_ts.store(0, Ordering::Release);
        self.service_over_limit_ts.store(0, Ordering::Release);
    }

    fn watchers_snapshot(&self) -> Vec<Arc<WatcherWrapper>> {
        self.watchers.lock().clone()
    }
}
