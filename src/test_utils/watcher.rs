use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::proto::ChangedType;
use crate::FuzzyWatchChangeEvent;
use crate::FuzzyWatchEventWatcher;
use crate::ServiceKey;
use crate::WatcherError;

/// Watcher that records what it is told, with failure injection.
#[derive(Default)]
pub struct RecordingWatcher {
    events: Mutex<Vec<FuzzyWatchChangeEvent>>,
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
    panic_next: AtomicBool,
    pattern_over_limit: AtomicUsize,
    service_over_limit: AtomicUsize,
}

impl RecordingWatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails the first `n` deliveries.
    pub fn failing(n: usize) -> Arc<Self> {
        let watcher = Self::default();
        watcher.failures_left.store(n, Ordering::SeqCst);
        Arc::new(watcher)
    }

    /// Panics on the next delivery.
    pub fn panicking() -> Arc<Self> {
        let watcher = Self::default();
        watcher.panic_next.store(true, Ordering::SeqCst);
        Arc::new(watcher)
    }

    pub fn events(&self) -> Vec<FuzzyWatchChangeEvent> {
        self.events.lock().clone()
    }

    /// Successful deliveries
    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    /// All `on_event` invocations, failed ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Keys currently present according to the delivered events
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
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("injected panic");
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err("injected failure".into());
        }
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
