//! Authoritative pattern -> matched key mapping.
//!
//! The index enforces both admission caps, consumes catalog mutations and
//! answers "who must be told" for the push layer. Entries are independent:
//! mutations of one pattern's matched set serialize on that entry's lock only.

use std::collections::BTreeSet;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::entry::AddOutcome;
use super::entry::ServerPatternEntry;
use crate::FuzzyPattern;
use crate::FuzzyWatchServerConfig;
use crate::Result;
use crate::Service;
use crate::ServiceCatalog;
use crate::ServiceChangeType;
use crate::ServiceKey;
use crate::WatchError;

/// Events the connection layer reports to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FuzzyWatchIndexEvent {
    /// The client disconnected; it leaves every subscriber set
    ClientReleased { client_id: String },
}

/// What one catalog mutation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Patterns whose matched set gained or lost the mutated key
    pub changed_patterns: Vec<FuzzyPattern>,
    /// Keys pulled in to refill a pattern after a deletion freed capacity
    pub backfilled: Vec<(FuzzyPattern, ServiceKey)>,
    /// Patterns that just crossed the matched service cap
    pub over_limit_transitions: Vec<FuzzyPattern>,
}

impl SyncOutcome {
    pub fn need_notify(&self) -> bool {
        !self.changed_patterns.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.changed_patterns.is_empty() && self.backfilled.is_empty() && self.over_limit_transitions.is_empty()
    }
}

pub struct ServerPatternIndex {
    catalog: Arc<dyn ServiceCatalog>,
    config: FuzzyWatchServerConfig,

    /// Canonical pattern string -> entry
    entries: DashMap<String, Arc<ServerPatternEntry>>,

    /// Serializes the count-then-create admission step
    admission: Mutex<()>,
}

impl fmt::Debug for ServerPatternIndex {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ServerPatternIndex")
            .field("patterns", &self.entries.len())
            .field("config", &self.config)
            .finish()
    }
}

impl ServerPatternIndex {
    pub fn new(
        catalog: Arc<dyn ServiceCatalog>,
        config: FuzzyWatchServerConfig,
    ) -> Self {
        Self {
            catalog,
            config,
            entries: DashMap::new(),
            admission: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &FuzzyWatchServerConfig {
        &self.config
    }

    /// Returns the entry of `pattern`, creating it from a catalog scan if absent.
    ///
    /// # Errors
    /// [`WatchError::PatternOverLimit`] if the pattern's namespace already holds
    /// `max_pattern_count` patterns. Nothing is created in that case.
    pub fn init_watch_match_service(
        &self,
        pattern: &FuzzyPattern,
    ) -> Result<Arc<ServerPatternEntry>> {
        let key = pattern.to_string();
        if let Some(entry) = self.entry_by_key(&key) {
            return Ok(entry);
        }

        let _guard = self.admission.lock();
        if let Some(entry) = self.entry_by_key(&key) {
            return Ok(entry);
        }

        let active = self.pattern_count_in(pattern.namespace());
        if active >= self.config.max_pattern_count {
            warn!(
                pattern = %key,
                active,
                limit = self.config.max_pattern_count,
                "[fuzzy-watch] pattern count over limit, registration rejected"
            );
            return Err(WatchError::PatternOverLimit {
                pattern: key,
                limit: self.config.max_pattern_count,
            }
            .into());
        }

        // visible before the scan; concurrent mutations wait on the entry lock
        let entry = Arc::new(ServerPatternEntry::new(pattern.clone()));
        let (matched, over_limit) = entry.populate(
            || {
                self.entries.insert(key.clone(), entry.clone());
            },
            || self.scan(pattern),
        );
        if over_limit {
            warn!(
                pattern = %key,
                limit = self.config.max_matched_service_count,
                "[fuzzy-watch] pattern matched service count over limit"
            );
        }
        info!(pattern = %key, matched, "[fuzzy-watch] pattern entry created");
        Ok(entry)
    }

    /// Subscribes `client_id` to `pattern`, creating the entry if needed. Idempotent.
    pub fn sync_fuzzy_watcher_context(
        &self,
        pattern: &FuzzyPattern,
        client_id: &str,
    ) -> Result<Arc<ServerPatternEntry>> {
        loop {
            let entry = self.init_watch_match_service(pattern)?;
            if entry.try_add_subscriber(client_id) {
                debug!(pattern = %pattern, client_id, "[fuzzy-watch] client subscribed");
                return Ok(entry);
            }
            // lost a race with the trim sweep, the next round recreates the entry
            trace!(pattern = %pattern, client_id, "entry removed concurrently, retrying");
        }
    }

    /// Unsubscribes `client_id` from `pattern` (client `CancelWatch`).
    pub fn remove_fuzzy_watch_context(
        &self,
        pattern: &FuzzyPattern,
        client_id: &str,
    ) -> bool {
        let removed = self
            .entry_by_key(&pattern.to_string())
            .map(|entry| entry.remove_subscriber(client_id))
            .unwrap_or(false);
        if removed {
            debug!(pattern = %pattern, client_id, "[fuzzy-watch] client unsubscribed");
        }
        removed
    }

    /// Applies one catalog mutation. Returns whether any subscriber must be notified.
    pub fn sync_service_context(
        &self,
        service: &Service,
        change_type: ServiceChangeType,
    ) -> bool {
        self.sync_service_context_detailed(service, change_type).need_notify()
    }

    pub fn sync_service_context_detailed(
        &self,
        service: &Service,
        change_type: ServiceChangeType,
    ) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        if change_type == ServiceChangeType::InstanceChanged {
            return outcome;
        }

        let key = service.key();
        let cap = self.config.max_matched_service_count;
        for entry in self.entries_matching(&key) {
            let pattern = entry.pattern().clone();
            match change_type {
                ServiceChangeType::AddService => match entry.apply_add(&key, cap) {
                    AddOutcome::Inserted => {
                        info!(pattern = %pattern, key = %key, "[fuzzy-watch] matched service added");
                        outcome.changed_patterns.push(pattern);
                    }
                    AddOutcome::AlreadyMember => {}
                    AddOutcome::OverLimit { newly } => {
                        warn!(
                            pattern = %pattern,
                            key = %key,
                            "[fuzzy-watch] matched service count over limit, service ignored"
                        );
                        if newly {
                            outcome.over_limit_transitions.push(pattern);
                        }
                    }
                },
                ServiceChangeType::DeleteService => {
                    let deleted = entry.apply_delete(&key, cap, |pattern, tracked| {
                        self.untracked_candidates(pattern, tracked, &key)
                    });
                    if deleted.removed {
                        info!(pattern = %pattern, key = %key, "[fuzzy-watch] matched service removed");
                        if let Some(backfilled) = deleted.backfilled {
                            info!(pattern = %pattern, key = %backfilled, "[fuzzy-watch] makeup on overload");
                            outcome.backfilled.push((pattern.clone(), backfilled));
                        }
                        outcome.changed_patterns.push(pattern);
                    }
                }
                ServiceChangeType::InstanceChanged => {}
            }
        }
        outcome
    }

    /// Union of the subscribers of every pattern matching `service`.
    pub fn get_fuzzy_watched_clients(
        &self,
        service: &Service,
    ) -> HashSet<String> {
        let key = service.key();
        self.entries_matching(&key)
            .iter()
            .flat_map(|entry| entry.subscribers())
            .collect()
    }

    pub fn watched_clients_of(
        &self,
        pattern: &FuzzyPattern,
    ) -> HashSet<String> {
        self.entry_by_key(&pattern.to_string())
            .map(|entry| entry.subscribers())
            .unwrap_or_default()
    }

    /// Snapshot of a pattern's matched keys, `None` if the pattern is not indexed.
    pub fn match_service_keys(
        &self,
        pattern: &FuzzyPattern,
    ) -> Option<BTreeSet<ServiceKey>> {
        self.entry_by_key(&pattern.to_string()).map(|entry| entry.matched_keys())
    }

    pub fn is_over_limit(
        &self,
        pattern: &FuzzyPattern,
    ) -> bool {
        self.entry_by_key(&pattern.to_string())
            .map(|entry| entry.is_over_limit())
            .unwrap_or(false)
    }

    pub fn get_entry(
        &self,
        pattern: &FuzzyPattern,
    ) -> Option<Arc<ServerPatternEntry>> {
        self.entry_by_key(&pattern.to_string())
    }

    pub fn on_event(
        &self,
        event: FuzzyWatchIndexEvent,
    ) {
        match event {
            FuzzyWatchIndexEvent::ClientReleased { client_id } => {
                let mut released = 0;
                for entry in self.entries.iter() {
                    if entry.value().remove_subscriber(&client_id) {
                        released += 1;
                    }
                }
                info!(client_id = %client_id, patterns = released, "[fuzzy-watch] client released");
            }
        }
    }

    /// Periodic sweep. An entry without subscribers is removed once it has been
    /// observed empty on `empty_sweeps_before_removal` consecutive sweeps.
    /// Returns the removed patterns.
    pub fn trim_fuzzy_watch_context(&self) -> Vec<FuzzyPattern> {
        let snapshot: Vec<(String, Arc<ServerPatternEntry>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut removed = Vec::new();
        for (key, entry) in snapshot {
            let sweeps = entry.observe_sweep();
            if sweeps == 0 {
                continue;
            }
            if sweeps < self.config.empty_sweeps_before_removal {
                debug!(pattern = %key, sweeps, "[fuzzy-watch] pattern has no subscriber, marked");
                continue;
            }
            let gone = self
                .entries
                .remove_if(&key, |_, e| Arc::ptr_eq(e, &entry) && e.try_mark_removed())
                .is_some();
            if gone {
                info!(pattern = %key, "[fuzzy-watch] pattern entry trimmed");
                removed.push(entry.pattern().clone());
            }
        }
        removed
    }

    pub fn pattern_count(&self) -> usize {
        self.entries.len()
    }

    pub fn pattern_count_in(
        &self,
        namespace: &str,
    ) -> usize {
        self.entries
            .iter()
            .filter(|e| e.value().pattern().namespace() == namespace)
            .count()
    }

    fn entry_by_key(
        &self,
        key: &str,
    ) -> Option<Arc<ServerPatternEntry>> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    fn entries_matching(
        &self,
        key: &ServiceKey,
    ) -> Vec<Arc<ServerPatternEntry>> {
        self.entries
            .iter()
            .filter(|e| e.value().pattern().matches(key))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Sorted catalog keys matching `pattern`; the truncation order of the cap.
    fn matching_catalog_keys(
        &self,
        pattern: &FuzzyPattern,
    ) -> Vec<ServiceKey> {
        let mut keys: Vec<ServiceKey> = self
            .catalog
            .services(pattern.namespace())
            .iter()
            .map(Service::key)
            .filter(|key| pattern.matches(key))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    fn scan(
        &self,
        pattern: &FuzzyPattern,
    ) -> (BTreeSet<ServiceKey>, bool) {
        let mut keys = self.matching_catalog_keys(pattern);
        let cap = self.config.max_matched_service_count;
        let over_limit = keys.len() > cap;
        keys.truncate(cap);
        (keys.into_iter().collect(), over_limit)
    }

    fn untracked_candidates(
        &self,
        pattern: &FuzzyPattern,
        tracked: &BTreeSet<ServiceKey>,
        deleted: &ServiceKey,
    ) -> Vec<ServiceKey> {
        self.matching_catalog_keys(pattern)
            .into_iter()
            .filter(|key| key != deleted && !tracked.contains(key))
            .collect()
    }
}
