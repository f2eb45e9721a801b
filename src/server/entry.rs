use std::collections::BTreeSet;
use std::collections::HashSet;
use std::fmt;

use parking_lot::Mutex;

use crate::FuzzyPattern;
use crate::ServiceKey;

/// Result of applying an ADD to one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddOutcome {
    Inserted,
    AlreadyMember,
    /// Entry is full; `newly` is set on the within-cap -> over-cap transition
    OverLimit { newly: bool },
}

/// Result of applying a DELETE to one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DeleteOutcome {
    pub(crate) removed: bool,
    pub(crate) backfilled: Option<ServiceKey>,
}

#[derive(Debug, Default)]
struct EntryState {
    matched: BTreeSet<ServiceKey>,
    subscribers: HashSet<String>,
    over_limit: bool,
    empty_sweeps: u32,
    /// Set once the entry left the index; it accepts no more subscribers
    removed: bool,
}

/// Server side state of one pattern.
///
/// Every read and write of the matched set goes through the same lock, so
/// membership checks never observe a stale set.
pub struct ServerPatternEntry {
    pattern: FuzzyPattern,
    state: Mutex<EntryState>,
}

impl fmt::Debug for ServerPatternEntry {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ServerPatternEntry")
            .field("pattern", &self.pattern.to_string())
            .field("matched", &state.matched.len())
            .field("subscribers", &state.subscribers.len())
            .field("over_limit", &state.over_limit)
            .finish()
    }
}

impl ServerPatternEntry {
    pub(crate) fn new(pattern: FuzzyPattern) -> Self {
        Self {
            pattern,
            state: Mutex::new(EntryState::default()),
        }
    }

    /// Runs `publish` and then fills the matched set from `scan`, both under
    /// the entry lock. A mutation that finds the published entry waits for
    /// the scan and applies on top of it. Returns the matched count and the
    /// over-cap flag.
    pub(crate) fn populate<P, S>(
        &self,
        publish: P,
        scan: S,
    ) -> (usize, bool)
    where
        P: FnOnce(),
        S: FnOnce() -> (BTreeSet<ServiceKey>, bool),
    {
        let mut state = self.state.lock();
        publish();
        let (matched, over_limit) = scan();
        state.matched = matched;
        state.over_limit = over_limit;
        (state.matched.len(), state.over_limit)
    }

    pub fn pattern(&self) -> &FuzzyPattern {
        &self.pattern
    }

    pub fn matched_keys(&self) -> BTreeSet<ServiceKey> {
        self.state.lock().matched.clone()
    }

    pub fn matched_count(&self) -> usize {
        self.state.lock().matched.len()
    }

    pub fn contains(
        &self,
        key: &ServiceKey,
    ) -> bool {
        self.state.lock().matched.contains(key)
    }

    pub fn is_over_limit(&self) -> bool {
        self.state.lock().over_limit
    }

    pub fn subscribers(&self) -> HashSet<String> {
        self.state.lock().subscribers.clone()
    }

    pub fn has_subscriber(
        &self,
        client_id: &str,
    ) -> bool {
        self.state.lock().subscribers.contains(client_id)
    }

    /// Adds a subscriber. Fails only if the entry was already removed from the index.
    pub(crate) fn try_add_subscriber(
        &self,
        client_id: &str,
    ) -> bool {
        let mut state = self.state.lock();
        if state.removed {
            return false;
        }
        state.subscribers.insert(client_id.to_string());
        state.empty_sweeps = 0;
        true
    }

    pub(crate) fn remove_subscriber(
        &self,
        client_id: &str,
    ) -> bool {
        self.state.lock().subscribers.remove(client_id)
    }

    pub(crate) fn apply_add(
        &self,
        key: &ServiceKey,
        cap: usize,
    ) -> AddOutcome {
        let mut state = self.state.lock();
        if state.matched.contains(key) {
            return AddOutcome::AlreadyMember;
        }
        if state.matched.len() >= cap {
            let newly = !state.over_limit;
            state.over_limit = true;
            return AddOutcome::OverLimit { newly };
        }
        state.matched.insert(key.clone());
        AddOutcome::Inserted
    }

    /// Removes `key`. When the entry was over cap, one untracked candidate
    /// (first of `find_candidates`) is backfilled; the over-cap flag clears
    /// once no further candidate remains.
    pub(crate) fn apply_delete<F>(
        &self,
        key: &ServiceKey,
        cap: usize,
        find_candidates: F,
    ) -> DeleteOutcome
    where
        F: FnOnce(&FuzzyPattern, &BTreeSet<ServiceKey>) -> Vec<ServiceKey>,
    {
        let mut state = self.state.lock();
        if !state.matched.remove(key) {
            return DeleteOutcome::default();
        }

        let mut outcome = DeleteOutcome {
            removed: true,
            backfilled: None,
        };
        if state.over_limit && state.matched.len() < cap {
            let mut candidates = find_candidates(&self.pattern, &state.matched).into_iter();
            if let Some(candidate) = candidates.next() {
                state.matched.insert(candidate.clone());
                outcome.backfilled = Some(candidate);
            }
            state.over_limit = candidates.next().is_some();
        }
        outcome
    }

    /// Records one trim sweep. Returns the consecutive sweeps that found no subscriber.
    pub(crate) fn observe_sweep(&self) -> u32 {
        let mut state = self.state.lock();
        if state.subscribers.is_empty() {
            state.empty_sweeps += 1;
        } else {
            state.empty_sweeps = 0;
        }
        state.empty_sweeps
    }

    /// Marks the entry removed if it still has no subscriber.
    pub(crate) fn try_mark_removed(&self) -> bool {
        let mut state = self.state.lock();
        if !state.subscribers.is_empty() {
            return false;
        }
        state.removed = true;
        true
    }
}
