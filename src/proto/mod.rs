//! Conceptual message shapes exchanged with the transport collaborator.
//!
//! Byte level encoding is owned by the transport; these types only carry
//! serde derives so any codec can move them.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::constants::FUZZY_WATCH_NOT_IMPLEMENTED_CODE;
use crate::constants::FUZZY_WATCH_PATTERN_MATCH_COUNT_OVER_LIMIT_CODE;
use crate::constants::FUZZY_WATCH_PATTERN_OVER_LIMIT_CODE;
use crate::FuzzyPattern;
use crate::ServiceKey;

/// Capabilities a server may advertise during connection setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbilityKey {
    ServerFuzzyWatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchType {
    Watch,
    CancelWatch,
}

/// Client -> server registration (or cancellation) of one pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRegister {
    pub pattern: FuzzyPattern,
    pub watch_type: WatchType,
    /// Keys the client already holds; the server only streams the difference
    pub received_keys: BTreeSet<ServiceKey>,
    /// `true` until the first bootstrap of the pattern completed on the client
    pub initializing: bool,
}

impl WatchRegister {
    pub fn watch(pattern: FuzzyPattern) -> Self {
        Self {
            pattern,
            watch_type: WatchType::Watch,
            received_keys: BTreeSet::new(),
            initializing: true,
        }
    }

    pub fn cancel(pattern: FuzzyPattern) -> Self {
        Self {
            pattern,
            watch_type: WatchType::CancelWatch,
            received_keys: BTreeSet::new(),
            initializing: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FuzzyWatchErrorCode {
    /// Namespace already holds the maximum number of patterns
    PatternOverLimit,
    /// Pattern matches more services than the server tracks
    ServiceOverLimit,
    /// Server does not implement fuzzy watch
    Unsupported,
}

impl FuzzyWatchErrorCode {
    /// Numeric code of the error on the wire
    pub fn code(&self) -> u16 {
        match self {
            FuzzyWatchErrorCode::PatternOverLimit => FUZZY_WATCH_PATTERN_OVER_LIMIT_CODE,
            FuzzyWatchErrorCode::ServiceOverLimit => FUZZY_WATCH_PATTERN_MATCH_COUNT_OVER_LIMIT_CODE,
            FuzzyWatchErrorCode::Unsupported => FUZZY_WATCH_NOT_IMPLEMENTED_CODE,
        }
    }

    pub fn is_over_limit(&self) -> bool {
        matches!(
            self,
            FuzzyWatchErrorCode::PatternOverLimit | FuzzyWatchErrorCode::ServiceOverLimit
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRegisterAck {
    pub error: Option<FuzzyWatchErrorCode>,
}

impl WatchRegisterAck {
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn error(code: FuzzyWatchErrorCode) -> Self {
        Self { error: Some(code) }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangedType {
    Add,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyItem {
    pub key: ServiceKey,
    pub changed_type: ChangedType,
}

impl NotifyItem {
    pub fn add(key: ServiceKey) -> Self {
        Self {
            key,
            changed_type: ChangedType::Add,
        }
    }
}

/// Server -> client push messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerPush {
    /// One batch of the bootstrap snapshot; items are all `Add`
    InitNotify {
        pattern: FuzzyPattern,
        items: Vec<NotifyItem>,
    },
    /// Closes the bootstrap; exactly one per registration
    FinishInitNotify { pattern: FuzzyPattern },
    /// Incremental delta, only after `FinishInitNotify`.
    /// Without a pattern the client routes the key to every matching context.
    ChangeNotify {
        pattern: Option<FuzzyPattern>,
        key: ServiceKey,
        changed_type: ChangedType,
    },
    /// Asynchronous capacity report, not correlated to a request
    LoadEvent {
        pattern: FuzzyPattern,
        code: FuzzyWatchErrorCode,
    },
}

impl ServerPush {
    pub fn pattern(&self) -> Option<&FuzzyPattern> {
        match self {
            ServerPush::InitNotify { pattern, .. }
            | ServerPush::FinishInitNotify { pattern }
            | ServerPush::LoadEvent { pattern, .. } => Some(pattern),
            ServerPush::ChangeNotify { pattern, .. } => pattern.as_ref(),
        }
    }
}
