//! Wildcard patterns over (namespace, group, service name).
//!
//! A [`FuzzyPattern`] keeps the namespace exact and lets the group and service
//! segments end in `*` to match by prefix. Its canonical string form,
//! `{namespace}>>{group}@@{service}`, is the identity used by both the client
//! registry and the server index.
//!
//! A [`ServiceKey`] is the concrete identity of one service, rendered as
//! `{namespace}@@{group}@@{service}`.


use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::constants::ANY_PATTERN;
use crate::constants::DEFAULT_NAMESPACE;
use crate::constants::NAMESPACE_PATTERN_SPLITTER;
use crate::constants::SERVICE_INFO_SPLITTER;
use crate::constants::WILDCARD;
use crate::WatchError;

/// Normalized wildcard triple. Immutable once generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FuzzyPattern {
    namespace: String,
    group_pattern: String,
    service_pattern: String,
}

impl FuzzyPattern {
    /// Normalizes the input into a canonical pattern.
    ///
    /// - blank namespace becomes [`DEFAULT_NAMESPACE`]
    /// - blank group or service pattern becomes `*`
    /// - repeated trailing `*` collapse into one
    pub fn generate(
        service_pattern: &str,
        group_pattern: &str,
        namespace: &str,
    ) -> Self {
        let namespace = namespace.trim();
        Self {
            namespace: if namespace.is_empty() {
                DEFAULT_NAMESPACE.to_string()
            } else {
                namespace.to_string()
            },
            group_pattern: normalize_segment(group_pattern),
            service_pattern: normalize_segment(service_pattern),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn group_pattern(&self) -> &str {
        &self.group_pattern
    }

    pub fn service_pattern(&self) -> &str {
        &self.service_pattern
    }

    /// Exact namespace, prefix-or-exact group and service.
    pub fn matches(
        &self,
        key: &ServiceKey,
    ) -> bool {
        self.matches_parts(&key.namespace, &key.group, &key.name)
    }

    pub fn matches_parts(
        &self,
        namespace: &str,
        group: &str,
        service_name: &str,
    ) -> bool {
        self.namespace == namespace
            && segment_matches(&self.group_pattern, group)
            && segment_matches(&self.service_pattern, service_name)
    }
}

impl fmt::Display for FuzzyPattern {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}{}",
            self.namespace,
            NAMESPACE_PATTERN_SPLITTER,
            self.group_pattern,
            SERVICE_INFO_SPLITTER,
            self.service_pattern
        )
    }
}

impl FromStr for FuzzyPattern {
    type Err = WatchError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (namespace, rest) = s
            .split_once(NAMESPACE_PATTERN_SPLITTER)
            .ok_or_else(|| WatchError::InvalidPattern(s.to_string()))?;
        let (group, service) = rest
            .split_once(SERVICE_INFO_SPLITTER)
            .ok_or_else(|| WatchError::InvalidPattern(s.to_string()))?;
        Ok(Self::generate(service, group, namespace))
    }
}

fn normalize_segment(segment: &str) -> String {
    let segment = segment.trim();
    if segment.is_empty() {
        return ANY_PATTERN.to_string();
    }
    let stem = segment.trim_end_matches(WILDCARD);
    if stem.len() == segment.len() {
        segment.to_string()
    } else {
        format!("{}{}", stem, WILDCARD)
    }
}

fn segment_matches(
    pattern: &str,
    value: &str,
) -> bool {
    match pattern.strip_suffix(WILDCARD) {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

/// Canonical identity of one concrete service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub namespace: String,
    pub group: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(
        namespace: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            group: group.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}{}",
            self.namespace, SERVICE_INFO_SPLITTER, self.group, SERVICE_INFO_SPLITTER, self.name
        )
    }
}

impl FromStr for ServiceKey {
    type Err = WatchError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.splitn(3, SERVICE_INFO_SPLITTER);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(namespace), Some(group), Some(name))
                if !namespace.is_empty() && !group.is_empty() && !name.is_empty() =>
            {
                Ok(Self::new(namespace, group, name))
            }
            _ => Err(WatchError::InvalidServiceKey(s.to_string())),
        }
    }
}

/// One side of a key set difference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyState {
    pub key: ServiceKey,
    /// `true`: present in the authoritative set only; `false`: present in the synced set only
    pub exists: bool,
}

/// Keys that must be added to (`exists`) or removed from `synced` for it to equal `authoritative`.
pub fn diff_service_keys(
    authoritative: &BTreeSet<ServiceKey>,
    synced: &BTreeSet<ServiceKey>,
) -> Vec<KeyState> {
    let added = authoritative.difference(synced).map(|key| KeyState {
        key: key.clone(),
        exists: true,
    });
    let removed = synced.difference(authoritative).map(|key| KeyState {
        key: key.clone(),
        exists: false,
    });
    added.chain(removed).collect()
}
