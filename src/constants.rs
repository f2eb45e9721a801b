// -
// Pattern and key layout

/// Namespace used when a pattern or service leaves it blank
pub const DEFAULT_NAMESPACE: &str = "public";

/// Wildcard marker. Alone it matches a whole segment, as a suffix it matches by prefix.
pub const ANY_PATTERN: &str = "*";
pub(crate) const WILDCARD: char = '*';

/// `{namespace}>>{group}@@{service}`
pub(crate) const NAMESPACE_PATTERN_SPLITTER: &str = ">>";

/// Joins group and service in patterns and all three segments in service keys
pub(crate) const SERVICE_INFO_SPLITTER: &str = "@@";

// -
// Fuzzy watch error codes (wire values)

pub(crate) const FUZZY_WATCH_PATTERN_OVER_LIMIT_CODE: u16 = 50310;
pub(crate) const FUZZY_WATCH_PATTERN_MATCH_COUNT_OVER_LIMIT_CODE: u16 = 50311;
pub(crate) const FUZZY_WATCH_NOT_IMPLEMENTED_CODE: u16 = 501;
