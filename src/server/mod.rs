//! Server side of the fuzzy watch subsystem.
//!
//! [`ServerPatternIndex`] owns the pattern -> matched key mapping and its
//! admission caps; [`FuzzyWatchPushService`] drives bootstrap streams and
//! change fan-out on top of it.
//!
//! Entry lifecycle:
//!
//! ```text
//! UNINITIALIZED -> ACTIVE{within-cap | over-cap} -> REMOVED
//!                  (init_watch_match_service)      (consecutive empty trim sweeps)
//! ```

mod entry;
mod index;
mod push;

pub use entry::ServerPatternEntry;
pub use index::*;
pub use push::*;
