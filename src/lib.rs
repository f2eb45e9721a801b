//! Pattern based (fuzzy) service watch for a service registry.
//!
//! A client subscribes to a wildcard pattern over (namespace, group, service
//! name) and receives an eventually consistent, incrementally updated view of
//! the concrete services that match it. The server keeps the authoritative
//! pattern -> matched key index, enforces the pattern count and matched
//! service caps, and streams deltas to subscribed clients.
//!
//! ```text
//! ClientWatchRegistry --WatchRegister--> RemoteWatchGateway --> FuzzyWatchPushService
//!        ^                                                           |
//!        |               InitNotify* FinishInitNotify                |
//!        +---- ServerPushSink <---- ClientPusher <-------------------+
//!                        ChangeNotify / LoadEvent        ServerPatternIndex
//! ```

mod client;
mod config;
pub mod constants;
mod errors;
mod naming;
mod network;
mod pattern;
pub mod proto;
mod server;
pub(crate) mod utils;

pub use client::*;
pub use config::*;
pub use errors::*;
pub use naming::*;
pub use network::*;
pub use pattern::*;
pub use server::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
