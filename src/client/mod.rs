//! Client side of the fuzzy watch subsystem.
//!
//! - [`ClientWatchRegistry`] - per process manager: pattern -> context,
//!   registration, notify worker and background resync loop
//! - [`ClientWatchContext`] - state of one pattern
//! - [`FuzzyWatchEventWatcher`] - user callbacks
//! - [`BootstrapFuture`] - first consistent snapshot of a pattern
//!
//! # Basic Usage
//! ```no_run
//! use std::sync::Arc;
//!
//! use d_registry::ClientWatchRegistry;
//! use d_registry::FuzzyPattern;
//! use d_registry::FuzzyWatchChangeEvent;
//! use d_registry::FuzzyWatchClientConfig;
//! use d_registry::FuzzyWatchEventWatcher;
//! use d_registry::RemoteWatchGateway;
//! use d_registry::WatcherError;
//!
//! struct Printer;
//!
//! impl FuzzyWatchEventWatcher for Printer {
//!     fn on_event(&self, event: &FuzzyWatchChangeEvent) -> Result<(), WatcherError> {
//!         println!("{:?} {}", event.changed_type, event.service_name);
//!         Ok(())
//!     }
//! }
//!
//! async fn watch<G: RemoteWatchGateway>(gateway: G) -> d_registry::Result<()> {
//!     let registry = Arc::new(ClientWatchRegistry::new(gateway, FuzzyWatchClientConfig::default()));
//!     registry.start();
//!
//!     let pattern = FuzzyPattern::generate("order-*", "DEFAULT_GROUP", "public");
//!     let bootstrap = registry.watch_with_service_keys(pattern, Arc::new(Printer)).await?;
//!     let snapshot = bootstrap.wait_timeout(std::time::Duration::from_secs(3)).await?;
//!     println!("{} services matched", snapshot.len());
//!     Ok(())
//! }
//! ```

mod bootstrap;
mod context;
mod registry;
mod watcher;

pub use bootstrap::BootstrapFuture;
pub use context::*;
pub use registry::*;
pub use watcher::FuzzyWatchChangeEvent;
pub use watcher::FuzzyWatchEventWatcher;
pub use watcher::SyncType;
