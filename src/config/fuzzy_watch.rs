use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Client side fuzzy watch settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FuzzyWatchClientConfig {
    /// Period of the background resync loop (milliseconds)
    #[serde(default = "default_resync_interval_ms")]
    pub resync_interval_ms: u64,

    /// Period after which consistent contexts are registered again with their
    /// received keys, repairing changes lost on the wire (milliseconds)
    #[serde(default = "default_full_sync_interval_ms")]
    pub full_sync_interval_ms: u64,

    /// Delay before re-ringing the resync bell after a transport failure (milliseconds)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Timeout of a single registration round trip (milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How many times a failed watcher delivery is retried by the resync pass
    /// before the item is treated as delivered
    #[serde(default = "default_watcher_retry_limit")]
    pub watcher_retry_limit: u32,

    /// Consecutive sweeps a context must be observed without watchers before removal
    #[serde(default = "default_empty_sweeps_before_removal")]
    pub empty_sweeps_before_removal: u32,
}

impl Default for FuzzyWatchClientConfig {
    fn default() -> Self {
        Self {
            resync_interval_ms: default_resync_interval_ms(),
            full_sync_interval_ms: default_full_sync_interval_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            watcher_retry_limit: default_watcher_retry_limit(),
            empty_sweeps_before_removal: default_empty_sweeps_before_removal(),
        }
    }
}

impl FuzzyWatchClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.resync_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "client.resync_interval_ms cannot be 0".into(),
            )));
        }
        if self.full_sync_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "client.full_sync_interval_ms cannot be 0".into(),
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "client.request_timeout_ms cannot be 0".into(),
            )));
        }
        if self.empty_sweeps_before_removal == 0 {
            return Err(Error::Config(ConfigError::Message(
                "client.empty_sweeps_before_removal must be at least 1".into(),
            )));
        }
        Ok(())
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    pub fn full_sync_interval(&self) -> Duration {
        Duration::from_millis(self.full_sync_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_resync_interval_ms() -> u64 {
    5_000
}
fn default_full_sync_interval_ms() -> u64 {
    180_000
}
fn default_retry_delay_ms() -> u64 {
    1_000
}
fn default_request_timeout_ms() -> u64 {
    3_000
}
fn default_watcher_retry_limit() -> u32 {
    1
}
fn default_empty_sweeps_before_removal() -> u32 {
    2
}

/// Server side fuzzy watch settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FuzzyWatchServerConfig {
    /// Maximum number of active patterns per namespace
    #[serde(default = "default_max_pattern_count")]
    pub max_pattern_count: usize,

    /// Maximum number of keys tracked by one pattern
    #[serde(default = "default_max_matched_service_count")]
    pub max_matched_service_count: usize,

    /// Period of the trim sweep (milliseconds)
    #[serde(default = "default_trim_interval_ms")]
    pub trim_interval_ms: u64,

    /// Consecutive sweeps an entry must be observed without subscribers before removal
    #[serde(default = "default_empty_sweeps_before_removal")]
    pub empty_sweeps_before_removal: u32,

    /// Keys per InitNotify message
    #[serde(default = "default_init_notify_batch_size")]
    pub init_notify_batch_size: usize,

    /// Timeout of a single push to a client (milliseconds)
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
}

impl Default for FuzzyWatchServerConfig {
    fn default() -> Self {
        Self {
            max_pattern_count: default_max_pattern_count(),
            max_matched_service_count: default_max_matched_service_count(),
            trim_interval_ms: default_trim_interval_ms(),
            empty_sweeps_before_removal: default_empty_sweeps_before_removal(),
            init_notify_batch_size: default_init_notify_batch_size(),
            push_timeout_ms: default_push_timeout_ms(),
        }
    }
}

impl FuzzyWatchServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_pattern_count == 0 {
            return Err(Error::Config(ConfigError::Message(
                "server.max_pattern_count must be greater than 0".into(),
            )));
        }
        if self.max_matched_service_count == 0 {
            return Err(Error::Config(ConfigError::Message(
                "server.max_matched_service_count must be greater than 0".into(),
            )));
        }
        if self.trim_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "server.trim_interval_ms cannot be 0".into(),
            )));
        }
        if self.empty_sweeps_before_removal == 0 {
            return Err(Error::Config(ConfigError::Message(
                "server.empty_sweeps_before_removal must be at least 1".into(),
            )));
        }
        if self.init_notify_batch_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "server.init_notify_batch_size must be greater than 0".into(),
            )));
        }
        Ok(())
    }

    pub fn trim_interval(&self) -> Duration {
        Duration::from_millis(self.trim_interval_ms)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }
}

fn default_max_pattern_count() -> usize {
    20
}
fn default_max_matched_service_count() -> usize {
    500
}
// in ms
fn default_trim_interval_ms() -> u64 {
    30_000
}
fn default_init_notify_batch_size() -> usize {
    10
}
fn default_push_timeout_ms() -> u64 {
    3_000
}
