use std::collections::BTreeSet;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::FuzzyPattern;
use crate::FuzzyWatchServerConfig;
use crate::InMemoryCatalog;
use crate::ServerPatternIndex;
use crate::Service;
use crate::ServiceKey;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
    println!("setup logger for unit test.");
}

pub fn key(
    group: &str,
    name: &str,
) -> ServiceKey {
    ServiceKey::new("public", group, name)
}

pub fn keys(names: &[&str]) -> BTreeSet<ServiceKey> {
    names.iter().map(|n| key("DEFAULT_GROUP", n)).collect()
}

pub fn service(name: &str) -> Service {
    Service::new("public", "DEFAULT_GROUP", name)
}

pub fn pattern(service_pattern: &str) -> FuzzyPattern {
    FuzzyPattern::generate(service_pattern, "DEFAULT_GROUP", "public")
}

/// Catalog holding `names` in `public/DEFAULT_GROUP`.
pub fn catalog_with(names: &[&str]) -> Arc<InMemoryCatalog> {
    let catalog = InMemoryCatalog::new();
    for name in names {
        catalog.register(service(name));
    }
    Arc::new(catalog)
}

pub fn server_config(
    max_pattern_count: usize,
    max_matched_service_count: usize,
) -> FuzzyWatchServerConfig {
    FuzzyWatchServerConfig {
        max_pattern_count,
        max_matched_service_count,
        ..Default::default()
    }
}

pub fn index_with(
    catalog: Arc<InMemoryCatalog>,
    config: FuzzyWatchServerConfig,
) -> ServerPatternIndex {
    ServerPatternIndex::new(catalog, config)
}
