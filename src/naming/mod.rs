//! Service catalog collaborator.
//!
//! The authoritative catalog is owned by the replication layer; the fuzzy
//! watch subsystem only reads it (to seed a new pattern) and consumes the
//! mutation events it produces.

mod catalog;
pub use catalog::*;


#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_NAMESPACE;
use crate::ServiceKey;

/// A concrete service in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Service {
    pub namespace: String,
    pub group: String,
    pub name: String,
}

impl Service {
    pub fn new(
        namespace: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            namespace: if namespace.is_empty() {
                DEFAULT_NAMESPACE.to_string()
            } else {
                namespace
            },
            group: group.into(),
            name: name.into(),
        }
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.namespace.clone(), self.group.clone(), self.name.clone())
    }
}

impl From<&ServiceKey> for Service {
    fn from(key: &ServiceKey) -> Self {
        Service::new(key.namespace.clone(), key.group.clone(), key.name.clone())
    }
}

/// Kind of catalog mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceChangeType {
    AddService,
    DeleteService,
    /// Instances of an existing service changed; service membership is untouched
    InstanceChanged,
}

/// Mutation event produced by the catalog (replication) layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEvent {
    pub service: Service,
    pub change_type: ServiceChangeType,
}

#[cfg_attr(test, automock)]
pub trait ServiceCatalog: Send + Sync + 'static {
    /// All services currently registered in `namespace`, in no particular order.
    fn services(
        &self,
        namespace: &str,
    ) -> Vec<Service>;
}
