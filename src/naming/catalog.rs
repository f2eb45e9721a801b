use std::collections::BTreeSet;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use super::CatalogEvent;
use super::Service;
use super::ServiceCatalog;
use super::ServiceChangeType;

/// In-process catalog: namespace -> services.
///
/// Used in embedded deployments and tests. Every effective mutation is
/// optionally published as a [`CatalogEvent`].
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    namespaces: DashMap<String, BTreeSet<Service>>,
    event_sink: Option<mpsc::UnboundedSender<CatalogEvent>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_sink(event_sink: mpsc::UnboundedSender<CatalogEvent>) -> Self {
        Self {
            namespaces: DashMap::new(),
            event_sink: Some(event_sink),
        }
    }

    /// Returns `true` if the service was not registered before.
    ///
    /// Events are published while the namespace is still locked, so they
    /// leave in the order the mutations were applied.
    pub fn register(
        &self,
        service: Service,
    ) -> bool {
        let mut services = self.namespaces.entry(service.namespace.clone()).or_default();
        if !services.insert(service.clone()) {
            return false;
        }
        debug!(service = %service.key(), "service registered");
        self.publish(service, ServiceChangeType::AddService);
        true
    }

    /// Returns `true` if the service was registered before.
    pub fn deregister(
        &self,
        service: &Service,
    ) -> bool {
        let Some(mut services) = self.namespaces.get_mut(&service.namespace) else {
            return false;
        };
        if !services.remove(service) {
            return false;
        }
        debug!(service = %service.key(), "service deregistered");
        self.publish(service.clone(), ServiceChangeType::DeleteService);
        true
    }

    /// Reports an instance level change of an already registered service.
    pub fn touch(
        &self,
        service: &Service,
    ) {
        if self.contains(service) {
            self.publish(service.clone(), ServiceChangeType::InstanceChanged);
        }
    }

    pub fn contains(
        &self,
        service: &Service,
    ) -> bool {
        self.namespaces
            .get(&service.namespace)
            .map(|services| services.contains(service))
            .unwrap_or(false)
    }

    pub fn service_count(
        &self,
        namespace: &str,
    ) -> usize {
        self.namespaces.get(namespace).map(|s| s.len()).unwrap_or(0)
    }

    fn publish(
        &self,
        service: Service,
        change_type: ServiceChangeType,
    ) {
        if let Some(sink) = &self.event_sink {
            if sink.send(CatalogEvent { service, change_type }).is_err() {
                warn!("catalog event receiver dropped, mutation event lost");
            }
        }
    }
}

impl ServiceCatalog for InMemoryCatalog {
    fn services(
        &self,
        namespace: &str,
    ) -> Vec<Service> {
        self.namespaces
            .get(namespace)
            .map(|services| services.iter().cloned().collect())
            .unwrap_or_default()
    }
}
