/// Effective port list for a project
///
/// Live registry data wins over the static config whenever the project names services
/// and the registry has anything to say. Order follows `services` (registry) or `ports`
/// (fallback) as declared; duplicates are left for callers to deal with.
use std::sync::Arc;

use crate::project::ProjectDescriptor;
use crate::registry::{RegistryClient, RegistrySnapshot};

/// Resolve against an already-fetched registry listing
pub fn resolve_with(descriptor: &ProjectDescriptor, registry: &RegistrySnapshot) -> Vec<u16> {
    if descriptor.service_names.is_empty() || registry.is_empty() {
        return descriptor.configured_ports.clone();
    }
    descriptor
        .service_names
        .iter()
        .filter_map(|service| registry.get(service).map(|entry| entry.port))
        .collect()
}

pub struct PortResolver {
    registry: Arc<RegistryClient>,
}

impl PortResolver {
    pub fn new(registry: Arc<RegistryClient>) -> Self {
        Self { registry }
    }

    pub async fn resolve(&self, descriptor: &ProjectDescriptor) -> Vec<u16> {
        // No services means the registry is irrelevant; don't touch it
        if descriptor.service_names.is_empty() {
            return descriptor.configured_ports.clone();
        }
        let registry = self.registry.fetch().await;
        resolve_with(descriptor, &registry)
    }
}
