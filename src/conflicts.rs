/// Cross-project port conflict detection
///
/// Runs over the whole project set at once. Two passes are unioned:
/// - local: ports resolved by two or more projects
/// - registry: ports the registry reports for two or more distinct projects, marked on
///   every local project whose resolved ports include that port
///
/// Only cross-project collisions count; every reported port names at least two projects.
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use crate::ports::resolve_with;
use crate::project::{ProjectDescriptor, ProjectSet};
use crate::registry::{RegistryClient, RegistrySnapshot};

/// port -> names of the projects fighting over it
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ConflictMap {
    ports: BTreeMap<u16, BTreeSet<String>>,
}

impl ConflictMap {
    fn from_claims(claims: BTreeMap<u16, BTreeSet<String>>) -> Self {
        Self {
            ports: claims.into_iter().filter(|(_, owners)| owners.len() >= 2).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn get(&self, port: u16) -> Option<&BTreeSet<String>> {
        self.ports.get(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u16, &BTreeSet<String>)> {
        self.ports.iter()
    }

    /// The conflicts touching any of `ports`
    pub fn for_ports(&self, ports: &[u16]) -> BTreeMap<u16, Vec<String>> {
        ports
            .iter()
            .filter_map(|port| {
                self.ports
                    .get(port)
                    .map(|owners| (*port, owners.iter().cloned().collect()))
            })
            .collect()
    }

    /// Other projects sharing `port` with `name`
    pub fn rivals(&self, port: u16, name: &str) -> Vec<String> {
        self.ports
            .get(&port)
            .map(|owners| owners.iter().filter(|o| o.as_str() != name).cloned().collect())
            .unwrap_or_default()
    }
}

/// Pure detection against an already-fetched registry listing
pub fn detect_with(projects: &ProjectSet, registry: &RegistrySnapshot) -> ConflictMap {
    let resolved: Vec<(&ProjectDescriptor, Vec<u16>)> = projects
        .iter()
        .map(|descriptor| (descriptor, resolve_with(descriptor, registry)))
        .collect();

    let mut claims: BTreeMap<u16, BTreeSet<String>> = BTreeMap::new();
    for (descriptor, ports) in &resolved {
        for port in ports {
            claims.entry(*port).or_default().insert(descriptor.name.clone());
        }
    }

    for (port, owners) in registry.owners_by_port() {
        if owners.len() < 2 {
            continue;
        }
        debug!("Registry lists :{} for {} projects", port, owners.len());
        for (descriptor, ports) in &resolved {
            if ports.contains(&port) {
                claims.entry(port).or_default().insert(descriptor.name.clone());
            }
        }
    }

    ConflictMap::from_claims(claims)
}

pub struct ConflictDetector {
    registry: Arc<RegistryClient>,
}

impl ConflictDetector {
    pub fn new(registry: Arc<RegistryClient>) -> Self {
        Self { registry }
    }

    /// One registry fetch, then a full cross-project pass
    pub async fn detect(&self, projects: &ProjectSet) -> ConflictMap {
        let registry = self.registry.fetch().await;
        detect_with(projects, &registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::{entry, registry_with, FakeTransport, ManualClock};
    use std::time::Duration;

    fn names(map: &ConflictMap, port: u16) -> Vec<&str> {
        map.get(port)
            .map(|owners| owners.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_shared_port_is_a_conflict() {
        let projects = ProjectSet::new([
            ProjectDescriptor::new("a").with_ports([3000]),
            ProjectDescriptor::new("b").with_ports([3000, 4000]),
        ]);
        let map = detect_with(&projects, &RegistrySnapshot::default());
        assert_eq!(names(&map, 3000), vec!["a", "b"]);
        assert!(map.get(4000).is_none());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_single_owner_is_not_a_conflict() {
        let projects = ProjectSet::new([
            ProjectDescriptor::new("a").with_ports([3000]),
            ProjectDescriptor::new("b").with_ports([4000]),
        ]);
        assert!(detect_with(&projects, &RegistrySnapshot::default()).is_empty());
    }

    #[test]
    fn test_project_never_conflicts_with_itself() {
        let projects = ProjectSet::new([ProjectDescriptor::new("shop").with_services(["web", "admin"])]);
        let registry = registry_with([("web", entry(3000, "shop")), ("admin", entry(3000, "shop"))]);
        assert!(detect_with(&projects, &registry).is_empty());
    }

    #[test]
    fn test_registry_ports_replace_config_ports() {
        // Both configure 3000, but the registry moved b's service elsewhere
        let projects = ProjectSet::new([
            ProjectDescriptor::new("a").with_ports([3000]),
            ProjectDescriptor::new("b").with_ports([3000]).with_services(["b-web"]),
        ]);
        let registry = registry_with([("b-web", entry(3100, "b"))]);
        assert!(detect_with(&projects, &registry).is_empty());
    }

    #[test]
    fn test_registry_cross_check_catches_raw_port() {
        let projects = ProjectSet::new([
            ProjectDescriptor::new("alpha").with_services(["a-web"]),
            ProjectDescriptor::new("gamma").with_ports([3000]),
        ]);
        let registry = registry_with([("a-web", entry(3000, "alpha")), ("b-web", entry(3000, "beta"))]);
        let map = detect_with(&projects, &registry);
        assert_eq!(names(&map, 3000), vec!["alpha", "gamma"]);
    }

    #[test]
    fn test_moved_service_leaves_its_old_port() {
        // a still configures 3000, but its service now lives on 3100
        let projects = ProjectSet::new([
            ProjectDescriptor::new("a").with_ports([3000]).with_services(["a-web"]),
            ProjectDescriptor::new("b").with_ports([3000]),
        ]);
        let registry = registry_with([
            ("a-web", entry(3100, "a")),
            ("x-web", entry(3000, "x")),
            ("y-web", entry(3000, "y")),
        ]);
        assert!(detect_with(&projects, &registry).is_empty());
    }

    #[test]
    fn test_unlisted_services_claim_no_registry_port() {
        // g-web isn't registered, so gamma resolves nothing despite its configured 3000
        let projects = ProjectSet::new([
            ProjectDescriptor::new("alpha").with_services(["a-web"]),
            ProjectDescriptor::new("gamma").with_ports([3000]).with_services(["g-web"]),
        ]);
        let registry = registry_with([("a-web", entry(3000, "alpha")), ("b-web", entry(3000, "beta"))]);
        assert!(detect_with(&projects, &registry).is_empty());
    }

    #[test]
    fn test_registry_conflict_with_one_local_project_is_dropped() {
        let projects = ProjectSet::new([ProjectDescriptor::new("alpha").with_services(["a-web"])]);
        let registry = registry_with([("a-web", entry(3000, "alpha")), ("b-web", entry(3000, "beta"))]);
        assert!(detect_with(&projects, &registry).is_empty());
    }

    #[test]
    fn test_for_ports_and_rivals() {
        let projects = ProjectSet::new([
            ProjectDescriptor::new("a").with_ports([3000, 5000]),
            ProjectDescriptor::new("b").with_ports([3000]),
            ProjectDescriptor::new("c").with_ports([5000]),
        ]);
        let map = detect_with(&projects, &RegistrySnapshot::default());
        let subset = map.for_ports(&[3000, 8080]);
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[&3000], vec!["a".to_string(), "b".to_string()]);
        assert_eq!(map.rivals(5000, "a"), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_detect_fetches_registry_once() {
        let transport = Arc::new(FakeTransport::new(registry_with([
            ("a-web", entry(3000, "a")),
            ("b-web", entry(3000, "b")),
        ])));
        let client = RegistryClient::new(
            transport.clone(),
            Arc::new(ManualClock::new()),
            Duration::from_secs(5),
            Duration::from_millis(200),
        );
        let detector = ConflictDetector::new(Arc::new(client));
        let projects = ProjectSet::new([
            ProjectDescriptor::new("a").with_services(["a-web"]),
            ProjectDescriptor::new("b").with_services(["b-web"]),
        ]);
        let map = detector.detect(&projects).await;
        assert_eq!(names(&map, 3000), vec!["a", "b"]);
        assert_eq!(transport.list_calls(), 1);
    }
}
