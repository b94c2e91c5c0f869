/// Control plane state
/// Owns the pieces that live for the whole process:
/// - the registry client (its cache is the only shared mutable state)
/// - the status aggregator and process control built on top of it
/// - the descriptor store, re-read before every top-level operation

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::ControlConfig;
use crate::error::ControlResult;
use crate::process::{ProcessControl, RestartReport, StartReport, StopOutcome};
use crate::project::ProjectStore;
use crate::registry::RegistryClient;
use crate::snapshot::{SnapshotSource, SystemSnapshotSource};
use crate::status::{ProjectStatus, StatusAggregator};

/// Answer to a status query: one project, or all of them
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StatusReport {
    One(Box<ProjectStatus>),
    All(BTreeMap<String, ProjectStatus>),
}

/// Central control plane container
/// Built once per process by `run()`; every command goes through it
pub struct ControlPlane {
    store: ProjectStore,                    // projects.json, re-read per operation
    registry: Arc<RegistryClient>,          // Single shared registry cache slot
    aggregator: Arc<StatusAggregator>,      // Ports + snapshot + matching + conflicts
    control: ProcessControl,                // stop/start/restart on top of the aggregator
}

impl ControlPlane {
    /// Wire everything against the live OS and HTTP registry
    pub fn new(config: ControlConfig) -> Result<Self> {
        let registry = RegistryClient::http(
            &config.registry_url,
            config.registry_ttl(),
            config.registry_timeout(),
        )?;
        Ok(Self::with_parts(config, Arc::new(registry), Arc::new(SystemSnapshotSource)))
    }

    /// Wire against injected registry and snapshot sources
    /// The config only supplies timings, self name and the store location
    pub fn with_parts(
        config: ControlConfig,
        registry: Arc<RegistryClient>,
        source: Arc<dyn SnapshotSource>,
    ) -> Self {
        let aggregator = Arc::new(StatusAggregator::new(registry.clone(), source, &config.self_name));
        let control = ProcessControl::new(aggregator.clone(), &config);
        Self {
            store: ProjectStore::new(config.projects_file.clone()),
            registry,
            aggregator,
            control,
        }
    }

    pub async fn status(&self, name: Option<&str>) -> ControlResult<StatusReport> {
        let projects = self.store.load()?;
        match name {
            Some(name) => {
                let descriptor = projects.get(name)?;
                let status = self.aggregator.aggregate(descriptor, &projects).await;
                Ok(StatusReport::One(Box::new(status)))
            }
            None => Ok(StatusReport::All(self.aggregator.aggregate_all(&projects).await)),
        }
    }

    pub async fn stop(&self, name: &str) -> ControlResult<StopOutcome> {
        let projects = self.store.load()?;
        self.control.stop(projects.get(name)?).await
    }

    pub async fn start(&self, name: &str) -> ControlResult<StartReport> {
        let projects = self.store.load()?;
        self.control.start(projects.get(name)?, &projects).await
    }

    pub async fn restart(&self, name: &str) -> ControlResult<RestartReport> {
        let projects = self.store.load()?;
        self.control.restart(projects.get(name)?, &projects).await
    }

    /// Our own port for `service`, as granted by the registry (or `preferred`)
    pub async fn request_port(&self, service: &str, preferred: u16) -> u16 {
        self.registry
            .request_port(service, crate::app::REGISTRY_PROJECT, preferred)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControlError;
    use crate::registry::testing::{entry, registry_with, FakeTransport, ManualClock};
    use crate::snapshot::{ProcessRecord, ProcessSnapshot};
    use std::time::Duration;

    struct StaticSource(ProcessSnapshot);

    impl SnapshotSource for StaticSource {
        fn capture(&self) -> ProcessSnapshot {
            self.0.clone()
        }
    }

    fn plane(dir: &tempfile::TempDir, snapshot: ProcessSnapshot, transport: Arc<FakeTransport>) -> ControlPlane {
        let projects_file = dir.path().join("projects.json");
        std::fs::write(
            &projects_file,
            r#"{"projects": {
                "api": {"path": "/srv/api", "ports": [8080], "services": ["api-http"]},
                "blog": {"path": "/srv/blog", "ports": [9100]}
            }}"#,
        )
        .unwrap();
        let config = ControlConfig {
            projects_file,
            ..ControlConfig::default()
        };
        let registry = RegistryClient::new(
            transport,
            Arc::new(ManualClock::new()),
            Duration::from_secs(5),
            Duration::from_millis(200),
        );
        ControlPlane::with_parts(config, Arc::new(registry), Arc::new(StaticSource(snapshot)))
    }

    #[tokio::test]
    async fn test_status_all_and_one() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = ProcessSnapshot::default()
            .with_socket(9100, Some(5))
            .with_process(ProcessRecord::new(5).with_memory(2 * 1024 * 1024));
        let transport = Arc::new(FakeTransport::new(registry_with([("api-http", entry(9100, "api"))])));
        let plane = plane(&dir, snapshot, transport.clone());

        let StatusReport::All(all) = plane.status(None).await.unwrap() else {
            panic!("expected all projects");
        };
        assert_eq!(all.len(), 2);
        // The registry moved api onto blog's port
        assert_eq!(all["api"].ports, vec![9100]);
        assert_eq!(all["api"].conflicts[&9100], vec!["api".to_string(), "blog".to_string()]);
        assert!(all["blog"].running);

        let StatusReport::One(one) = plane.status(Some("blog")).await.unwrap() else {
            panic!("expected one project");
        };
        assert_eq!(one.name, "blog");
        assert_eq!(one.memory_mb, 2.0);
        // Both queries were served from one registry listing
        assert_eq!(transport.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_project() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(&dir, ProcessSnapshot::default(), Arc::new(FakeTransport::down()));
        assert!(matches!(plane.status(Some("nope")).await, Err(ControlError::ProjectNotFound(_))));
        assert!(matches!(plane.stop("nope").await, Err(ControlError::ProjectNotFound(_))));
    }

    #[tokio::test]
    async fn test_request_port_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let plane = plane(&dir, ProcessSnapshot::default(), Arc::new(FakeTransport::down()));
        assert_eq!(plane.request_port("pmctl", 7777).await, 7777);
    }
}
