/// Per-project status: one consistent read over ports, processes and conflicts
///
/// Every derived field of a status comes from a single resolved port list and a single
/// snapshot, so running/memory/open ports can't disagree with each other.
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error};

use crate::conflicts::{ConflictDetector, ConflictMap};
use crate::matcher::{MatchReasons, MatchedProcessSet, ProcessMatcher};
use crate::ports::PortResolver;
use crate::project::{ProjectDescriptor, ProjectSet};
use crate::registry::RegistryClient;
use crate::snapshot::{ProcessSnapshot, SnapshotSource};
use crate::tokens;

const CMDLINE_DISPLAY_LEN: usize = 80;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSummary {
    pub pid: u32,
    pub name: Option<String>,
    pub cmdline: Option<String>,
    pub memory_mb: Option<f64>,
    pub matched_by: MatchReasons,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    pub name: String,
    pub description: String,
    pub tech: String,
    pub path: String,
    pub running: bool,
    pub ports: Vec<u16>,                          // Resolved: registry first, then config
    pub open_ports: Vec<u16>,                     // Subset of `ports` something listens on
    pub memory_mb: f64,                           // Sum over matched processes, 0.1 MB steps
    pub conflicts: BTreeMap<u16, Vec<String>>,    // Only conflicts touching `ports`
    pub processes: Vec<ProcessSummary>,
    pub pid_count: usize,
    pub token_usage: u64,                         // Scraped from the tail of the project logs
    // Descriptor metadata, echoed for the dashboard
    pub start_script: Option<String>,
    pub pm2_name: Option<String>,
    pub notes: String,
    pub relations: Vec<String>,
    pub log_files: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

fn round_mb(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_MB * 10.0).round() / 10.0
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Assemble a status from one port list and one snapshot
pub fn build_status(
    descriptor: &ProjectDescriptor,
    ports: Vec<u16>,
    snapshot: &ProcessSnapshot,
    matched: &MatchedProcessSet,
    conflicts: &ConflictMap,
    token_usage: u64,
) -> ProjectStatus {
    // Processes whose memory could not be read are left out of the sum, not counted as zero
    let memory_bytes: u64 = matched.iter().filter_map(|m| m.record.memory_bytes).sum();

    let listening = snapshot.listening_ports();
    let open_ports: BTreeSet<u16> = ports.iter().copied().filter(|p| listening.contains(p)).collect();

    let processes = matched
        .iter()
        .map(|m| ProcessSummary {
            pid: m.record.pid,
            name: m.record.name.clone(),
            cmdline: m.record.cmdline.as_deref().map(|c| truncate_chars(c, CMDLINE_DISPLAY_LEN)),
            memory_mb: m.record.memory_bytes.map(round_mb),
            matched_by: m.reasons,
        })
        .collect();

    ProjectStatus {
        name: descriptor.name.clone(),
        description: descriptor.description.clone(),
        tech: descriptor.tech.clone(),
        path: descriptor.path.clone(),
        running: !matched.is_empty(),
        conflicts: conflicts.for_ports(&ports),
        open_ports: open_ports.into_iter().collect(),
        ports,
        memory_mb: round_mb(memory_bytes),
        processes,
        pid_count: matched.len(),
        token_usage,
        start_script: descriptor.start_script.clone(),
        pm2_name: descriptor.pm2_name.clone(),
        notes: descriptor.notes.clone(),
        relations: descriptor.relations.clone(),
        log_files: descriptor.log_files.clone(),
        checked_at: Utc::now(),
    }
}

pub struct StatusAggregator {
    resolver: PortResolver,
    detector: ConflictDetector,
    matcher: ProcessMatcher,
    source: Arc<dyn SnapshotSource>,
}

impl StatusAggregator {
    pub fn new(registry: Arc<RegistryClient>, source: Arc<dyn SnapshotSource>, self_name: &str) -> Self {
        Self {
            resolver: PortResolver::new(registry.clone()),
            detector: ConflictDetector::new(registry),
            matcher: ProcessMatcher::new(self_name),
            source,
        }
    }

    pub fn resolver(&self) -> &PortResolver {
        &self.resolver
    }

    pub fn detector(&self) -> &ConflictDetector {
        &self.detector
    }

    /// Enumeration is blocking; keep it off the async workers
    pub async fn capture(&self) -> ProcessSnapshot {
        let source = self.source.clone();
        match tokio::task::spawn_blocking(move || source.capture()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Snapshot capture failed: {}; treating everything as stopped", e);
                ProcessSnapshot::default()
            }
        }
    }

    /// Log scraping is file I/O too
    pub async fn token_usage(&self, descriptor: &ProjectDescriptor) -> u64 {
        let descriptor = descriptor.clone();
        match tokio::task::spawn_blocking(move || tokens::token_usage(&descriptor)).await {
            Ok(total) => total,
            Err(e) => {
                error!("Token scan failed: {}", e);
                0
            }
        }
    }

    /// Match a project against a fresh snapshot using its resolved ports
    pub async fn matched_processes(&self, descriptor: &ProjectDescriptor) -> MatchedProcessSet {
        let ports = self.resolver.resolve(descriptor).await;
        let snapshot = self.capture().await;
        self.matcher.match_with_ports(descriptor, &ports, &snapshot)
    }

    /// Status of one project; conflicts are computed over the whole set
    pub async fn aggregate(&self, descriptor: &ProjectDescriptor, projects: &ProjectSet) -> ProjectStatus {
        let conflicts = self.detector.detect(projects).await;
        self.aggregate_with(descriptor, &conflicts).await
    }

    /// Status of one project against a precomputed conflict map
    pub async fn aggregate_with(&self, descriptor: &ProjectDescriptor, conflicts: &ConflictMap) -> ProjectStatus {
        let ports = self.resolver.resolve(descriptor).await;
        let snapshot = self.capture().await;
        let matched = self.matcher.match_with_ports(descriptor, &ports, &snapshot);
        debug!(
            "{}: {} processes on ports {:?}",
            descriptor.name,
            matched.len(),
            ports
        );
        let token_usage = self.token_usage(descriptor).await;
        build_status(descriptor, ports, &snapshot, &matched, conflicts, token_usage)
    }

    /// Every project at once: conflicts computed once, projects aggregated concurrently
    pub async fn aggregate_all(&self, projects: &ProjectSet) -> BTreeMap<String, ProjectStatus> {
        let conflicts = self.detector.detect(projects).await;
        let statuses = join_all(
            projects
                .iter()
                .map(|descriptor| self.aggregate_with(descriptor, &conflicts)),
        )
        .await;
        statuses
            .into_iter()
            .map(|status| (status.name.clone(), status))
            .collect()
    }
}
