/// Project descriptors and the read-only descriptor store
///
/// Descriptors are immutable for the duration of one resolution pass. The store is
/// re-read before each top-level operation; editing `projects.json` is someone else's job.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ControlError, ControlResult};

/// Static declaration of one managed project
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectDescriptor {
    /// Unique key; filled from the map key when loaded from the store
    #[serde(default, skip_serializing)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, rename = "ports")]
    pub configured_ports: Vec<u16>,
    #[serde(default)]
    pub process_patterns: Vec<String>,
    #[serde(default, rename = "services")]
    pub service_names: Vec<String>,

    // Metadata carried through to status output and actions
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tech: String,
    #[serde(default)]
    pub start_script: Option<String>,
    #[serde(default)]
    pub pm2_name: Option<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub relations: Vec<String>,
    #[serde(default)]
    pub log_files: Vec<String>,
}

impl ProjectDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.configured_ports = ports.into_iter().collect();
        self
    }

    pub fn with_patterns<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.process_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_services<S: Into<String>>(mut self, services: impl IntoIterator<Item = S>) -> Self {
        self.service_names = services.into_iter().map(Into::into).collect();
        self
    }

    /// Full path to the start script, if one is configured
    pub fn start_script_path(&self) -> Option<PathBuf> {
        self.start_script
            .as_deref()
            .map(|script| Path::new(&self.path).join(script))
    }
}

/// All descriptors for one top-level operation, keyed (and ordered) by name
#[derive(Debug, Clone, Default)]
pub struct ProjectSet {
    projects: BTreeMap<String, ProjectDescriptor>,
}

impl ProjectSet {
    pub fn new(descriptors: impl IntoIterator<Item = ProjectDescriptor>) -> Self {
        Self {
            projects: descriptors
                .into_iter()
                .map(|descriptor| (descriptor.name.clone(), descriptor))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> ControlResult<&ProjectDescriptor> {
        self.projects
            .get(name)
            .ok_or_else(|| ControlError::ProjectNotFound(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProjectDescriptor> {
        self.projects.values()
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct StoreFile {
    #[serde(default)]
    projects: BTreeMap<String, ProjectDescriptor>,
}

/// Reads `projects.json`; never writes it
#[derive(Debug, Clone)]
pub struct ProjectStore {
    path: PathBuf,
}

impl ProjectStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every descriptor; a missing store is an empty project set
    pub fn load(&self) -> ControlResult<ProjectSet> {
        if !self.path.exists() {
            debug!("No project store at {:?}", self.path);
            return Ok(ProjectSet::default());
        }

        let display = self.path.display().to_string();
        let contents = std::fs::read_to_string(&self.path).map_err(|source| ControlError::StoreRead {
            path: display.clone(),
            source,
        })?;
        let file: StoreFile = serde_json::from_str(&contents)
            .map_err(|source| ControlError::StoreParse { path: display, source })?;

        let set = ProjectSet::new(file.projects.into_iter().map(|(name, mut descriptor)| {
            descriptor.name = name;
            descriptor
        }));
        info!("Loaded {} projects from {:?}", set.len(), self.path);
        Ok(set)
    }
}
