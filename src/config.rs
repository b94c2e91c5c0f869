/// Control plane configuration
///
/// Read once at startup from `<config_dir>/pmctl/config.json`; every field has a default,
/// so a partial or missing file is fine. `PMCTL_REGISTRY_URL` and `PMCTL_PROJECTS` win
/// over the file. We never write this file.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::app::APP_NAME;

/// Runtime configuration for the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Base URL of the port registry service
    pub registry_url: String,

    /// How long a registry listing stays fresh
    pub registry_ttl_secs: u64,

    /// Upper bound on a single registry HTTP call
    pub registry_timeout_ms: u64,

    /// Our own invocation name, excluded from pattern matching
    pub self_name: String,

    /// Descriptor store (projects.json)
    pub projects_file: PathBuf,

    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace_ms: u64,

    /// Wait after SIGKILL before re-querying
    pub kill_wait_ms: u64,

    /// How long `start` polls for the project to come online
    pub start_wait_secs: u64,

    /// trace | debug | info | warn | error
    pub log_level: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            registry_url: "http://localhost:4444".to_string(),
            registry_ttl_secs: 5,
            registry_timeout_ms: 2000,
            self_name: APP_NAME.to_string(),
            projects_file: Self::config_dir().join("projects.json"),
            stop_grace_ms: 2000,
            kill_wait_ms: 1000,
            start_wait_secs: 12,
            log_level: "info".to_string(),
        }
    }
}

/// Where the configuration came from
/// Loading happens before logging is set up, so this is reported afterwards
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    Defaults,
    File(PathBuf),
    Ignored { path: PathBuf, reason: String },
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            ConfigSource::Defaults => debug!("No config file, using defaults"),
            ConfigSource::File(path) => info!("Loaded config from {:?}", path),
            ConfigSource::Ignored { path, reason } => {
                warn!("Ignoring config {:?}: {}; using defaults", path, reason)
            }
        }
    }
}

impl ControlConfig {
    /// Load configuration from file, then apply environment overrides
    pub fn load() -> (Self, ConfigSource) {
        let (config, source) = Self::load_from(&Self::config_dir().join("config.json"));
        let mut config = config.unwrap_or_default();
        config.apply_env();
        (config, source)
    }

    fn load_from(config_path: &Path) -> (Option<Self>, ConfigSource) {
        if !config_path.exists() {
            return (None, ConfigSource::Defaults);
        }
        let ignored = |reason: String| ConfigSource::Ignored {
            path: config_path.to_path_buf(),
            reason,
        };
        let contents = match std::fs::read_to_string(config_path) {
            Ok(contents) => contents,
            Err(e) => return (None, ignored(e.to_string())),
        };
        match serde_json::from_str(&contents) {
            Ok(config) => (Some(config), ConfigSource::File(config_path.to_path_buf())),
            Err(e) => (None, ignored(e.to_string())),
        }
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("PMCTL_REGISTRY_URL") {
            if !url.trim().is_empty() {
                self.registry_url = url.trim().trim_end_matches('/').to_string();
            }
        }
        if let Ok(path) = std::env::var("PMCTL_PROJECTS") {
            if !path.trim().is_empty() {
                self.projects_file = PathBuf::from(path.trim());
            }
        }
    }

    /// `<config_dir>/pmctl`, or `./.pmctl` when the platform has no config dir
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join(APP_NAME))
            .unwrap_or_else(|| PathBuf::from(format!(".{}", APP_NAME)))
    }

    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(self.registry_ttl_secs)
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }

    pub fn tracing_level(&self) -> tracing::Level {
        self.log_level
            .parse()
            .unwrap_or(tracing::Level::INFO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControlConfig::default();
        assert_eq!(config.registry_ttl(), Duration::from_secs(5));
        assert_eq!(config.registry_timeout(), Duration::from_secs(2));
        assert_eq!(config.self_name, "pmctl");
        assert!(config.projects_file.ends_with("projects.json"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: ControlConfig =
            serde_json::from_str(r#"{"registry_url": "http://127.0.0.1:9999"}"#).unwrap();
        assert_eq!(config.registry_url, "http://127.0.0.1:9999");
        assert_eq!(config.registry_ttl_secs, 5);
        assert_eq!(config.stop_grace_ms, 2000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"stop_grace_ms": 500}"#).unwrap();

        let (config, source) = ControlConfig::load_from(&path);
        assert_eq!(config.unwrap().stop_grace(), Duration::from_millis(500));
        assert_eq!(source, ConfigSource::File(path));
    }

    #[test]
    fn test_unparsable_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let (config, source) = ControlConfig::load_from(&path);
        assert!(config.is_none());
        assert!(matches!(source, ConfigSource::Ignored { path: p, .. } if p == path));

        let (config, source) = ControlConfig::load_from(&dir.path().join("missing.json"));
        assert!(config.is_none());
        assert_eq!(source, ConfigSource::Defaults);
    }

    #[test]
    fn test_bad_log_level_falls_back_to_info() {
        let config = ControlConfig {
            log_level: "chatty".to_string(),
            ..ControlConfig::default()
        };
        assert_eq!(config.tracing_level(), tracing::Level::INFO);

        let config = ControlConfig {
            log_level: "debug".to_string(),
            ..ControlConfig::default()
        };
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
    }
}
