/// Error types for pmctl
///
/// `RecoverableError` covers everything that can go wrong inside a resolution pass.
/// None of these ever reach the caller of a status query: each component collapses
/// them into "omit the record", "empty list" or "stale cache" at its boundary.
///
/// `ControlError` is for the outer surfaces (descriptor store, actions) where a
/// failure is worth reporting.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoverableError {
    #[error("permission denied inspecting process {pid}")]
    PermissionDenied { pid: u32 },

    #[error("process {pid} exited during inspection")]
    ProcessGone { pid: u32 },

    #[error("port registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("port registry returned a malformed body: {0}")]
    RegistryMalformed(String),

    #[error("could not read socket table: {0}")]
    SocketTable(String),
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("project '{0}' not found")]
    ProjectNotFound(String),

    #[error("failed to read project store {path}: {source}")]
    StoreRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse project store {path}: {source}")]
    StoreParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("project '{0}' has no start_script")]
    NoStartScript(String),

    #[error("start script not found: {0}")]
    ScriptNotFound(String),

    #[error("failed to spawn {what}: {source}")]
    Spawn {
        what: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ControlResult<T> = Result<T, ControlError>;
