//! Registry error types.

use thiserror::Error;

/// Errors that can occur while supervising tool servers or querying their tools.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A start was requested for a name that already has a live entry.
    #[error("Server '{name}' is already running.")]
    AlreadyRunning { name: String },

    /// A stop was requested for a name with no live entry.
    #[error("Server '{name}' is not running.")]
    NotRunning { name: String },

    /// The spawned process never answered its metadata endpoint in time.
    /// The process has been killed by the time this is returned.
    #[error("server '{name}' did not answer {url} within {timeout_ms}ms")]
    HealthCheckTimeout {
        name: String,
        url: String,
        timeout_ms: u64,
    },

    /// The metadata endpoint answered, but not with a usable manifest.
    #[error("server '{name}' returned an invalid manifest: {reason}")]
    UpstreamMetadataError { name: String, reason: String },

    /// No cached and no stored tools exist for the name.
    #[error("No tools found for server '{name}'.")]
    NotFound { name: String },

    /// The OS refused to launch the command.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnError { name: String, reason: String },

    /// The process exited on its own before it became reachable.
    #[error("server '{name}' exited before becoming ready: {status}")]
    ProcessExited { name: String, status: String },

    /// The request itself was unusable (bad name, empty command, bad URL).
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The durable registry store failed.
    #[error("registry store error: {reason}")]
    Store { reason: String },
}

impl From<rusqlite::Error> for RegistryError {
    fn from(e: rusqlite::Error) -> Self {
        RegistryError::Store {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::Store {
            reason: format!("serialization: {e}"),
        }
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;
