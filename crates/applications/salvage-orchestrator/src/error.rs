//! Error types for the orchestrator

use salvage_core::SalvageError;
use thiserror::Error;

/// Orchestrator result type
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur in the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Core model error
    #[error(transparent)]
    Core(#[from] SalvageError),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Docker engine error
    #[error("Docker error: {0}")]
    Docker(String),

    /// Container, volume or image does not exist
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Object kind
        kind: &'static str,
        /// Name or id that was looked up
        name: String,
    },

    /// Container kept restarting past the retry budget
    #[error("Container '{container}' is still restarting after {attempts} attempts")]
    UnstableContainer {
        /// Container name
        container: String,
        /// Number of polls
        attempts: u32,
    },

    /// Container command was rejected by its exit code policy
    #[error("Command '{command}' in container '{container}' exited with code {exit_code}")]
    Command {
        /// Container name
        container: String,
        /// Command line
        command: String,
        /// Reported exit code
        exit_code: i64,
    },

    /// Container could not be brought into a backup-safe state
    #[error("Container '{container}': {reason}")]
    Prepare {
        /// Container name
        container: String,
        /// What went wrong
        reason: String,
    },

    /// One or more containers could not be restored
    #[error("Failed to restore containers: {}", .0.join(", "))]
    Restore(Vec<String>),

    /// Crane run failed
    #[error("Backup error: {0}")]
    Backup(String),

    /// Operation was interrupted by shutdown
    #[error("Operation was cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// Create a Docker error
    pub fn docker(msg: impl Into<String>) -> Self {
        Self::Docker(msg.into())
    }

    /// Create a backup error
    pub fn backup(msg: impl Into<String>) -> Self {
        Self::Backup(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a not found error
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Create a prepare error
    pub fn prepare(container: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Prepare {
            container: container.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error stems from shutdown
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
