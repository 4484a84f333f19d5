//! Error types for Salvage core

use thiserror::Error;

/// Core result type
pub type Result<T> = std::result::Result<T, SalvageError>;

/// Core error type for Salvage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SalvageError {
    /// Configuration could not be parsed or is incomplete
    #[error("Configuration error: {0}")]
    Config(String),

    /// Schedule expression is invalid
    #[error("Invalid schedule '{expression}': {reason}")]
    Schedule {
        /// The offending expression
        expression: String,
        /// Parser message
        reason: String,
    },

    /// Exit code policy string could not be parsed
    #[error("Invalid exit code range: {0}")]
    ExitCodePolicy(String),

    /// Run log received a second outcome
    #[error("{subject} state has already been set to '{state}'")]
    AlreadyFinished {
        /// Tide or volume the log belongs to
        subject: String,
        /// State the log already holds
        state: String,
    },

    /// Stop watch used out of order
    #[error("Stop watch {0}")]
    StopWatch(&'static str),

    /// Volume log requested again with a different crane
    #[error("Volume log for '{volume}' already exists with crane '{existing}', requested '{requested}'")]
    CraneMismatch {
        /// Volume name
        volume: String,
        /// Crane already bound to the log
        existing: String,
        /// Crane passed in the new request
        requested: String,
    },
}

impl SalvageError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a schedule error
    pub fn schedule(expression: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Schedule {
            expression: expression.into(),
            reason: reason.to_string(),
        }
    }
}
