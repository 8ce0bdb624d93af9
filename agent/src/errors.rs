//! Error types for the update agent

use thiserror::Error;

/// Main error type for the update agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Boot environment error: {0}")]
    BootEnvError(String),

    #[error("Partition error: {0}")]
    PartitionError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("retry script later")]
    RetryLater,

    #[error("retry time limit exceeded for {0}")]
    ScriptRetryExceeded(String),

    #[error("Verification error: {0}")]
    VerificationError(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Tried maximum amount of times")]
    TriedMax,

    #[error("Fatal error: {0}")]
    FatalError(String),
}

impl AgentError {
    /// Whether this error must terminate the daemon loop rather than the
    /// current deployment. Configuration errors are fatal only at startup,
    /// where the settings loader exits directly.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::FatalError(_) | AgentError::BootEnvError(_)
        )
    }
}
