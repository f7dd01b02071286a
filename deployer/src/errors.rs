//! Error types for the deployer

use thiserror::Error;

use crate::deploy::command::CommandError;

/// Main error type for the deployer
#[derive(Error, Debug)]
pub enum DeployerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    CommandError(#[from] CommandError),

    #[error("Deployment already active: {0}")]
    AlreadyActive(String),

    #[error("Invalid deployment key: {0}")]
    InvalidKey(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Required tool is not available: {0}")]
    MissingTool(String),

    #[error("source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("Domain {domain} is already deployed for {owner}")]
    DomainConflict { domain: String, owner: String },

    #[error("No free port in range {0}")]
    PortsExhausted(String),

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployerError {
    /// Whether the error was raised while admitting a submission
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            DeployerError::AlreadyActive(_)
                | DeployerError::DomainConflict { .. }
                | DeployerError::InvalidKey(_)
                | DeployerError::ValidationError(_)
                | DeployerError::Unsupported(_)
        )
    }
}
