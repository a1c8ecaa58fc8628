//! Error types for wharf-core

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] wharf_config::ConfigError),

    #[error("Failed to start container: {0}")]
    StartFailure(#[from] wharf_runtime::LaunchError),

    #[error("stdin of container {0} is already attached")]
    AlreadyAttached(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Attach transport closed")]
    TransportClosed,

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Ambiguous container reference '{0}', matches: {1}")]
    Ambiguous(String, String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to signal container: {0}")]
    Signal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("State file corrupted: {0}")]
    StateCorrupted(String),
}

impl CoreError {
    /// True when the process could not be spawned because its image is unknown
    pub fn is_image_not_found(&self) -> bool {
        matches!(
            self,
            Self::StartFailure(wharf_runtime::LaunchError::ImageNotFound(_))
        )
    }

    /// True when the command could not be executed
    pub fn is_not_executable(&self) -> bool {
        matches!(
            self,
            Self::StartFailure(wharf_runtime::LaunchError::CommandNotExecutable(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
