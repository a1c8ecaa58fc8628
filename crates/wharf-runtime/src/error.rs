//! Error types for process launching

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Command not executable: {0}")]
    CommandNotExecutable(String),

    #[error("Failed to allocate pseudo-terminal: {0}")]
    Pty(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to signal process: {0}")]
    Signal(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LaunchError>;
