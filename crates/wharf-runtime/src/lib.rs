//! Process execution for wharf
//!
//! This crate provides the narrow interface the engine core uses to start a
//! container process: a [`ProcessLauncher`] takes a [`LaunchSpec`] and returns
//! a [`ProcessHandle`] exposing raw stdin/stdout/stderr (or a single pty
//! channel) and reporting termination asynchronously.

mod error;
#[cfg(unix)]
mod native;
#[cfg(unix)]
mod pty;
#[cfg(any(test, feature = "test-support"))]
pub mod scripted;
mod types;

pub use error::*;
#[cfg(unix)]
pub use native::{process_alive, NativeLauncher};
#[cfg(unix)]
pub use pty::PtyStream;
pub use types::*;

use async_trait::async_trait;

/// Trait for starting container processes
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start the process described by `spec`.
    ///
    /// Fails with [`LaunchError::ImageNotFound`] or
    /// [`LaunchError::CommandNotExecutable`] when nothing could be started.
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}
