//! Common types shared by process launchers and the engine core

use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

/// Boxed readable byte endpoint (a process output, or a client's stdin)
pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;

/// Boxed writable byte endpoint (a process stdin, or a client's output)
pub type ByteWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Container ID wrapper
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh 64 character hex identifier
    pub fn generate() -> Self {
        Self(format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        ))
    }

    pub fn short(&self) -> &str {
        if self.0.len() > 12 {
            &self.0[..12]
        } else {
            &self.0
        }
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Which output stream a chunk of bytes came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Everything a launcher needs to start one container process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Container the process belongs to
    pub id: ContainerId,
    /// Image the root filesystem is resolved from
    pub image: String,
    /// Program followed by its arguments
    pub cmd: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Working directory inside the root filesystem
    pub working_dir: Option<String>,
    /// Hostname reported inside the container
    pub hostname: Option<String>,
    /// Wire the process to a pseudo-terminal instead of three pipes
    pub tty: bool,
    /// Give the process a writable stdin
    pub open_stdin: bool,
}

impl LaunchSpec {
    pub fn program(&self) -> Option<&str> {
        self.cmd.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        self.cmd.get(1..).unwrap_or(&[])
    }
}

/// Raw I/O endpoints of a started process
pub enum ProcessIo {
    /// Three independent pipes
    Pipes {
        stdin: Option<ByteWriter>,
        stdout: ByteReader,
        stderr: ByteReader,
    },
    /// Both halves of a pty master. stdout and stderr are not separable.
    Tty { input: ByteWriter, output: ByteReader },
}

impl ProcessIo {
    pub fn is_tty(&self) -> bool {
        matches!(self, Self::Tty { .. })
    }
}

/// Sends signals to a started process
pub trait ProcessControl: Send + Sync {
    fn signal(&self, signal: i32) -> crate::Result<()>;
}

/// A started process: its endpoints, a way to signal it, and its exit code.
///
/// The exit code follows shell conventions: the status passed to `exit`, or
/// 128 plus the signal number when the process was killed by a signal.
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub io: ProcessIo,
    pub control: Arc<dyn ProcessControl>,
    pub exited: oneshot::Receiver<i32>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("tty", &self.io.is_tty())
            .finish()
    }
}

/// Exit code for a process terminated by `signal`
pub fn signal_exit_code(signal: i32) -> i32 {
    128 + signal
}
