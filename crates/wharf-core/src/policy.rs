//! What happens to a process when the client feeding its stdin goes away

use serde::{Deserialize, Serialize};

/// How a container's standard streams are wired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WiringMode {
    /// Three independent pipes; stdout and stderr are distinguishable
    Pipe,
    /// A single pseudo-terminal carries input and merged output
    Tty,
}

impl WiringMode {
    pub fn from_tty(tty: bool) -> Self {
        if tty {
            Self::Tty
        } else {
            Self::Pipe
        }
    }
}

/// Action taken on the process stdin when a client's stdin endpoint ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectAction {
    /// Close the process stdin, delivering EOF
    CloseStdin,
    /// Leave the process stdin open for a later client
    KeepOpen,
}

impl DisconnectAction {
    /// Whether the attach session ends as soon as its stdin endpoint does.
    ///
    /// After `CloseStdin` the session keeps streaming output until the process
    /// exits; after `KeepOpen` the client is released right away.
    pub fn ends_session(self) -> bool {
        matches!(self, Self::KeepOpen)
    }
}

/// Decide what a stdin disconnect does to the process.
///
/// A terminal never forwards EOF on disconnect. With pipes the stdin is closed
/// only when the container was created to receive a single stdin stream.
pub fn on_stdin_closed(mode: WiringMode, stdin_once: bool) -> DisconnectAction {
    match mode {
        WiringMode::Tty => DisconnectAction::KeepOpen,
        WiringMode::Pipe if stdin_once => DisconnectAction::CloseStdin,
        WiringMode::Pipe => DisconnectAction::KeepOpen,
    }
}
