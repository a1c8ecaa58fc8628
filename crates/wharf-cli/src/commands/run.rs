//! `wharf run`

use anyhow::Result;
use crossterm::terminal;
use std::io::IsTerminal;
use wharf_core::{Engine, RunOptions, SessionEnd, Transport};

/// Guard that restores terminal state on drop
struct RawModeGuard {
    was_raw: bool,
}

impl RawModeGuard {
    fn new() -> Result<Self> {
        let was_raw = terminal::is_raw_mode_enabled()?;
        if !was_raw {
            terminal::enable_raw_mode()?;
        }
        Ok(Self { was_raw })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if !self.was_raw {
            let _ = terminal::disable_raw_mode();
        }
    }
}

/// Run a container wired to this process's stdio and return the exit code
/// for the CLI.
///
/// This process supervises the container, so it keeps running until the
/// container exits even when detached or after a tty client disconnects.
pub async fn run(engine: &Engine, opts: RunOptions) -> Result<i32> {
    let raw = if opts.tty && opts.interactive && !opts.detach && std::io::stdin().is_terminal() {
        Some(RawModeGuard::new()?)
    } else {
        None
    };

    let outcome = engine.cmd_run(opts, Transport::stdio()).await;
    drop(raw);
    let outcome = outcome?;

    match outcome.session {
        Some(SessionEnd::Exited(code)) => return Ok(code),
        Some(end) => tracing::debug!("Session with {} ended: {:?}", outcome.id.short(), end),
        None => {}
    }

    let container = engine.container(outcome.id.as_ref()).await?;
    let exit_code = container.wait().await?;
    tracing::debug!(
        "Container {} exited with code {} after the client left",
        container.short_id(),
        exit_code
    );
    Ok(0)
}
