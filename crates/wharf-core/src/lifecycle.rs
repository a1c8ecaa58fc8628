//! Container lifecycle state machine
//!
//! A container is `Created`, `Running` or `Exited`. Every transition is
//! published through a [`tokio::sync::watch`] channel, so waiters observe the
//! current value before blocking and never miss an exit that happened just
//! before they started waiting.

use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

/// Coarse lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Created,
    Running,
    Exited,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Observable state of a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub phase: Phase,
    pub running: bool,
    /// Exit code of the last run, meaningful once `phase` is `Exited`
    pub exit_code: i32,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of times the container has been started
    #[serde(default)]
    pub generation: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            phase: Phase::Created,
            running: false,
            exit_code: 0,
            pid: None,
            started_at: None,
            finished_at: None,
            generation: 0,
        }
    }
}

impl State {
    /// Human readable status in the style of `ps`
    pub fn describe(&self) -> String {
        match self.phase {
            Phase::Created => "Created".to_string(),
            Phase::Running => match self.started_at {
                Some(at) => format!("Up since {}", at.format("%Y-%m-%d %H:%M:%S")),
                None => "Up".to_string(),
            },
            Phase::Exited => format!("Exited ({})", self.exit_code),
        }
    }
}

/// Owner of a container's [`State`].
///
/// Only the container itself transitions the state; everybody else observes it.
#[derive(Debug)]
pub struct Lifecycle {
    tx: watch::Sender<State>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::restore(State::default())
    }

    /// Resume from a persisted state
    pub fn restore(state: State) -> Self {
        let (tx, _rx) = watch::channel(state);
        Self { tx }
    }

    pub fn snapshot(&self) -> State {
        self.tx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.tx.borrow().running
    }

    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.tx.subscribe()
    }

    /// Transition `Created`/`Exited` -> `Running`, returning the new generation
    pub(crate) fn mark_running(&self, pid: Option<u32>) -> Result<u64> {
        let mut outcome = Err(CoreError::InvalidState(
            "container is already running".to_string(),
        ));
        self.tx.send_if_modified(|state| {
            if state.phase == Phase::Running {
                return false;
            }
            state.phase = Phase::Running;
            state.running = true;
            state.pid = pid;
            state.exit_code = 0;
            state.started_at = Some(Utc::now());
            state.finished_at = None;
            state.generation += 1;
            outcome = Ok(state.generation);
            true
        });
        outcome
    }

    /// Transition `Running` -> `Exited` for the run identified by `generation`.
    ///
    /// Returns false when that run has already been marked exited.
    pub(crate) fn mark_exited(&self, generation: u64, exit_code: i32) -> bool {
        self.tx.send_if_modified(|state| {
            if state.phase != Phase::Running || state.generation != generation {
                return false;
            }
            state.phase = Phase::Exited;
            state.running = false;
            state.pid = None;
            state.exit_code = exit_code;
            state.finished_at = Some(Utc::now());
            true
        })
    }

    /// Block until the container reaches `Exited` and return its exit code.
    ///
    /// Returns immediately when it already has.
    pub async fn wait(&self) -> Result<i32> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|s| s.phase == Phase::Exited)
            .await
            .map_err(|_| CoreError::InvalidState("container was dropped".to_string()))?;
        Ok(state.exit_code)
    }

    /// Like [`Lifecycle::wait`], giving up after `timeout`
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<i32> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| CoreError::Timeout(timeout))?
    }

    /// Resolve once the container has been started at least once
    pub async fn wait_started(&self) -> Result<()> {
        let mut rx = self.tx.subscribe();
        rx.wait_for(|s| s.generation > 0)
            .await
            .map_err(|_| CoreError::InvalidState("container was dropped".to_string()))?;
        Ok(())
    }
}

/// Resolve with the exit code of run `generation`, or with the latest exit code
/// if a later run has already begun.
pub(crate) async fn run_exited(mut rx: watch::Receiver<State>, generation: u64) -> i32 {
    match rx
        .wait_for(|s| s.generation > generation || (s.generation == generation && !s.running))
        .await
    {
        Ok(state) => state.exit_code,
        Err(_) => -1,
    }
}
