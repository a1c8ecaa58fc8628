//! A container: configuration, lifecycle and the stream wiring of its current run

use crate::lifecycle::{Lifecycle, Phase, State};
use crate::logs::{LogOptions, LogReader, LogWriter};
use crate::policy::WiringMode;
use crate::state::ContainerRecord;
use crate::stream::{
    spawn_pump, AttachOptions, AttachSession, Delivery, Fanout, StdinPipe, StdinSink, Transport,
    Wiring,
};
use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use wharf_config::StreamsConfig;
use wharf_runtime::{
    ContainerId, LaunchSpec, ProcessControl, ProcessHandle, ProcessIo, ProcessLauncher,
    StreamKind,
};

const SIGKILL: i32 = 9;

/// How often a container supervised by another engine process is re-read
const REMOTE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Immutable creation-time configuration of a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub image: String,
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Wire the process to a pseudo-terminal
    #[serde(default)]
    pub tty: bool,
    /// Give the process a writable stdin
    #[serde(default)]
    pub open_stdin: bool,
    /// Close the process stdin once the first attached stdin client goes away
    #[serde(default)]
    pub stdin_once: bool,
}

impl ContainerConfig {
    pub fn mode(&self) -> WiringMode {
        WiringMode::from_tty(self.tty)
    }

    /// The command as a single display string
    pub fn command_line(&self) -> String {
        self.cmd.join(" ")
    }
}

/// Live state of one run
struct Run {
    wiring: Wiring,
    control: Arc<dyn ProcessControl>,
}

pub struct Container {
    id: ContainerId,
    created: DateTime<Utc>,
    config: ContainerConfig,
    dir: PathBuf,
    lifecycle: Lifecycle,
    logs: Arc<LogWriter>,
    streams: StreamsConfig,
    launcher: Arc<dyn ProcessLauncher>,
    run: Mutex<Option<Arc<Run>>>,
    start_lock: tokio::sync::Mutex<()>,
    next_session: AtomicU64,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("image", &self.config.image)
            .field("state", &self.lifecycle.snapshot().phase)
            .finish()
    }
}

impl Container {
    pub(crate) fn new(
        id: ContainerId,
        config: ContainerConfig,
        dir: PathBuf,
        streams: StreamsConfig,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self::assemble(id, Utc::now(), config, State::default(), dir, streams, launcher)
    }

    pub(crate) fn from_record(
        record: ContainerRecord,
        dir: PathBuf,
        streams: StreamsConfig,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self::assemble(
            record.id,
            record.created,
            record.config,
            record.state,
            dir,
            streams,
            launcher,
        )
    }

    fn assemble(
        id: ContainerId,
        created: DateTime<Utc>,
        config: ContainerConfig,
        state: State,
        dir: PathBuf,
        streams: StreamsConfig,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        let logs = Arc::new(LogWriter::new(dir.join(format!("{}-json.log", id))));
        Self {
            id,
            created,
            config,
            dir,
            lifecycle: Lifecycle::restore(state),
            logs,
            streams,
            launcher,
            run: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    pub fn short_id(&self) -> &str {
        self.id.short()
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn mode(&self) -> WiringMode {
        self.config.mode()
    }

    pub fn state(&self) -> State {
        self.lifecycle.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> &Path {
        self.logs.path()
    }

    pub fn record(&self) -> ContainerRecord {
        let state = self.lifecycle.snapshot();
        ContainerRecord {
            id: self.id.clone(),
            created: self.created,
            config: self.config.clone(),
            supervisor: state.running.then(std::process::id),
            state,
        }
    }

    /// Save the current record to disk
    pub async fn persist(&self) -> Result<()> {
        self.record().store(self.dir.clone()).await
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            tracing::warn!("Failed to save container {}: {}", self.short_id(), e);
        }
    }

    fn run_slot(&self) -> MutexGuard<'_, Option<Arc<Run>>> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_run(&self) -> Result<Arc<Run>> {
        self.run_slot().clone().ok_or_else(|| {
            CoreError::InvalidState(format!("container {} is not running", self.short_id()))
        })
    }

    fn session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            id: self.id.clone(),
            image: self.config.image.clone(),
            cmd: self.config.cmd.clone(),
            env: self.config.env.clone(),
            working_dir: self.config.working_dir.clone(),
            hostname: self.config.hostname.clone(),
            tty: self.config.tty,
            open_stdin: self.config.open_stdin,
        }
    }

    /// Start the process with nobody attached
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.start_with(None).await.map(|_| ())
    }

    /// Start the process with a client attached before any output is produced
    pub async fn start_attached(
        self: &Arc<Self>,
        opts: AttachOptions,
        transport: Transport,
    ) -> Result<AttachSession> {
        self.start_with(Some((opts, transport)))
            .await?
            .ok_or_else(|| CoreError::InvalidState("attach session was not opened".to_string()))
    }

    async fn start_with(
        self: &Arc<Self>,
        attach: Option<(AttachOptions, Transport)>,
    ) -> Result<Option<AttachSession>> {
        let _guard = self.start_lock.lock().await;
        if self.lifecycle.is_running() {
            return Err(CoreError::InvalidState(format!(
                "container {} is already running",
                self.short_id()
            )));
        }

        let handle = match self.launcher.launch(&self.launch_spec()).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("Failed to start container {}: {}", self.short_id(), e);
                return Err(e.into());
            }
        };
        let ProcessHandle {
            pid,
            io,
            control,
            exited,
        } = handle;

        let buffer = self.streams.fanout_buffer;
        let stdout = Fanout::new(StreamKind::Stdout, buffer);
        let (stderr, stdin, readers) = match io {
            ProcessIo::Pipes {
                stdin,
                stdout: out,
                stderr: err,
            } => {
                let stderr = Fanout::new(StreamKind::Stderr, buffer);
                let readers = vec![(out, stdout.clone()), (err, stderr.clone())];
                (Some(stderr), stdin, readers)
            }
            ProcessIo::Tty { input, output } => {
                (None, Some(input), vec![(output, stdout.clone())])
            }
        };

        // the log subscribes before any output is read
        let (log_tx, log_rx) = mpsc::channel(buffer.max(1));
        stdout.add(log_tx.clone(), Delivery::Lossless);
        if let Some(stderr) = &stderr {
            stderr.add(log_tx.clone(), Delivery::Lossless);
        }
        drop(log_tx);
        let log_task = self.logs.spawn(log_rx);

        let wiring = Wiring {
            container: self.short_id().to_string(),
            mode: self.mode(),
            open_stdin: self.config.open_stdin,
            stdin_once: self.config.stdin_once,
            stdin: StdinSink::new(stdin),
            stdout,
            stderr,
            generation: self.lifecycle.snapshot().generation + 1,
            drain_timeout: self.streams.drain_timeout(),
            chunk_size: self.streams.read_chunk_size,
        };

        let session = match attach {
            Some((opts, transport)) => {
                match wiring.open(self.lifecycle.subscribe(), self.session_id(), opts, transport) {
                    Ok(session) => Some(session),
                    Err(e) => {
                        if let Err(kill) = control.signal(SIGKILL) {
                            tracing::warn!(
                                "Failed to kill container {} after attach error: {}",
                                self.short_id(),
                                kill
                            );
                        }
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let chunk_size = self.streams.read_chunk_size;
        let pumps: Vec<JoinHandle<()>> = readers
            .into_iter()
            .map(|(reader, fanout)| spawn_pump(reader, fanout, chunk_size))
            .collect();

        let run = Arc::new(Run { wiring, control });
        *self.run_slot() = Some(run.clone());
        let generation = self.lifecycle.mark_running(pid)?;
        tracing::info!(
            "Started container {} (pid {:?}, {:?} mode, run {})",
            self.short_id(),
            pid,
            self.mode(),
            generation
        );
        self.persist_logged().await;

        tokio::spawn(self.clone().supervise(run, exited, pumps, log_task));
        Ok(session)
    }

    /// Follow one run to its end: wait for the process, drain its output into
    /// the log, release its endpoints, then publish `Exited`.
    async fn supervise(
        self: Arc<Self>,
        run: Arc<Run>,
        exited: oneshot::Receiver<i32>,
        pumps: Vec<JoinHandle<()>>,
        log_task: JoinHandle<()>,
    ) {
        let code = match exited.await {
            Ok(code) => code,
            Err(_) => {
                tracing::warn!("Lost track of container {} process", self.short_id());
                -1
            }
        };
        tracing::debug!(
            "Container {} process exited with code {}, draining output",
            self.short_id(),
            code
        );

        let drain = self.streams.drain_timeout();
        let aborts: Vec<_> = pumps.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(drain, futures::future::join_all(pumps))
            .await
            .is_err()
        {
            tracing::warn!(
                "Output of container {} still open {:?} after exit, closing it",
                self.short_id(),
                drain
            );
            for abort in aborts {
                abort.abort();
            }
            run.wiring.stdout.close();
            if let Some(stderr) = &run.wiring.stderr {
                stderr.close();
            }
        }

        run.wiring.stdin.close().await;
        if tokio::time::timeout(drain, log_task).await.is_err() {
            tracing::warn!("Log writer of container {} did not finish", self.short_id());
        }

        {
            let mut slot = self.run_slot();
            if slot
                .as_ref()
                .is_some_and(|r| r.wiring.generation == run.wiring.generation)
            {
                *slot = None;
            }
        }
        self.lifecycle.mark_exited(run.wiring.generation, code);
        self.persist_logged().await;
        tracing::info!("Container {} exited with code {}", self.short_id(), code);
    }

    /// Attach a client to the running process
    pub fn attach(&self, opts: AttachOptions, transport: Transport) -> Result<AttachSession> {
        let run = self.current_run()?;
        run.wiring
            .open(self.lifecycle.subscribe(), self.session_id(), opts, transport)
    }

    /// Direct handle on the running process's stdin
    pub fn stdin_pipe(&self) -> Result<StdinPipe> {
        if !self.config.open_stdin {
            return Err(CoreError::InvalidState(format!(
                "container {} was created without stdin",
                self.short_id()
            )));
        }
        let run = self.current_run()?;
        Ok(StdinPipe::new(run.wiring.stdin.clone()))
    }

    /// Send `signal` to the running process
    pub fn kill(&self, signal: i32) -> Result<()> {
        let run = self.current_run()?;
        tracing::debug!("Sending signal {} to container {}", signal, self.short_id());
        run.control
            .signal(signal)
            .map_err(|e| CoreError::Signal(e.to_string()))
    }

    /// Track a container whose process belongs to another engine process.
    ///
    /// The saved record is re-read until it shows the run ended, then the
    /// exit is applied here so waiters and log followers finish. The record
    /// itself is left to its owner.
    pub(crate) fn observe_remote(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let generation = self.lifecycle.snapshot().generation;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REMOTE_POLL_INTERVAL);
            loop {
                tick.tick().await;
                let Some(container) = weak.upgrade() else {
                    return;
                };
                container.logs.touch();
                let record = match ContainerRecord::load(&container.dir) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::debug!("Re-reading container {}: {}", container.short_id(), e);
                        continue;
                    }
                };
                let same_run = record.state.generation == generation;
                let code = if same_run && record.state.phase == Phase::Exited {
                    record.state.exit_code
                } else if same_run && record.supervised_elsewhere() {
                    continue;
                } else {
                    tracing::warn!(
                        "Lost the supervisor of container {}, marking it exited",
                        container.short_id()
                    );
                    -1
                };
                container.lifecycle.mark_exited(generation, code);
                return;
            }
        })
    }

    /// Open a reader over the container's output log
    pub fn read_log(&self, options: LogOptions) -> LogReader {
        self.logs.reader(options, self.lifecycle.subscribe())
    }

    pub async fn wait(&self) -> Result<i32> {
        self.lifecycle.wait().await
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> Result<i32> {
        self.lifecycle.wait_timeout(timeout).await
    }

    pub async fn wait_started(&self) -> Result<()> {
        self.lifecycle.wait_started().await
    }

    /// Delete the container's files. The log survives unless `purge_logs`.
    pub(crate) async fn destroy(&self, purge_logs: bool) -> Result<()> {
        if self.is_running() {
            return Err(CoreError::InvalidState(format!(
                "container {} is running, stop it first",
                self.short_id()
            )));
        }
        match tokio::fs::remove_file(ContainerRecord::path_in(&self.dir)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if purge_logs {
            self.logs.purge().await?;
            match tokio::fs::remove_dir(&self.dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::debug!("Keeping {}: {}", self.dir.display(), e),
            }
        }
        Ok(())
    }
}
