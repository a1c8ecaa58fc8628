//! Attach sessions: one client's endpoints bound to a running process

use super::{Chunk, Delivery, Fanout, StdinLease, StdinSink, SubscriberId};
use crate::lifecycle::{run_exited, State};
use crate::policy::{on_stdin_closed, DisconnectAction, WiringMode};
use crate::{CoreError, Result};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use wharf_runtime::{ByteReader, ByteWriter};

/// A client's byte endpoints. Any of them may be absent.
#[derive(Default)]
pub struct Transport {
    pub stdin: Option<ByteReader>,
    pub stdout: Option<ByteWriter>,
    pub stderr: Option<ByteWriter>,
    /// Resolves (or loses its sender) when the client's connection is gone
    pub closed: Option<oneshot::Receiver<()>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("closed", &self.closed.is_some())
            .finish()
    }
}

impl Transport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current process's own standard streams
    pub fn stdio() -> Self {
        Self::new()
            .with_stdin(tokio::io::stdin())
            .with_stdout(tokio::io::stdout())
            .with_stderr(tokio::io::stderr())
    }

    pub fn with_stdin(mut self, reader: impl AsyncRead + Send + 'static) -> Self {
        self.stdin = Some(Box::pin(reader));
        self
    }

    pub fn with_stdout(mut self, writer: impl AsyncWrite + Send + 'static) -> Self {
        self.stdout = Some(Box::pin(writer));
        self
    }

    pub fn with_stderr(mut self, writer: impl AsyncWrite + Send + 'static) -> Self {
        self.stderr = Some(Box::pin(writer));
        self
    }

    /// End the session as soon as `closed` fires or its sender is dropped
    pub fn with_close_signal(mut self, closed: oneshot::Receiver<()>) -> Self {
        self.closed = Some(closed);
        self
    }
}

/// Which of the container's streams a session binds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachOptions {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl AttachOptions {
    pub fn all() -> Self {
        Self {
            stdin: true,
            stdout: true,
            stderr: true,
        }
    }

    /// stdout and stderr only
    pub fn outputs() -> Self {
        Self {
            stdin: false,
            stdout: true,
            stderr: true,
        }
    }

    /// Build from stream names such as `["stdin", "stdout"]`
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut opts = Self::default();
        for name in names {
            match name.as_ref().to_ascii_lowercase().as_str() {
                "stdin" => opts.stdin = true,
                "stdout" => opts.stdout = true,
                "stderr" => opts.stderr = true,
                other => {
                    return Err(CoreError::InvalidArgument(format!(
                        "unknown stream '{}', expected stdin, stdout or stderr",
                        other
                    )))
                }
            }
        }
        Ok(opts)
    }

    pub fn any_output(&self) -> bool {
        self.stdout || self.stderr
    }
}

/// Why an attach session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The process exited and all of its output was delivered
    Exited(i32),
    /// The client's stdin ended while the process kept running
    StdinClosed,
    /// The client's connection went away
    TransportClosed,
    /// The session was detached explicitly
    Detached,
}

impl SessionEnd {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

/// Stream wiring of one container run, shared by all of its sessions
#[derive(Debug, Clone)]
pub(crate) struct Wiring {
    pub container: String,
    pub mode: WiringMode,
    pub open_stdin: bool,
    pub stdin_once: bool,
    pub stdin: StdinSink,
    pub stdout: Fanout,
    pub stderr: Option<Fanout>,
    pub generation: u64,
    pub drain_timeout: Duration,
    pub chunk_size: usize,
}

impl Wiring {
    /// Apply the disconnect policy for a session that fed stdin
    async fn stdin_released(&self) -> DisconnectAction {
        let action = on_stdin_closed(self.mode, self.stdin_once);
        if action == DisconnectAction::CloseStdin && self.stdin.close().await {
            tracing::debug!("Closed stdin of container {}", self.container);
        }
        action
    }

    /// Bind `transport` to this run
    pub(crate) fn open(
        &self,
        state: watch::Receiver<State>,
        session: u64,
        opts: AttachOptions,
        transport: Transport,
    ) -> Result<AttachSession> {
        let Transport {
            stdin,
            stdout,
            stderr,
            closed,
        } = transport;

        let stdin = match stdin {
            Some(reader) if opts.stdin && self.open_stdin => {
                let lease = self
                    .stdin
                    .acquire(session)
                    .ok_or_else(|| CoreError::AlreadyAttached(self.container.clone()))?;
                Some((reader, lease))
            }
            Some(_) if opts.stdin => {
                tracing::debug!(
                    "Container {} was created without stdin, ignoring client stdin",
                    self.container
                );
                None
            }
            _ => None,
        };

        let mut bindings: Vec<(Fanout, ByteWriter)> = Vec::new();
        match self.mode {
            WiringMode::Pipe => {
                if let (true, Some(writer)) = (opts.stdout, stdout) {
                    bindings.push((self.stdout.clone(), writer));
                }
                if let (true, Some(writer), Some(fanout)) = (opts.stderr, stderr, &self.stderr) {
                    bindings.push((fanout.clone(), writer));
                }
            }
            WiringMode::Tty => {
                // the terminal merges both streams into one
                let stdout = stdout.filter(|_| opts.stdout);
                let stderr = stderr.filter(|_| opts.stderr);
                if let Some(writer) = stdout.or(stderr) {
                    bindings.push((self.stdout.clone(), writer));
                }
            }
        }

        let mut subscriptions = Vec::new();
        let mut outputs = JoinSet::new();
        for (fanout, writer) in bindings {
            let (id, rx) = fanout.subscribe(Delivery::Detachable);
            subscriptions.push((fanout, id));
            outputs.spawn(copy_output(rx, writer));
        }

        let holds_stdin = stdin.is_some();
        let stdin_copy: Option<StdinCopy> = stdin.map(|(reader, lease)| {
            Box::pin(copy_stdin(reader, lease, self.chunk_size)) as StdinCopy
        });

        let (detach_tx, detach_rx) = oneshot::channel();
        let task = tokio::spawn(drive(
            self.clone(),
            state,
            stdin_copy,
            outputs,
            subscriptions,
            closed,
            detach_rx,
        ));

        tracing::debug!(
            "Session {} attached to container {} (stdin: {})",
            session,
            self.container,
            holds_stdin
        );

        Ok(AttachSession {
            id: session,
            holds_stdin,
            detach: Some(detach_tx),
            task,
        })
    }
}

/// A live attach session.
///
/// Dropping the handle detaches the session.
#[derive(Debug)]
pub struct AttachSession {
    id: u64,
    holds_stdin: bool,
    detach: Option<oneshot::Sender<()>>,
    task: JoinHandle<SessionEnd>,
}

impl AttachSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this session owns the container's stdin
    pub fn holds_stdin(&self) -> bool {
        self.holds_stdin
    }

    /// Wait for the session to end on its own
    pub async fn wait(mut self) -> SessionEnd {
        match (&mut self.task).await {
            Ok(end) => end,
            Err(e) => {
                tracing::warn!("Attach session {} failed: {}", self.id, e);
                SessionEnd::TransportClosed
            }
        }
    }

    /// End the session now, as if the client had disconnected
    pub async fn detach(mut self) -> SessionEnd {
        if let Some(tx) = self.detach.take() {
            let _ = tx.send(());
        }
        self.wait().await
    }
}

type StdinCopy = Pin<Box<dyn Future<Output = StdinEnd> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StdinEnd {
    ClientEof,
    ClientError,
    /// The process stdin is gone; nothing more can be written
    ProcessClosed,
}

async fn copy_stdin(mut reader: ByteReader, lease: StdinLease, chunk_size: usize) -> StdinEnd {
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return StdinEnd::ClientEof,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Error reading client stdin: {}", e);
                return StdinEnd::ClientError;
            }
        };
        if let Err(e) = lease.sink().write(&buf[..n]).await {
            tracing::debug!("Error writing container stdin: {}", e);
            return StdinEnd::ProcessClosed;
        }
    }
}

async fn copy_output(mut rx: mpsc::Receiver<Chunk>, mut writer: ByteWriter) -> Result<()> {
    while let Some(chunk) = rx.recv().await {
        writer
            .write_all(&chunk.data)
            .await
            .map_err(|_| CoreError::TransportClosed)?;
        writer.flush().await.map_err(|_| CoreError::TransportClosed)?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

async fn drive(
    wiring: Wiring,
    state: watch::Receiver<State>,
    stdin: Option<StdinCopy>,
    mut outputs: JoinSet<Result<()>>,
    subscriptions: Vec<(Fanout, SubscriberId)>,
    closed: Option<oneshot::Receiver<()>>,
    mut detach_rx: oneshot::Receiver<()>,
) -> SessionEnd {
    let mut stdin_done = stdin.is_none();
    let stdin = async move {
        match stdin {
            Some(copy) => copy.await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(stdin);

    let closed = async move {
        match closed {
            Some(rx) => {
                let _ = rx.await;
            }
            None => std::future::pending().await,
        }
    };
    tokio::pin!(closed);

    let exit = run_exited(state, wiring.generation);
    tokio::pin!(exit);
    let mut exit_code: Option<i32> = None;

    // bounds how long a stuck client may hold the session after exit
    let grace = tokio::time::sleep(wiring.drain_timeout);
    tokio::pin!(grace);

    let end = loop {
        if let Some(code) = exit_code {
            if outputs.is_empty() {
                break SessionEnd::Exited(code);
            }
        }

        tokio::select! {
            end = &mut stdin, if !stdin_done => {
                stdin_done = true;
                if end == StdinEnd::ProcessClosed {
                    continue;
                }
                let action = wiring.stdin_released().await;
                if action.ends_session() {
                    break if end == StdinEnd::ClientError {
                        SessionEnd::TransportClosed
                    } else {
                        SessionEnd::StdinClosed
                    };
                }
            }
            Some(joined) = outputs.join_next(), if !outputs.is_empty() => {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => {
                        tracing::debug!("Client of container {} went away", wiring.container);
                        if !stdin_done {
                            wiring.stdin_released().await;
                        }
                        break SessionEnd::TransportClosed;
                    }
                }
            }
            code = &mut exit, if exit_code.is_none() => {
                exit_code = Some(code);
                grace.as_mut().reset(Instant::now() + wiring.drain_timeout);
            }
            () = &mut grace, if exit_code.is_some() => {
                tracing::warn!(
                    "Client of container {} did not drain output in time",
                    wiring.container
                );
                break SessionEnd::Exited(exit_code.unwrap_or(-1));
            }
            () = &mut closed => {
                tracing::debug!("Transport of container {} closed", wiring.container);
                if let Some(code) = exit_code {
                    break SessionEnd::Exited(code);
                }
                if !stdin_done {
                    wiring.stdin_released().await;
                }
                break SessionEnd::TransportClosed;
            }
            _ = &mut detach_rx => {
                if !stdin_done {
                    wiring.stdin_released().await;
                }
                break SessionEnd::Detached;
            }
        }
    };

    outputs.abort_all();
    for (fanout, id) in subscriptions {
        fanout.unsubscribe(id);
    }
    tracing::debug!("Session on container {} ended: {:?}", wiring.container, end);
    end
}
