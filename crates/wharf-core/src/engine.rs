//! The engine: creates containers and implements the run, attach and wait
//! entry points on top of them

use crate::container::{Container, ContainerConfig};
use crate::logs::{LogOptions, LogReader};
use crate::registry::Registry;
use crate::state::{containers_dir, load_records};
use crate::stream::{AttachOptions, SessionEnd, Transport};
use crate::{CoreError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use wharf_config::EngineConfig;
use wharf_runtime::{ByteWriter, ContainerId, ProcessLauncher};

/// Options of a single `run`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub image: String,
    pub cmd: Vec<String>,
    /// Keep stdin open and attach it
    pub interactive: bool,
    pub tty: bool,
    /// Start in the background and return right away
    pub detach: bool,
    /// Streams to attach; defaults to stdout and stderr, plus stdin when interactive
    pub attach: Option<AttachOptions>,
    pub hostname: Option<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
}

impl RunOptions {
    pub fn new<S: Into<String>>(image: impl Into<String>, cmd: impl IntoIterator<Item = S>) -> Self {
        Self {
            image: image.into(),
            cmd: cmd.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    fn attach_options(&self) -> Result<AttachOptions> {
        if self.detach {
            if self.attach.is_some() {
                return Err(CoreError::InvalidArgument(
                    "conflicting options: attach and detach".to_string(),
                ));
            }
            return Ok(AttachOptions::default());
        }
        Ok(self.attach.unwrap_or(AttachOptions {
            stdin: self.interactive,
            stdout: true,
            stderr: true,
        }))
    }

    fn container_config(&self, attach: &AttachOptions) -> ContainerConfig {
        ContainerConfig {
            image: self.image.clone(),
            cmd: self.cmd.clone(),
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
            hostname: self.hostname.clone(),
            tty: self.tty,
            open_stdin: self.interactive,
            // a detached container outlives any single client
            stdin_once: self.interactive && attach.stdin && !self.detach,
        }
    }
}

/// Result of [`Engine::cmd_run`]
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub id: ContainerId,
    /// Set when the process exited while the client was attached
    pub exit_code: Option<i32>,
    /// How the attach session ended, if there was one
    pub session: Option<SessionEnd>,
}

/// Container engine over one state root
pub struct Engine {
    config: EngineConfig,
    root: PathBuf,
    launcher: Arc<dyn ProcessLauncher>,
    registry: Registry,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("root", &self.root)
            .field("launcher", &self.launcher.name())
            .finish()
    }
}

impl Engine {
    /// Engine with an empty registry
    pub fn new(config: EngineConfig, root: PathBuf, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            config,
            root,
            launcher,
            registry: Registry::new(),
        }
    }

    /// Engine over `root`, restoring the containers saved there
    pub async fn open(
        config: EngineConfig,
        root: PathBuf,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<Self> {
        std::fs::create_dir_all(containers_dir(&root))?;
        let engine = Self::new(config, root, launcher);
        let restored = engine.load().await?;
        tracing::debug!(
            "Restored {} container(s) from {}",
            restored,
            engine.root.display()
        );
        Ok(engine)
    }

    /// Load every saved container into the registry.
    ///
    /// A container saved as running has lost its process and is marked exited,
    /// unless another live engine process still supervises it.
    pub async fn load(&self) -> Result<usize> {
        let records = load_records(&self.root)?;
        let count = records.len();
        for (dir, mut record) in records {
            if record.settle_stale() {
                tracing::warn!(
                    "Container {} was running when the engine stopped, marking it exited",
                    record.id.short()
                );
                if let Err(e) = record.clone().store(dir.clone()).await {
                    tracing::warn!("Failed to save container {}: {}", record.id.short(), e);
                }
            }
            let remote = record.state.running && record.supervised_elsewhere();
            let container = Arc::new(Container::from_record(
                record,
                dir,
                self.config.streams.clone(),
                self.launcher.clone(),
            ));
            if remote {
                tracing::debug!(
                    "Container {} is supervised by another process",
                    container.short_id()
                );
                container.observe_remote();
            }
            self.registry.insert(container).await;
        }
        Ok(count)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Register a new container in the `Created` state
    pub async fn create(&self, config: ContainerConfig) -> Result<Arc<Container>> {
        if config.cmd.is_empty() {
            return Err(CoreError::InvalidArgument(
                "no command specified".to_string(),
            ));
        }
        let id = ContainerId::generate();
        let dir = containers_dir(&self.root).join(id.as_ref());
        let container = Arc::new(Container::new(
            id,
            config,
            dir,
            self.config.streams.clone(),
            self.launcher.clone(),
        ));
        container.persist().await?;
        self.registry.insert(container.clone()).await;
        tracing::info!(
            "Created container {} ({} {})",
            container.short_id(),
            container.config().image,
            container.config().command_line()
        );
        Ok(container)
    }

    /// Look a container up by id or unique id prefix
    pub async fn container(&self, reference: &str) -> Result<Arc<Container>> {
        self.registry.resolve(reference).await
    }

    pub async fn list(&self) -> Vec<Arc<Container>> {
        self.registry.list().await
    }

    /// Create a container, start it and, unless detached, attach `transport`
    /// and wait for the process to exit.
    ///
    /// The short id is written to the client's stdout when running detached or
    /// when neither stdout nor stderr is attached. A failed start leaves the
    /// container registered in the `Created` state.
    pub async fn cmd_run(&self, opts: RunOptions, mut transport: Transport) -> Result<RunOutcome> {
        let attach = opts.attach_options()?;
        let container = self.create(opts.container_config(&attach)).await?;
        let id = container.id().clone();

        if opts.detach {
            container.start().await?;
            if let Some(mut out) = transport.stdout.take() {
                print_id(&mut out, &id).await;
            }
            return Ok(RunOutcome {
                id,
                exit_code: None,
                session: None,
            });
        }

        if !attach.any_output() {
            if let Some(mut out) = transport.stdout.take() {
                print_id(&mut out, &id).await;
            }
        }

        let session = container.start_attached(attach, transport).await?;
        let end = session.wait().await;
        Ok(RunOutcome {
            id,
            exit_code: end.exit_code(),
            session: Some(end),
        })
    }

    /// Attach `transport` to a running container until the session ends.
    ///
    /// Stdin is attached when the container has one; if another client holds
    /// it this fails with [`CoreError::AlreadyAttached`].
    pub async fn cmd_attach(&self, reference: &str, transport: Transport) -> Result<SessionEnd> {
        let container = self.container(reference).await?;
        let opts = AttachOptions {
            stdin: container.config().open_stdin,
            ..AttachOptions::outputs()
        };
        let session = container.attach(opts, transport)?;
        Ok(session.wait().await)
    }

    /// Block until the container exits and return its exit code
    pub async fn cmd_wait(&self, reference: &str) -> Result<i32> {
        let container = self.container(reference).await?;
        container.wait().await
    }

    /// Open a reader over a container's log
    pub async fn logs(&self, reference: &str, options: LogOptions) -> Result<LogReader> {
        let container = self.container(reference).await?;
        Ok(container.read_log(options))
    }

    /// Forget a stopped container and delete its files
    pub async fn remove(&self, reference: &str, purge_logs: bool) -> Result<ContainerId> {
        let container = self.container(reference).await?;
        container.destroy(purge_logs).await?;
        self.registry.remove(container.id()).await;
        tracing::info!("Removed container {}", container.short_id());
        Ok(container.id().clone())
    }
}

async fn print_id(out: &mut ByteWriter, id: &ContainerId) {
    let line = format!("{}\n", id.short());
    let written = match out.write_all(line.as_bytes()).await {
        Ok(()) => out.flush().await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        tracing::debug!("Could not print container id {}: {}", id.short(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_attach_options() {
        let opts = RunOptions::new("host", ["cat"]);
        assert_eq!(opts.attach_options().unwrap(), AttachOptions::outputs());

        let interactive = RunOptions {
            interactive: true,
            ..RunOptions::new("host", ["cat"])
        };
        assert_eq!(interactive.attach_options().unwrap(), AttachOptions::all());
    }

    #[test]
    fn test_detach_conflicts_with_attach() {
        let opts = RunOptions {
            detach: true,
            attach: Some(AttachOptions::outputs()),
            ..RunOptions::new("host", ["cat"])
        };
        assert!(matches!(
            opts.attach_options(),
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_stdin_once_only_for_attached_interactive_runs() {
        let attached = RunOptions {
            interactive: true,
            ..RunOptions::new("host", ["cat"])
        };
        let config = attached.container_config(&attached.attach_options().unwrap());
        assert!(config.open_stdin && config.stdin_once);

        let detached = RunOptions {
            interactive: true,
            detach: true,
            ..RunOptions::new("host", ["cat"])
        };
        let config = detached.container_config(&detached.attach_options().unwrap());
        assert!(config.open_stdin);
        assert!(!config.stdin_once);

        let stdout_only = RunOptions {
            interactive: true,
            attach: Some(AttachOptions::outputs()),
            ..RunOptions::new("host", ["cat"])
        };
        let config = stdout_only.container_config(&stdout_only.attach_options().unwrap());
        assert!(!config.stdin_once);
    }
}
