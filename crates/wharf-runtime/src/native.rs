//! Native launcher: runs the container command as a host process
//!
//! Pipe mode uses `tokio::process` with three piped stdio handles. Tty mode
//! allocates a pty pair, hands the slave to the child as stdin/stdout/stderr
//! and keeps the master. The child becomes a session leader with the pty as
//! its controlling terminal.

use crate::pty::{self, PtyStream};
use crate::{
    signal_exit_code, LaunchError, LaunchSpec, ProcessControl, ProcessHandle, ProcessIo,
    ProcessLauncher, Result,
};
use async_trait::async_trait;
use std::io;
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use wharf_config::{EngineConfig, ImagesConfig, TtyConfig};

use nix::libc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Launcher that spawns real OS processes
pub struct NativeLauncher {
    images: ImagesConfig,
    tty: TtyConfig,
}

impl NativeLauncher {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            images: config.images.clone(),
            tty: config.tty,
        }
    }

    fn resolve_rootfs(&self, image: &str) -> Result<PathBuf> {
        self.images
            .rootfs(image)
            .map(Path::to_path_buf)
            .ok_or_else(|| LaunchError::ImageNotFound(image.to_string()))
    }

    fn build_command(&self, spec: &LaunchSpec, rootfs: &Path) -> Result<Command> {
        let program = spec
            .program()
            .ok_or_else(|| LaunchError::CommandNotExecutable("empty command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(spec.args());
        cmd.env_clear();
        cmd.env("PATH", DEFAULT_PATH);
        if let Some(ref hostname) = spec.hostname {
            cmd.env("HOSTNAME", hostname);
        }
        if spec.tty {
            cmd.env("TERM", "xterm");
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let chroot_dir = if rootfs == Path::new("/") {
            if let Some(ref wd) = spec.working_dir {
                cmd.current_dir(wd);
            }
            None
        } else {
            Some(rootfs.to_path_buf())
        };

        let hostname = spec.hostname.clone();
        let working_dir = spec.working_dir.clone().unwrap_or_else(|| "/".to_string());
        let tty = spec.tty;

        // SAFETY: the closure runs between fork and exec and only makes
        // async-signal-safe system calls.
        unsafe {
            cmd.pre_exec(move || {
                if tty {
                    nix::unistd::setsid().map_err(io::Error::from)?;
                    if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                if let Some(ref name) = hostname {
                    // Needs CAP_SYS_ADMIN; unprivileged engines fall back to $HOSTNAME
                    if nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWUTS).is_ok() {
                        let _ = nix::unistd::sethostname(name);
                    }
                }
                if let Some(ref root) = chroot_dir {
                    nix::unistd::chroot(root.as_path()).map_err(io::Error::from)?;
                    nix::unistd::chdir(working_dir.as_str()).map_err(io::Error::from)?;
                }
                Ok(())
            });
        }

        Ok(cmd)
    }

    fn spawn(mut cmd: Command, program: &str) -> Result<Child> {
        cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                LaunchError::CommandNotExecutable(format!("{}: {}", program, e))
            }
            _ => LaunchError::Spawn(e),
        })
    }

    fn launch_pipes(&self, spec: &LaunchSpec, mut cmd: Command) -> Result<(Child, ProcessIo)> {
        cmd.stdin(if spec.open_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = Self::spawn(cmd, spec.program().unwrap_or_default())?;

        let stdin = child
            .stdin
            .take()
            .map(|s| Box::pin(s) as crate::ByteWriter);
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LaunchError::Spawn(io::Error::other("stdout was not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| LaunchError::Spawn(io::Error::other("stderr was not captured")))?;

        Ok((
            child,
            ProcessIo::Pipes {
                stdin,
                stdout: Box::pin(stdout),
                stderr: Box::pin(stderr),
            },
        ))
    }

    fn launch_tty(&self, spec: &LaunchSpec, mut cmd: Command) -> Result<(Child, ProcessIo)> {
        let pair = pty::open_pair(self.tty.rows, self.tty.cols)
            .map_err(|e| LaunchError::Pty(e.to_string()))?;

        // Each Stdio::from_raw_fd takes ownership of its fd, so stdin and stdout
        // get dups and stderr takes the original.
        let slave_raw = pair.slave.into_raw_fd();
        // SAFETY: slave_raw is a valid fd we own; dup returns new owned fds
        unsafe {
            let stdin_fd = libc::dup(slave_raw);
            let stdout_fd = libc::dup(slave_raw);
            if stdin_fd < 0 || stdout_fd < 0 {
                let err = io::Error::last_os_error();
                libc::close(slave_raw);
                return Err(LaunchError::Pty(err.to_string()));
            }
            cmd.stdin(Stdio::from_raw_fd(stdin_fd));
            cmd.stdout(Stdio::from_raw_fd(stdout_fd));
            cmd.stderr(Stdio::from_raw_fd(slave_raw));
        }

        let child = Self::spawn(cmd, spec.program().unwrap_or_default())?;

        let output = PtyStream::new(pair.master).map_err(|e| LaunchError::Pty(e.to_string()))?;
        let input = output
            .try_clone()
            .map_err(|e| LaunchError::Pty(e.to_string()))?;

        Ok((
            child,
            ProcessIo::Tty {
                input: Box::pin(input),
                output: Box::pin(output),
            },
        ))
    }
}

#[async_trait]
impl ProcessLauncher for NativeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
        let rootfs = self.resolve_rootfs(&spec.image)?;
        let cmd = self.build_command(spec, &rootfs)?;

        // `cmd` is consumed here so the parent's copies of the slave fds are
        // closed once the child has them; otherwise the master never sees EOF.
        let (mut child, io) = if spec.tty {
            self.launch_tty(spec, cmd)?
        } else {
            self.launch_pipes(spec, cmd)?
        };

        let pid = child.id();
        tracing::debug!(
            "Spawned {} for {} (pid {:?}, tty={})",
            spec.program().unwrap_or_default(),
            spec.id.short(),
            pid,
            spec.tty
        );

        let (tx, exited) = oneshot::channel();
        let short = spec.id.short().to_string();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status
                    .code()
                    .or_else(|| status.signal().map(signal_exit_code))
                    .unwrap_or(-1),
                Err(e) => {
                    tracing::warn!("Failed to wait for {}: {}", short, e);
                    -1
                }
            };
            let _ = tx.send(code);
        });

        Ok(ProcessHandle {
            pid,
            io,
            control: Arc::new(NativeControl { pid }),
            exited,
        })
    }

    fn name(&self) -> &'static str {
        "native"
    }
}

struct NativeControl {
    pid: Option<u32>,
}

impl ProcessControl for NativeControl {
    fn signal(&self, signal: i32) -> Result<()> {
        let pid = self
            .pid
            .ok_or_else(|| LaunchError::Signal("process has no pid".to_string()))?;
        let signal = Signal::try_from(signal).map_err(|e| LaunchError::Signal(e.to_string()))?;
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) => Ok(()),
            // already reaped
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(LaunchError::Signal(e.to_string())),
        }
    }
}

/// True while a process with this pid exists
pub fn process_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContainerId;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn spec(cmd: &[&str]) -> LaunchSpec {
        LaunchSpec {
            id: ContainerId::generate(),
            image: "host".to_string(),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            env: vec![],
            working_dir: None,
            hostname: None,
            tty: false,
            open_stdin: true,
        }
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(i32::MAX as u32));
    }

    #[tokio::test]
    async fn test_unknown_image_is_rejected() {
        let launcher = NativeLauncher::new(&EngineConfig::default());
        let mut s = spec(&["/bin/true"]);
        s.image = "no-such-image".to_string();
        let err = launcher.launch(&s).await.unwrap_err();
        assert!(matches!(err, LaunchError::ImageNotFound(ref i) if i == "no-such-image"));
    }

    #[tokio::test]
    async fn test_missing_program_is_not_executable() {
        let launcher = NativeLauncher::new(&EngineConfig::default());
        let err = launcher
            .launch(&spec(&["/definitely/not/here"]))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::CommandNotExecutable(_)));

        let err = launcher.launch(&spec(&[])).await.unwrap_err();
        assert!(matches!(err, LaunchError::CommandNotExecutable(_)));
    }

    #[tokio::test]
    async fn test_pipe_cat_exits_on_stdin_eof() {
        let launcher = NativeLauncher::new(&EngineConfig::default());
        let handle = launcher.launch(&spec(&["/bin/cat"])).await.unwrap();
        let ProcessIo::Pipes {
            stdin,
            mut stdout,
            stderr: _,
        } = handle.io
        else {
            panic!("expected pipes");
        };
        let mut stdin = stdin.unwrap();
        stdin.write_all(b"hello\n").await.unwrap();
        stdin.shutdown().await.unwrap();
        drop(stdin);

        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello\n");
        assert_eq!(handle.exited.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exit_code_and_signal() {
        let launcher = NativeLauncher::new(&EngineConfig::default());
        let handle = launcher
            .launch(&spec(&["/bin/sh", "-c", "exit 3"]))
            .await
            .unwrap();
        assert_eq!(handle.exited.await.unwrap(), 3);

        let handle = launcher.launch(&spec(&["/bin/cat"])).await.unwrap();
        handle.control.signal(libc::SIGKILL).unwrap();
        assert_eq!(handle.exited.await.unwrap(), 128 + libc::SIGKILL);
    }

    #[tokio::test]
    async fn test_env_and_hostname_variable() {
        let launcher = NativeLauncher::new(&EngineConfig::default());
        let mut s = spec(&["/bin/sh", "-c", "echo $GREETING $HOSTNAME"]);
        s.env = vec![("GREETING".to_string(), "hi".to_string())];
        s.hostname = Some("foobar".to_string());
        let handle = launcher.launch(&s).await.unwrap();
        let ProcessIo::Pipes { mut stdout, .. } = handle.io else {
            panic!("expected pipes");
        };
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hi foobar\n");
    }

    #[tokio::test]
    async fn test_tty_cat_survives_until_killed() {
        let launcher = NativeLauncher::new(&EngineConfig::default());
        let mut s = spec(&["/bin/cat"]);
        s.tty = true;
        let handle = match launcher.launch(&s).await {
            Ok(handle) => handle,
            Err(LaunchError::Pty(e)) => {
                eprintln!("Skipping test: pty unavailable: {}", e);
                return;
            }
            Err(e) => panic!("launch failed: {}", e),
        };
        let ProcessIo::Tty {
            mut input,
            mut output,
        } = handle.io
        else {
            panic!("expected tty");
        };

        input.write_all(b"hello\n").await.unwrap();
        let mut seen = String::new();
        let mut buf = [0u8; 256];
        // line discipline echo plus cat's own copy
        while seen.matches("hello").count() < 2 {
            let n = output.read(&mut buf).await.unwrap();
            assert!(n > 0);
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }

        // shutting down our writer does not close the master
        input.shutdown().await.unwrap();
        let mut exited = handle.exited;
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(300), &mut exited)
                .await
                .is_err(),
            "cat exited although the pty master is still open"
        );

        handle.control.signal(libc::SIGKILL).unwrap();
        assert_eq!(exited.await.unwrap(), 128 + libc::SIGKILL);
    }
}
