//! Test support utilities for wharf-core
//!
//! In-memory client transports and engine constructors for exercising the
//! run/attach/wait paths without a terminal.

use crate::{Engine, Transport};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::oneshot;
use wharf_config::{EngineConfig, StreamsConfig};
use wharf_runtime::scripted::ScriptedLauncher;

const CLIENT_PIPE_CAPACITY: usize = 64 * 1024;

/// The client's ends of an in-memory [`Transport`].
///
/// Dropping the client closes the transport as a lost connection would.
pub struct Client {
    pub stdin: Option<DuplexStream>,
    pub stdout: BufReader<DuplexStream>,
    pub stderr: BufReader<DuplexStream>,
    _alive: oneshot::Sender<()>,
}

/// Build a transport and the client handle driving it
pub fn client(with_stdin: bool) -> (Client, Transport) {
    let (out_engine, out_client) = tokio::io::duplex(CLIENT_PIPE_CAPACITY);
    let (err_engine, err_client) = tokio::io::duplex(CLIENT_PIPE_CAPACITY);
    let (alive, closed) = oneshot::channel();
    let mut transport = Transport::new()
        .with_stdout(out_engine)
        .with_stderr(err_engine)
        .with_close_signal(closed);
    let stdin = if with_stdin {
        let (client_in, engine_in) = tokio::io::duplex(CLIENT_PIPE_CAPACITY);
        transport = transport.with_stdin(engine_in);
        Some(client_in)
    } else {
        None
    };
    (
        Client {
            stdin,
            stdout: BufReader::new(out_client),
            stderr: BufReader::new(err_client),
            _alive: alive,
        },
        transport,
    )
}

impl Client {
    pub async fn send(&mut self, data: &str) {
        let stdin = self.stdin.as_mut().expect("client has no stdin");
        stdin.write_all(data.as_bytes()).await.expect("write stdin");
        stdin.flush().await.expect("flush stdin");
    }

    /// Drop the stdin endpoint, as a disconnecting client would
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Next stdout line including its terminator; empty at EOF
    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.stdout.read_line(&mut line).await.expect("read stdout");
        line
    }

    pub async fn read_stderr_line(&mut self) -> String {
        let mut line = String::new();
        self.stderr.read_line(&mut line).await.expect("read stderr");
        line
    }

    pub async fn read_stdout_to_end(&mut self) -> String {
        let mut out = String::new();
        self.stdout
            .read_to_string(&mut out)
            .await
            .expect("read stdout");
        out
    }
}

/// Fail the test with `what` if `fut` does not finish within `limit`
pub async fn with_timeout<F: Future>(what: &str, limit: Duration, fut: F) -> F::Output {
    match tokio::time::timeout(limit, fut).await {
        Ok(out) => out,
        Err(_) => panic!("timeout: {}", what),
    }
}

/// Write `input` and expect `output` back on stdout, `count` times
pub async fn assert_pipe(client: &mut Client, input: &str, output: &str, count: usize) {
    for i in 0..count {
        client.send(input).await;
        let got = with_timeout("echo round trip", Duration::from_secs(5), client.read_line()).await;
        assert_eq!(got, output, "round trip {} of {}", i + 1, count);
    }
}

/// Poll `check` until it holds
pub async fn wait_until<F: Fn() -> bool>(what: &str, limit: Duration, check: F) {
    with_timeout(what, limit, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

/// Engine over `root` running scripted programs
pub fn scripted_engine(root: &Path) -> Engine {
    scripted_engine_with(root, StreamsConfig::default())
}

pub fn scripted_engine_with(root: &Path, streams: StreamsConfig) -> Engine {
    let config = EngineConfig {
        streams,
        ..EngineConfig::default()
    };
    Engine::new(config, root.to_path_buf(), Arc::new(ScriptedLauncher::new()))
}

/// Engine over `root` running real host processes
#[cfg(unix)]
pub fn native_engine(root: &Path) -> Engine {
    let config = EngineConfig::default();
    let launcher = wharf_runtime::NativeLauncher::new(&config);
    Engine::new(config, root.to_path_buf(), Arc::new(launcher))
}
