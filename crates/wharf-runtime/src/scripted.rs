//! In-process launcher for tests
//!
//! Runs a handful of well-known programs (`cat`, `echo`, `hostname`, `sleep`,
//! `seq`, `true`, `false` and `sh -c` with `&&`-joined steps) as tokio tasks
//! wired through in-memory duplex pipes, so engine behavior can be tested
//! without spawning OS processes.
//!
//! In tty mode the "terminal" never reports EOF to the program when the
//! engine shuts its input half down, mirroring a pty master that stays open,
//! and output newlines are translated to `\r\n`.

use crate::{
    signal_exit_code, ByteReader, ByteWriter, LaunchError, LaunchSpec, ProcessControl,
    ProcessHandle, ProcessIo, ProcessLauncher, Result,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{oneshot, watch};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Records which launches happened
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRecord {
    pub id: String,
    pub cmd: Vec<String>,
    pub tty: bool,
}

/// Launcher that runs scripted programs in-process
pub struct ScriptedLauncher {
    images: HashSet<String>,
    pub launches: Arc<Mutex<Vec<LaunchRecord>>>,
}

impl Default for ScriptedLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedLauncher {
    /// Launcher that knows the `host` image only
    pub fn new() -> Self {
        let mut images = HashSet::new();
        images.insert(wharf_config::HOST_IMAGE.to_string());
        Self {
            images,
            launches: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Also accept `image`
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.images.insert(image.into());
        self
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }
}

#[derive(Debug, Clone)]
enum Step {
    Cat,
    Echo { text: String, stderr: bool },
    Sleep(Duration),
    Seq(u64),
    Exit(i32),
}

fn parse_program(program: &str, args: &[String], hostname: &str) -> Option<Vec<Step>> {
    let base = program.rsplit('/').next().unwrap_or(program);
    let steps = match base {
        "cat" => vec![Step::Cat],
        "echo" => vec![Step::Echo {
            text: args.join(" "),
            stderr: false,
        }],
        "hostname" => vec![Step::Echo {
            text: hostname.to_string(),
            stderr: false,
        }],
        "true" => vec![Step::Exit(0)],
        "false" => vec![Step::Exit(1)],
        "sleep" => vec![Step::Sleep(Duration::from_secs_f64(
            args.first()?.parse().ok()?,
        ))],
        "seq" => vec![Step::Seq(args.first()?.parse().ok()?)],
        "sh" if args.len() == 2 && args[0] == "-c" => {
            let mut steps = Vec::new();
            for part in args[1].split("&&") {
                let words: Vec<String> = part.split_whitespace().map(str::to_string).collect();
                let (first, rest) = words.split_first()?;
                if first == "exit" {
                    steps.push(Step::Exit(rest.first()?.parse().ok()?));
                    continue;
                }
                if first == "echo" && rest.last().map(String::as_str) == Some(">&2") {
                    steps.push(Step::Echo {
                        text: rest[..rest.len() - 1].join(" "),
                        stderr: true,
                    });
                    continue;
                }
                steps.extend(parse_program(first, rest, hostname)?);
            }
            steps
        }
        _ => return None,
    };
    Some(steps)
}

/// Writer side of a scripted program's output
struct Output {
    writer: DuplexStream,
    crlf: bool,
}

impl Output {
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if self.crlf {
            let translated: Vec<u8> = data
                .iter()
                .flat_map(|&b| if b == b'\n' { vec![b'\r', b'\n'] } else { vec![b] })
                .collect();
            self.writer.write_all(&translated).await
        } else {
            self.writer.write_all(data).await
        }
    }
}

async fn run_steps(
    steps: Vec<Step>,
    stdin: Option<DuplexStream>,
    mut stdout: Output,
    mut stderr: Option<Output>,
) -> i32 {
    let mut stdin = stdin.map(BufReader::new);
    for step in steps {
        let result = match step {
            Step::Cat => {
                let Some(reader) = stdin.as_mut() else {
                    continue;
                };
                let mut line = Vec::new();
                loop {
                    line.clear();
                    match reader.read_until(b'\n', &mut line).await {
                        Ok(0) => break Ok(()),
                        Ok(_) => {
                            if let Err(e) = stdout.write(&line).await {
                                break Err(e);
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
            Step::Echo { text, stderr: to_stderr } => {
                let line = format!("{}\n", text);
                match (to_stderr, stderr.as_mut()) {
                    (true, Some(err)) => err.write(line.as_bytes()).await,
                    _ => stdout.write(line.as_bytes()).await,
                }
            }
            Step::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
            Step::Seq(n) => {
                let mut result = Ok(());
                for i in 1..=n {
                    result = stdout.write(format!("{}\n", i).as_bytes()).await;
                    if result.is_err() {
                        break;
                    }
                }
                result
            }
            Step::Exit(code) => return code,
        };
        if result.is_err() {
            // EPIPE
            return 141;
        }
    }
    0
}

/// Wraps the engine-facing half of a tty input pipe so that shutting it down
/// does not deliver EOF to the program.
struct TtyInput {
    inner: DuplexStream,
}

impl AsyncWrite for TtyInput {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

struct ScriptedControl {
    kill_tx: watch::Sender<Option<i32>>,
}

impl ProcessControl for ScriptedControl {
    fn signal(&self, signal: i32) -> Result<()> {
        self.kill_tx.send_replace(Some(signal));
        Ok(())
    }
}

fn boxed_reader(r: impl AsyncRead + Send + 'static) -> ByteReader {
    Box::pin(r)
}

fn boxed_writer(w: impl AsyncWrite + Send + 'static) -> ByteWriter {
    Box::pin(w)
}

#[async_trait]
impl ProcessLauncher for ScriptedLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
        if !self.images.contains(&spec.image) {
            return Err(LaunchError::ImageNotFound(spec.image.clone()));
        }
        let program = spec
            .program()
            .ok_or_else(|| LaunchError::CommandNotExecutable("empty command".to_string()))?;
        let hostname = spec
            .hostname
            .clone()
            .unwrap_or_else(|| spec.id.short().to_string());
        let steps = parse_program(program, spec.args(), &hostname)
            .ok_or_else(|| LaunchError::CommandNotExecutable(program.to_string()))?;

        self.launches.lock().unwrap().push(LaunchRecord {
            id: spec.id.0.clone(),
            cmd: spec.cmd.clone(),
            tty: spec.tty,
        });

        let (engine_out, program_out) = tokio::io::duplex(PIPE_CAPACITY);
        let (io, program_in, program_err) = if spec.tty {
            let (engine_in, program_in) = tokio::io::duplex(PIPE_CAPACITY);
            (
                ProcessIo::Tty {
                    input: boxed_writer(TtyInput { inner: engine_in }),
                    output: boxed_reader(engine_out),
                },
                Some(program_in),
                None,
            )
        } else {
            let (engine_err, program_err) = tokio::io::duplex(PIPE_CAPACITY);
            let (stdin, program_in) = if spec.open_stdin {
                let (engine_in, program_in) = tokio::io::duplex(PIPE_CAPACITY);
                (Some(boxed_writer(engine_in)), Some(program_in))
            } else {
                (None, None)
            };
            (
                ProcessIo::Pipes {
                    stdin,
                    stdout: boxed_reader(engine_out),
                    stderr: boxed_reader(engine_err),
                },
                program_in,
                Some(program_err),
            )
        };

        let crlf = spec.tty;
        let stdout = Output {
            writer: program_out,
            crlf,
        };
        let stderr = program_err.map(|writer| Output { writer, crlf });

        let (kill_tx, mut kill_rx) = watch::channel(None);
        let (exit_tx, exited) = oneshot::channel();
        tokio::spawn(async move {
            let killed = async {
                let signal = kill_rx.wait_for(Option::is_some).await.map(|s| *s);
                match signal {
                    Ok(signal) => signal_exit_code(signal.unwrap_or(9)),
                    // control dropped: nobody can signal us any more
                    Err(_) => std::future::pending::<i32>().await,
                }
            };
            let code = tokio::select! {
                code = run_steps(steps, program_in, stdout, stderr) => code,
                code = killed => code,
            };
            let _ = exit_tx.send(code);
        });

        Ok(ProcessHandle {
            pid: None,
            io,
            control: Arc::new(ScriptedControl { kill_tx }),
            exited,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
