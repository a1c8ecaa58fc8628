//! Persistent container output log
//!
//! Every line a container writes is appended to `<id>-json.log` as one JSON
//! object per line:
//!
//! ```text
//! {"log":"hello\n","stream":"stdout","time":"2024-01-01T00:00:00.000000001Z"}
//! ```
//!
//! A line that is not valid UTF-8 also carries its exact bytes, base64
//! encoded, in `bytes`. Lines longer than [`MAX_LINE`] are split.
//!
//! The file is append-only across restarts. A [`LogReader`] can replay it any
//! number of times and optionally follow it while the container runs.

use crate::lifecycle::{Phase, State};
use crate::stream::Chunk;
use crate::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use wharf_runtime::StreamKind;

/// Longest run of bytes buffered per stream before it is logged without a newline
pub const MAX_LINE: usize = 16 * 1024;

/// One line of container output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub log: String,
    pub stream: StreamKind,
    pub time: DateTime<Utc>,
    /// Exact payload when `log` is a lossy rendering of it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<String>,
}

impl LogRecord {
    fn new(stream: StreamKind, line: &[u8]) -> Self {
        let (log, bytes) = match std::str::from_utf8(line) {
            Ok(text) => (text.to_string(), None),
            Err(_) => (
                String::from_utf8_lossy(line).into_owned(),
                Some(base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    line,
                )),
            ),
        };
        Self {
            log,
            stream,
            time: Utc::now(),
            bytes,
        }
    }

    /// The payload exactly as the container wrote it
    pub fn payload(self) -> Vec<u8> {
        let Some(encoded) = self.bytes else {
            return self.log.into_bytes();
        };
        match base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &encoded) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Undecodable bytes in log record, using text: {}", e);
                self.log.into_bytes()
            }
        }
    }
}

/// Output format of a [`LogReader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// The stored JSON lines, verbatim
    #[default]
    Json,
    /// Only the `log` payloads, concatenated
    Raw,
}

impl FromStr for LogFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(Self::Json),
            "raw" => Ok(Self::Raw),
            other => Err(CoreError::InvalidArgument(format!(
                "unknown log format '{}', expected json or raw",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    pub format: LogFormat,
    /// Keep reading while the container runs
    pub follow: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            follow: false,
            stdout: true,
            stderr: true,
        }
    }
}

impl LogOptions {
    pub fn raw() -> Self {
        Self {
            format: LogFormat::Raw,
            ..Self::default()
        }
    }

    fn includes(&self, stream: StreamKind) -> bool {
        match stream {
            StreamKind::Stdout => self.stdout,
            StreamKind::Stderr => self.stderr,
        }
    }
}

/// Appends container output to its log file
#[derive(Debug)]
pub struct LogWriter {
    path: PathBuf,
    /// Bumped after every append so followers can wake up
    appended: watch::Sender<u64>,
}

impl LogWriter {
    pub fn new(path: PathBuf) -> Self {
        let (appended, _rx) = watch::channel(0);
        Self { path, appended }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consume `rx` until every sender is gone, appending complete lines.
    /// A stream holding [`MAX_LINE`] bytes without a newline is flushed as a
    /// partial line. A trailing partial line per stream is written when the
    /// input ends.
    pub(crate) fn spawn(self: &Arc<Self>, mut rx: mpsc::Receiver<Chunk>) -> JoinHandle<()> {
        let writer = self.clone();
        tokio::spawn(async move {
            let mut file = match writer.open().await {
                Ok(file) => Some(file),
                Err(e) => {
                    tracing::warn!("Failed to open log {}: {}", writer.path.display(), e);
                    None
                }
            };
            let mut partial: HashMap<StreamKind, Vec<u8>> = HashMap::new();

            while let Some(chunk) = rx.recv().await {
                let pending = partial.entry(chunk.stream).or_default();
                let mut offset = pending.len();
                pending.extend_from_slice(&chunk.data);

                let mut out = Vec::new();
                let mut start = 0;
                loop {
                    let rest = &pending[start..];
                    let newline = rest[offset - start..].iter().position(|&b| b == b'\n');
                    let end = match newline.map(|pos| offset + pos + 1) {
                        Some(end) if end - start <= MAX_LINE => end,
                        _ if rest.len() >= MAX_LINE => start + MAX_LINE,
                        _ => break,
                    };
                    encode_record(&mut out, chunk.stream, &pending[start..end]);
                    start = end;
                    offset = end;
                }
                pending.drain(..start);
                writer.append(&mut file, &out).await;
            }

            let mut out = Vec::new();
            for stream in [StreamKind::Stdout, StreamKind::Stderr] {
                if let Some(rest) = partial.remove(&stream) {
                    if !rest.is_empty() {
                        encode_record(&mut out, stream, &rest);
                    }
                }
            }
            writer.append(&mut file, &out).await;
            tracing::debug!("Log writer for {} finished", writer.path.display());
        })
    }

    async fn open(&self) -> std::io::Result<File> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
    }

    async fn append(&self, file: &mut Option<File>, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(f) = file.as_mut() {
            let written = match f.write_all(data).await {
                Ok(()) => f.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                tracing::warn!("Failed to append to log {}: {}", self.path.display(), e);
            }
        }
        self.appended.send_modify(|n| *n += 1);
    }

    /// Wake followers so they look for lines appended by another process
    pub(crate) fn touch(&self) {
        self.appended.send_modify(|n| *n += 1);
    }

    /// Open a reader over everything written so far
    pub fn reader(&self, options: LogOptions, state: watch::Receiver<State>) -> LogReader {
        LogReader {
            path: self.path.clone(),
            options,
            file: None,
            pending: Vec::new(),
            appended: self.appended.subscribe(),
            state,
        }
    }

    /// Delete the log file
    pub async fn purge(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn encode_record(out: &mut Vec<u8>, stream: StreamKind, line: &[u8]) {
    let record = LogRecord::new(stream, line);
    match serde_json::to_writer(&mut *out, &record) {
        Ok(()) => out.push(b'\n'),
        Err(e) => tracing::warn!("Failed to encode log record: {}", e),
    }
}

/// Sequential reader over a container log
#[derive(Debug)]
pub struct LogReader {
    path: PathBuf,
    options: LogOptions,
    file: Option<BufReader<File>>,
    pending: Vec<u8>,
    appended: watch::Receiver<u64>,
    state: watch::Receiver<State>,
}

impl LogReader {
    /// Next complete JSON line, or `None` at the end of the log.
    ///
    /// When following, the end is reached only once the container has exited.
    async fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let finished = self.state.borrow_and_update().phase == Phase::Exited;
            self.appended.borrow_and_update();

            if self.file.is_none() {
                match File::open(&self.path).await {
                    Ok(file) => self.file = Some(BufReader::new(file)),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }

            if let Some(file) = self.file.as_mut() {
                file.read_until(b'\n', &mut self.pending).await?;
                if self.pending.ends_with(b"\n") {
                    return Ok(Some(std::mem::take(&mut self.pending)));
                }
            }

            if !self.options.follow || finished {
                return Ok(None);
            }

            tokio::select! {
                changed = self.appended.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
                changed = self.state.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn next_entry(&mut self) -> Result<Option<(LogRecord, Vec<u8>)>> {
        while let Some(line) = self.next_line().await? {
            match serde_json::from_slice::<LogRecord>(&line) {
                Ok(record) if self.options.includes(record.stream) => {
                    return Ok(Some((record, line)))
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Skipping malformed line in {}: {}", self.path.display(), e);
                }
            }
        }
        Ok(None)
    }

    /// Next record matching the stream filter
    pub async fn next_record(&mut self) -> Result<Option<LogRecord>> {
        Ok(self.next_entry().await?.map(|(record, _)| record))
    }

    /// Next record rendered in the configured format
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let format = self.options.format;
        Ok(self.next_entry().await?.map(|(record, line)| match format {
            LogFormat::Json => line,
            LogFormat::Raw => record.payload(),
        }))
    }

    /// Render the whole (remaining) log into memory
    pub async fn read_all(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Stream the log into `writer`
    pub async fn copy_to<W: AsyncWrite + Unpin>(mut self, writer: &mut W) -> Result<()> {
        while let Some(chunk) = self.next_chunk().await? {
            writer.write_all(&chunk).await?;
            writer.flush().await?;
        }
        Ok(())
    }
}
