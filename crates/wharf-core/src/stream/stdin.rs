//! The process side of stdin: a shared sink with an exclusive writer lease

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use wharf_runtime::ByteWriter;

struct Inner {
    writer: Mutex<Option<ByteWriter>>,
    /// Session currently holding the lease
    owner: StdMutex<Option<u64>>,
    closed: AtomicBool,
}

/// Writable end of a process stdin (or of a pty master).
///
/// Closing is idempotent: the first call shuts the writer down and drops it,
/// later calls are no-ops.
#[derive(Clone)]
pub struct StdinSink {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StdinSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdinSink")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StdinSink {
    pub fn new(writer: Option<ByteWriter>) -> Self {
        let closed = writer.is_none();
        Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(writer),
                owner: StdMutex::new(None),
                closed: AtomicBool::new(closed),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Write and flush `data` to the process
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut guard = self.inner.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin is closed"))?;
        writer.write_all(data).await?;
        writer.flush().await
    }

    /// Close the process stdin. Returns true if this call closed it.
    pub async fn close(&self) -> bool {
        let writer = self.inner.writer.lock().await.take();
        self.inner.closed.store(true, Ordering::Release);
        match writer {
            Some(mut writer) => {
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!("Error shutting down stdin: {}", e);
                }
                true
            }
            None => false,
        }
    }

    /// Take the exclusive right to feed this stdin on behalf of `session`
    pub fn acquire(&self, session: u64) -> Option<StdinLease> {
        let mut owner = self.inner.owner.lock().unwrap_or_else(|e| e.into_inner());
        if owner.is_some() {
            return None;
        }
        *owner = Some(session);
        Some(StdinLease {
            sink: self.clone(),
            session,
        })
    }

    pub fn is_leased(&self) -> bool {
        self.inner
            .owner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

/// Exclusive stdin ownership, released on drop
#[derive(Debug)]
pub struct StdinLease {
    sink: StdinSink,
    session: u64,
}

impl StdinLease {
    pub fn sink(&self) -> &StdinSink {
        &self.sink
    }
}

impl Drop for StdinLease {
    fn drop(&mut self) {
        let mut owner = self
            .sink
            .inner
            .owner
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if *owner == Some(self.session) {
            *owner = None;
        }
    }
}

/// Direct handle on a running container's stdin, bypassing attach sessions
#[derive(Debug, Clone)]
pub struct StdinPipe {
    sink: StdinSink,
}

impl StdinPipe {
    pub(crate) fn new(sink: StdinSink) -> Self {
        Self { sink }
    }

    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        self.sink.write(data).await
    }

    pub async fn close(&self) -> bool {
        self.sink.close().await
    }
}
