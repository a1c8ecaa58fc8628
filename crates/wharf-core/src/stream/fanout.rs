//! Fan-out of one process output stream to many subscribers

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use wharf_runtime::{ByteReader, StreamKind};

/// A chunk of process output tagged with its stream
#[derive(Debug, Clone)]
pub struct Chunk {
    pub stream: StreamKind,
    pub data: Arc<[u8]>,
}

/// How a subscriber is treated when it cannot keep up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The producer waits for room; nothing is ever dropped
    Lossless,
    /// A subscriber whose buffer is full is detached
    Detachable,
}

pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<Chunk>,
    delivery: Delivery,
}

struct Inner {
    subscribers: Vec<Subscriber>,
    next_id: SubscriberId,
    closed: bool,
}

/// Broadcaster for a single output stream.
///
/// Every chunk published reaches every live subscriber in order. A slow
/// detachable subscriber is cut off instead of stalling the process.
#[derive(Clone)]
pub struct Fanout {
    kind: StreamKind,
    buffer: usize,
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for Fanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fanout")
            .field("kind", &self.kind)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Fanout {
    pub fn new(kind: StreamKind, buffer: usize) -> Self {
        Self {
            kind,
            buffer: buffer.max(1),
            inner: Arc::new(Mutex::new(Inner {
                subscribers: Vec::new(),
                next_id: 0,
                closed: false,
            })),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a poisoned list is still a valid list
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an existing sender. On a closed fanout the sender is dropped
    /// right away, so its receiver sees end of stream.
    pub fn add(&self, tx: mpsc::Sender<Chunk>, delivery: Delivery) -> SubscriberId {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.closed {
            inner.subscribers.push(Subscriber { id, tx, delivery });
        }
        id
    }

    /// Subscribe with a fresh channel sized by the configured buffer
    pub fn subscribe(&self, delivery: Delivery) -> (SubscriberId, mpsc::Receiver<Chunk>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        (self.add(tx, delivery), rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.lock().subscribers.retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Deliver a chunk to every subscriber
    pub async fn publish(&self, chunk: Chunk) {
        let lossless: Vec<(SubscriberId, mpsc::Sender<Chunk>)> = {
            let mut inner = self.lock();
            let kind = self.kind;
            inner.subscribers.retain(|s| match s.delivery {
                Delivery::Lossless => !s.tx.is_closed(),
                Delivery::Detachable => match s.tx.try_send(chunk.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            "Detaching slow {} subscriber {}: buffer full",
                            kind,
                            s.id
                        );
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                },
            });
            inner
                .subscribers
                .iter()
                .filter(|s| s.delivery == Delivery::Lossless)
                .map(|s| (s.id, s.tx.clone()))
                .collect()
        };

        for (id, tx) in lossless {
            if tx.send(chunk.clone()).await.is_err() {
                self.unsubscribe(id);
            }
        }
    }

    /// End the stream: every subscriber's receiver drains and then sees `None`
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }
}

/// Copy a process output into its fanout until EOF, then close the fanout
pub(crate) fn spawn_pump(
    mut reader: ByteReader,
    fanout: Fanout,
    chunk_size: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; chunk_size.max(1)];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    fanout
                        .publish(Chunk {
                            stream: fanout.kind(),
                            data: Arc::from(&buf[..n]),
                        })
                        .await;
                }
                Err(e) => {
                    tracing::warn!("Error reading container {}: {}", fanout.kind(), e);
                    break;
                }
            }
        }
        tracing::debug!("Container {} reached EOF", fanout.kind());
        fanout.close();
    })
}
