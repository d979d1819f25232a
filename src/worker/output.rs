//! Output capture and fan-out for a single job.
//!
//! One writer task reads the job's combined stdout/stderr and, for every
//! chunk, appends it to the job's log file, appends it to the in-memory
//! history, and hands it to every live subscriber. Subscribers replay the
//! history they missed and then follow the live chunks through a bounded
//! queue of their own.
//!
//! A subscriber whose queue fills up is dropped and sees
//! [`WorkerError::SlowConsumer`] once it has drained what it already has.
//! The writer never waits on a subscriber.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, WorkerError};
use crate::worker::job::JobId;

#[derive(Debug)]
struct Subscriber {
    tx: mpsc::Sender<Bytes>,
    lagged: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct State {
    history: Vec<Bytes>,
    closed: bool,
    subscribers: HashMap<u64, Subscriber>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    queue_capacity: usize,
    next_subscriber: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Single-writer, multi-reader fan-out of one job's output.
#[derive(Debug, Clone)]
pub struct OutputBroadcaster {
    shared: Arc<Shared>,
}

impl OutputBroadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                queue_capacity: queue_capacity.max(1),
                next_subscriber: AtomicU64::new(0),
            }),
        }
    }

    /// Append a chunk to the history and offer it to every subscriber.
    pub fn publish(&self, chunk: Bytes) {
        let mut state = self.shared.lock();
        if state.closed {
            tracing::warn!(len = chunk.len(), "Dropping output published after close");
            return;
        }
        state.history.push(chunk.clone());
        state.subscribers.retain(|id, sub| match sub.tx.try_send(chunk.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                sub.lagged.store(true, Ordering::Release);
                tracing::warn!(subscriber = id, "Dropping slow output subscriber");
                false
            }
            // Receiver went away without deregistering.
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Mark the history complete. Every subscriber ends once it catches up.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        // Dropping the senders lets each receiver drain and then see the end.
        state.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Copy of everything captured so far.
    pub fn history(&self) -> Vec<Bytes> {
        self.shared.lock().history.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subscribers.len()
    }

    /// Open a cursor that yields the full history and then every new chunk.
    ///
    /// The history snapshot and the live registration happen under one lock,
    /// so a chunk is either part of the replay or queued live, never both.
    pub fn subscribe(&self, cancel: CancellationToken) -> Subscription {
        let mut state = self.shared.lock();
        let backlog: VecDeque<Bytes> = state.history.iter().cloned().collect();
        let lagged = Arc::new(AtomicBool::new(false));
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let rx = if state.closed {
            None
        } else {
            let (tx, rx) = mpsc::channel(self.shared.queue_capacity);
            state.subscribers.insert(
                id,
                Subscriber {
                    tx,
                    lagged: lagged.clone(),
                },
            );
            Some(rx)
        };

        Subscription {
            id,
            backlog,
            rx,
            lagged,
            cancel,
            shared: self.shared.clone(),
        }
    }
}

enum Delivery {
    Cancelled,
    Chunk(Bytes),
    Ended,
}

/// A read cursor into a job's output.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    backlog: VecDeque<Bytes>,
    rx: Option<mpsc::Receiver<Bytes>>,
    lagged: Arc<AtomicBool>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
}

impl Subscription {
    /// Next chunk in production order.
    ///
    /// Returns `None` at the end of the output or once the cancellation token
    /// fires, and `Some(Err(SlowConsumer))` exactly once if this subscriber
    /// was dropped for falling behind.
    pub async fn next(&mut self) -> Option<Result<Bytes>> {
        if self.cancel.is_cancelled() {
            self.detach();
            return None;
        }
        if let Some(chunk) = self.backlog.pop_front() {
            return Some(Ok(chunk));
        }

        let rx = self.rx.as_mut()?;
        let delivery = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Delivery::Cancelled,
            msg = rx.recv() => msg.map_or(Delivery::Ended, Delivery::Chunk),
        };

        match delivery {
            Delivery::Chunk(chunk) => Some(Ok(chunk)),
            Delivery::Cancelled => {
                self.detach();
                None
            }
            Delivery::Ended => {
                self.rx = None;
                if self.lagged.load(Ordering::Acquire) {
                    Some(Err(WorkerError::SlowConsumer))
                } else {
                    None
                }
            }
        }
    }

    /// Release the live queue right away instead of waiting for the next
    /// publish to notice the closed receiver.
    fn detach(&mut self) {
        self.backlog.clear();
        if self.rx.take().is_some() {
            self.shared.lock().subscribers.remove(&self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Append-only log file for one job. Write failures disable persistence for
/// the rest of the job; live delivery does not depend on it.
#[derive(Debug)]
pub(crate) struct LogFile {
    path: PathBuf,
    file: Option<tokio::fs::File>,
}

impl LogFile {
    pub(crate) fn path_for(log_dir: &Path, job_id: &JobId) -> PathBuf {
        log_dir.join(format!("{}.log", job_id))
    }

    pub(crate) async fn create(path: PathBuf) -> Self {
        let opened = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
        }
        .await;

        match opened {
            Ok(file) => Self {
                path,
                file: Some(file),
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot open job log, output will not be persisted");
                Self { path, file: None }
            }
        }
    }

    async fn append(&mut self, chunk: &[u8]) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(chunk).await {
                tracing::warn!(path = %self.path.display(), error = %e, "Job log write failed, disabling persistence");
                self.file = None;
            }
        }
    }

    async fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush().await {
                tracing::warn!(path = %self.path.display(), error = %e, "Job log flush failed");
            }
        }
    }
}

/// The writer loop: read until EOF, persist and publish each chunk, then
/// flush the log and close the broadcaster.
pub(crate) async fn capture<R>(
    job_id: JobId,
    mut reader: R,
    mut log: LogFile,
    broadcaster: OutputBroadcaster,
    buffer_size: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0usize;

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                log.append(&chunk).await;
                broadcaster.publish(chunk);
                total += n;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Reading job output failed");
                break;
            }
        }
    }

    log.flush().await;
    broadcaster.close();
    tracing::debug!(job_id = %job_id, bytes = total, "Output capture finished");
}
