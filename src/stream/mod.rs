//! Audio streaming engine.
//!
//! Each `play` starts one stream task on the reactor's runtime. The task owns
//! the connection's outbound half for its whole lifetime: the reactor hands
//! the writer over after sending the `play` reply and gets it back from the
//! task's exit value. Nothing else can write to the connection meanwhile.
//!
//! # Lifecycle
//!
//! ```text
//! Starting ──writer received──▶ Streaming ──source exhausted──▶ Completed
//!                                   │ ──cancel flag seen─────▶ Stopped
//!                                   └─ I/O or decode error ──▶ Failed
//! ```
//!
//! Cancellation is cooperative: the flag is checked before every chunk, so a
//! stop takes effect within one chunk plus its pacing delay. Streams that end
//! on their own announce it with a [`StreamFinished`] message so the reactor
//! can reclaim the writer.

pub mod frame;
pub mod source;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::StreamingConfig;
use crate::error::{Error, Result};
use crate::model::SongKey;
use crate::report::ErrorReporter;
use crate::session::ConnId;

pub use frame::{Frame, FrameDecoder, Framing, LEGACY_SENTINEL};
pub use source::{AudioFormat, AudioSource, Encoding};

/// Outbound half of a connection, owned by whoever may currently write to it.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Chunks buffered between the file reader and the socket writer.
const CHUNK_BUFFER: usize = 4;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Unique id of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

impl StreamId {
    fn next() -> Self {
        Self(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Stream state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Starting = 0,
    Streaming = 1,
    Completed = 2,
    Stopped = 3,
    Failed = 4,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StreamState::Starting,
            1 => StreamState::Streaming,
            2 => StreamState::Completed,
            3 => StreamState::Stopped,
            _ => StreamState::Failed,
        }
    }
}

#[derive(Debug, Clone)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(StreamState::Starting as u8)))
    }

    fn get(&self) -> StreamState {
        StreamState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: StreamState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// What a stream task leaves behind.
pub struct StreamExit {
    /// The connection writer, returned to the reactor
    pub writer: Option<BoxedWriter>,
    pub state: StreamState,
}

impl fmt::Debug for StreamExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamExit")
            .field("writer", &self.writer.is_some())
            .field("state", &self.state)
            .finish()
    }
}

/// Sent by a stream that ended without being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFinished {
    pub conn: ConnId,
    pub stream: StreamId,
}

/// Control handle for a running stream.
pub struct StreamHandle {
    id: StreamId,
    cancel: Arc<AtomicBool>,
    state: SharedState,
    task: JoinHandle<StreamExit>,
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .finish()
    }
}

impl StreamHandle {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    /// Ask the stream to stop and wait until its task has exited.
    ///
    /// Once this returns the task no longer holds the writer, so no further
    /// bytes of this stream can reach the connection.
    pub async fn stop(self) -> StreamExit {
        self.cancel.store(true, Ordering::Release);
        self.join().await
    }

    /// Wait for the task to exit.
    pub async fn join(self) -> StreamExit {
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                error!(target: "stream", stream = %self.id, error = %e, "Stream task did not exit cleanly");
                self.state.set(StreamState::Failed);
                StreamExit {
                    writer: None,
                    state: StreamState::Failed,
                }
            }
        }
    }

    /// A handle whose task has nothing to do.
    #[cfg(test)]
    pub fn idle() -> Self {
        let state = SharedState::new();
        state.set(StreamState::Completed);
        Self {
            id: StreamId::next(),
            cancel: Arc::new(AtomicBool::new(false)),
            state,
            task: tokio::spawn(async {
                StreamExit {
                    writer: None,
                    state: StreamState::Completed,
                }
            }),
        }
    }
}

/// Everything needed to start a stream.
pub struct StreamRequest {
    pub conn: ConnId,
    pub song: SongKey,
    /// Account reported on failure
    pub identity: String,
    pub source: AudioSource,
    pub permit: OwnedSemaphorePermit,
}

/// Starts stream tasks and bounds how many run at once.
pub struct StreamEngine {
    config: StreamingConfig,
    permits: Arc<Semaphore>,
    capacity: usize,
    finished: mpsc::UnboundedSender<StreamFinished>,
    reporter: Arc<dyn ErrorReporter>,
}

impl StreamEngine {
    /// Create an engine allowing `capacity` concurrent streams. Natural
    /// stream endings are delivered on the returned receiver.
    pub fn new(
        config: StreamingConfig,
        capacity: usize,
        reporter: Arc<dyn ErrorReporter>,
    ) -> (Self, mpsc::UnboundedReceiver<StreamFinished>) {
        let (finished, finished_rx) = mpsc::unbounded_channel();
        let engine = Self {
            config,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            finished,
            reporter,
        };
        (engine, finished_rx)
    }

    /// Reserve a stream slot, or `None` when the limit is reached.
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).try_acquire_owned().ok()
    }

    /// Number of streams currently holding a slot.
    pub fn active(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Spawn the stream task.
    ///
    /// The task waits in `Starting` until the writer is sent through the
    /// returned channel. Dropping the sender instead ends it as `Failed`.
    pub fn start(&self, request: StreamRequest) -> (StreamHandle, oneshot::Sender<BoxedWriter>) {
        let (writer_tx, writer_rx) = oneshot::channel();
        let id = StreamId::next();
        let cancel = Arc::new(AtomicBool::new(false));
        let state = SharedState::new();

        let StreamRequest {
            conn,
            song,
            identity,
            source,
            permit,
        } = request;

        let task = StreamTask {
            id,
            conn,
            song,
            identity,
            framing: self.config.framing,
            chunk_size: self.config.chunk_size,
            pacing: self.config.pacing(),
            write_timeout: self.config.write_timeout(),
            cancel: Arc::clone(&cancel),
            state: state.clone(),
            finished: self.finished.clone(),
            reporter: Arc::clone(&self.reporter),
            _permit: permit,
        };
        info!(target: "stream", conn = %conn, stream = %id, song = %task.song, "Stream starting");

        let handle = StreamHandle {
            id,
            cancel,
            state,
            task: tokio::spawn(task.run(source, writer_rx)),
        };
        (handle, writer_tx)
    }
}

// ============================================================================
// Stream task
// ============================================================================

struct StreamTask {
    id: StreamId,
    conn: ConnId,
    song: SongKey,
    identity: String,
    framing: Framing,
    chunk_size: usize,
    pacing: Duration,
    write_timeout: Duration,
    cancel: Arc<AtomicBool>,
    state: SharedState,
    finished: mpsc::UnboundedSender<StreamFinished>,
    reporter: Arc<dyn ErrorReporter>,
    _permit: OwnedSemaphorePermit,
}

impl StreamTask {
    async fn run(self, source: AudioSource, writer_rx: oneshot::Receiver<BoxedWriter>) -> StreamExit {
        let Ok(mut writer) = writer_rx.await else {
            debug!(target: "stream", stream = %self.id, "Writer never handed over");
            self.state.set(StreamState::Failed);
            return StreamExit {
                writer: None,
                state: StreamState::Failed,
            };
        };

        self.state.set(StreamState::Streaming);
        let state = match self.stream_to(&mut writer, source).await {
            Ok(state) => state,
            Err(e) => {
                let e = e.context(format!("streaming {}", self.song));
                self.reporter.report(&self.identity, &e);
                StreamState::Failed
            }
        };
        self.state.set(state);
        info!(target: "stream", conn = %self.conn, stream = %self.id, ?state, "Stream ended");

        if state != StreamState::Stopped {
            let _ = self.finished.send(StreamFinished {
                conn: self.conn,
                stream: self.id,
            });
        }
        StreamExit {
            writer: Some(writer),
            state,
        }
    }

    async fn stream_to(&self, writer: &mut BoxedWriter, source: AudioSource) -> Result<StreamState> {
        self.send(writer, source.format().header().as_bytes()).await?;

        let (tx, mut rx) = mpsc::channel(CHUNK_BUFFER);
        let chunk_size = self.chunk_size;
        tokio::task::spawn_blocking(move || source.pump(chunk_size, tx));

        let mut chunks = 0u64;
        loop {
            if self.cancel.load(Ordering::Acquire) {
                if let Some(frame) = self.framing.stopped() {
                    self.send(writer, &frame).await?;
                }
                debug!(target: "stream", stream = %self.id, chunks, "Cancelled");
                return Ok(StreamState::Stopped);
            }

            match rx.recv().await {
                Some(Ok(chunk)) => {
                    self.send(writer, &self.framing.audio(&chunk)).await?;
                    chunks += 1;
                    tokio::time::sleep(self.pacing).await;
                }
                Some(Err(e)) => return Err(e),
                None => {
                    self.send(writer, &self.framing.completed()).await?;
                    debug!(target: "stream", stream = %self.id, chunks, "Source exhausted");
                    return Ok(StreamState::Completed);
                }
            }
        }
    }

    /// Write and flush `bytes`, failing if the peer doesn't take them in time.
    async fn send(&self, writer: &mut BoxedWriter, bytes: &[u8]) -> Result<()> {
        tokio::time::timeout(self.write_timeout, async {
            writer.write_all(bytes).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "peer stopped reading",
            ))
        })??;
        Ok(())
    }
}
