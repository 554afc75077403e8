//! Public pipe handle.

use std::path::PathBuf;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::state::{Command, PipeTask};

/// Default in-memory buffering threshold (1 MiB).
pub const DEFAULT_THRESHOLD: u64 = 1024 * 1024;

/// Which storage tier currently holds buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataState {
    /// Nothing is buffered; writes pass straight to the consumer.
    Live,
    /// Buffered bytes are held in memory chunks.
    InMemory,
    /// Buffered bytes have spilled to the temporary file.
    InFile,
}

/// Handle to a file-backed streaming pipe.
///
/// The pipe accepts writes from a single producer and delivers them, in
/// order, to the [`Consumer`] it was created with. Data written while the
/// pipe is stopped, or while the consumer is behind, is buffered in memory
/// up to a threshold and spills to a temporary file beyond it.
///
/// All state lives on a dedicated task; the handle posts commands to it and
/// awaits the reply, so calls made from one producer observe the pipe in
/// submission order. Dropping the handle tears the pipe down: the in-flight
/// disk operation (if any) is allowed to finish and the spill file is
/// removed.
///
/// # Example
///
/// ```rust,ignore
/// use spillpipe::{Ack, Bytes, Consumer, Pipe};
///
/// struct Printer;
///
/// impl Consumer for Printer {
///     fn on_data(&mut self, chunk: Bytes, ack: Ack) {
///         println!("{} bytes", chunk.len());
///         ack.consumed(chunk.len(), false);
///     }
/// }
///
/// let pipe = Pipe::new("/tmp", Printer);
/// pipe.start().await?;
/// pipe.write("hello").await?;
/// pipe.end().await?;
/// ```
pub struct Pipe {
    commands: mpsc::UnboundedSender<Command>,
}

impl Pipe {
    /// Creates a pipe whose spill file, if one is ever needed, lives in
    /// `dir`. Must be called from within a tokio runtime.
    ///
    /// The pipe starts stopped: written data is buffered until
    /// [`start`](Pipe::start) is called.
    pub fn new<C: Consumer>(dir: impl Into<PathBuf>, consumer: C) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let task = PipeTask::new(dir.into(), consumer, commands_rx);
        tokio::spawn(task.run());
        Self {
            commands: commands_tx,
        }
    }

    /// Offers bytes to the pipe.
    ///
    /// Returns `Ok(true)` iff the consumer synchronously accepted the full
    /// length without pausing, so nothing was retained. Returns `Ok(false)`
    /// when any portion was buffered, when the acknowledge was deferred,
    /// when the consumer paused the pipe, or when the write was rejected
    /// because [`end`](Pipe::end) was already called (a rejected write has
    /// no side effects).
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<bool> {
        let data = data.into();
        self.call(|reply| Command::Write { data, reply }).await
    }

    /// Starts delivery. Buffered data begins draining to the consumer.
    pub async fn start(&self) -> Result<()> {
        self.call(|reply| Command::Start { reply }).await
    }

    /// Pauses delivery. In-flight dispatches complete; subsequent writes
    /// are buffered.
    pub async fn stop(&self) -> Result<()> {
        self.call(|reply| Command::Stop { reply }).await
    }

    /// Signals end-of-stream. No further writes are accepted; the consumer's
    /// `on_end` fires once the buffer is fully drained on a started pipe.
    pub async fn end(&self) -> Result<()> {
        self.call(|reply| Command::End { reply }).await
    }

    /// Sets the in-memory buffering cap, affecting subsequent admission
    /// decisions.
    pub async fn set_threshold(&self, threshold: u64) -> Result<()> {
        self.call(|reply| Command::SetThreshold { threshold, reply })
            .await
    }

    /// Returns the in-memory buffering cap.
    pub async fn threshold(&self) -> Result<u64> {
        self.call(|reply| Command::Threshold { reply }).await
    }

    /// Returns the total number of buffered bytes (memory plus file).
    pub async fn buffer_size(&self) -> Result<u64> {
        self.call(|reply| Command::BufferSize { reply }).await
    }

    /// Returns which storage tier currently holds buffered bytes.
    pub async fn data_state(&self) -> Result<DataState> {
        self.call(|reply| Command::DataState { reply }).await
    }

    /// Whether the pipe is currently delivering to the consumer.
    pub async fn is_started(&self) -> Result<bool> {
        self.call(|reply| Command::IsStarted { reply }).await
    }

    /// Whether end-of-stream has been delivered.
    pub async fn is_ended(&self) -> Result<bool> {
        self.call(|reply| Command::IsEnded { reply }).await
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }
}
