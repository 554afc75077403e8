//! Disk spill manager.
//!
//! Owns the temporary file that holds buffered bytes once the in-memory
//! threshold is exceeded. At most one disk operation is in flight at a time;
//! every completion is posted back to the pipe task over its completion
//! channel.

use std::io::{self, SeekFrom};
use std::path::PathBuf;

use bytes::Bytes;
use tempfile::{NamedTempFile, TempPath};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::state::Completion;

/// A finished append. The file handle travels with the operation; `path` is
/// present only on the append that created the file.
#[derive(Debug)]
pub(crate) struct AppendDone {
    pub(crate) file: File,
    pub(crate) path: Option<TempPath>,
    pub(crate) written: u64,
}

/// A finished read-back from the spill file.
#[derive(Debug)]
pub(crate) struct ReadDone {
    pub(crate) file: File,
    pub(crate) data: Bytes,
}

/// Temporary spill file plus the accounting around it.
///
/// `read_offset` is a logical cursor: it may run ahead of `committed` when
/// bytes are acknowledged before they have physically landed on disk. Reads
/// are always clamped to the committed region.
pub(crate) struct SpillFile {
    dir: PathBuf,
    file: Option<File>,
    path: Option<TempPath>,
    /// Bytes durably appended to the file.
    committed: u64,
    /// Bytes in the append currently in flight.
    in_flight: u64,
    /// Chunks waiting for the next append, in write order.
    queued: Vec<Bytes>,
    queued_bytes: u64,
    /// Logical read cursor.
    read_offset: u64,
    busy: bool,
}

impl SpillFile {
    pub(crate) fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            file: None,
            path: None,
            committed: 0,
            in_flight: 0,
            queued: Vec::new(),
            queued_bytes: 0,
            read_offset: 0,
            busy: false,
        }
    }

    /// Queues a chunk for the next append. Counted eagerly in [`span`].
    ///
    /// [`span`]: SpillFile::span
    pub(crate) fn enqueue(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.queued_bytes += chunk.len() as u64;
        self.queued.push(chunk);
    }

    /// Unconsumed bytes routed through the file, including queued and
    /// in-flight appends.
    pub(crate) fn span(&self) -> u64 {
        self.committed + self.in_flight + self.queued_bytes - self.read_offset
    }

    /// Committed bytes available for read-back.
    pub(crate) fn readable(&self) -> u64 {
        self.committed.saturating_sub(self.read_offset)
    }

    /// Whether a disk operation is in flight.
    pub(crate) fn busy(&self) -> bool {
        self.busy
    }

    /// Whether no operation is in flight and nothing is queued.
    pub(crate) fn idle(&self) -> bool {
        !self.busy && self.queued.is_empty()
    }

    /// Advances the logical read cursor without touching the file.
    ///
    /// Used when dispatched bytes are acknowledged before they were read
    /// back from disk.
    pub(crate) fn consume(&mut self, n: u64) {
        debug_assert!(n <= self.span());
        self.read_offset += n;
    }

    /// Starts an append of everything queued, if the file is free.
    ///
    /// The queued chunks are coalesced into a single positional write; the
    /// file is created lazily on the first append.
    pub(crate) fn maybe_append(&mut self, tx: &mpsc::UnboundedSender<Completion>) {
        if self.busy || self.queued.is_empty() {
            return;
        }
        let chunks = std::mem::take(&mut self.queued);
        let total = self.queued_bytes;
        self.queued_bytes = 0;
        self.in_flight = total;
        self.busy = true;

        let file = self.file.take();
        let dir = self.dir.clone();
        let offset = self.committed;
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = append_chunks(file, dir, offset, chunks, total).await;
            let _ = tx.send(Completion::Append(result));
        });
    }

    pub(crate) fn finish_append(&mut self, done: AppendDone) {
        let AppendDone {
            file,
            path,
            written,
        } = done;
        self.file = Some(file);
        if path.is_some() {
            self.path = path;
        }
        debug_assert_eq!(written, self.in_flight);
        self.committed += written;
        self.in_flight = 0;
        self.busy = false;
        trace!(
            "pipe: appended {} bytes to spill file ({} committed)",
            written,
            self.committed
        );
    }

    /// Starts a read of exactly `len` committed bytes at the read cursor.
    pub(crate) fn begin_read(&mut self, len: u64, tx: &mpsc::UnboundedSender<Completion>) {
        debug_assert!(len > 0 && len <= self.readable());
        let Some(file) = self.file.take() else {
            debug_assert!(false, "spill read without a file handle");
            return;
        };
        self.busy = true;

        let offset = self.read_offset;
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = read_exact_at(file, offset, len as usize).await;
            let _ = tx.send(Completion::Read(result));
        });
    }

    pub(crate) fn finish_read(&mut self, file: File, n: u64) {
        self.file = Some(file);
        self.read_offset += n;
        self.busy = false;
    }

    /// Drops the file handle and unlinks the file off the async threads.
    pub(crate) fn discard(mut self) {
        drop(self.file.take());
        if let Some(path) = self.path.take() {
            tokio::task::spawn_blocking(move || {
                if let Err(err) = path.close() {
                    warn!("pipe: failed to remove spill file: {}", err);
                }
            });
        }
    }
}

async fn append_chunks(
    file: Option<File>,
    dir: PathBuf,
    offset: u64,
    chunks: Vec<Bytes>,
    total: u64,
) -> io::Result<AppendDone> {
    let (mut file, path) = match file {
        Some(file) => (file, None),
        None => {
            let tmp = tokio::task::spawn_blocking(move || NamedTempFile::new_in(dir))
                .await
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err))??;
            let (std_file, path) = tmp.into_parts();
            debug!("pipe: created spill file {:?}", path);
            (File::from_std(std_file), Some(path))
        }
    };
    file.seek(SeekFrom::Start(offset)).await?;
    for chunk in &chunks {
        file.write_all(chunk).await?;
    }
    file.flush().await?;
    Ok(AppendDone {
        file,
        path,
        written: total,
    })
}

async fn read_exact_at(mut file: File, offset: u64, len: usize) -> io::Result<ReadDone> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(ReadDone {
        file,
        data: Bytes::from(buf),
    })
}
