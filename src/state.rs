//! Pipe state machine.
//!
//! All pipe state lives on a single tokio task and is mutated only there.
//! The public handle posts commands over one channel; acknowledge handles
//! and finished disk operations post completions over another. Each lane
//! delivers in posting order, so the state machine can reason about every
//! transition as a discrete, uninterrupted step.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

use crate::chunks::ChunkList;
use crate::consumer::{Ack, AckSlot, Consumer};
use crate::error::Error;
use crate::pipe::{DataState, DEFAULT_THRESHOLD};
use crate::spill::{AppendDone, ReadDone, SpillFile};

/// Upper bound for a single spill-file read-back.
const READ_BLOCK: u64 = 64 * 1024;

/// Commands posted by the public handle.
pub(crate) enum Command {
    Write {
        data: Bytes,
        reply: oneshot::Sender<bool>,
    },
    Start {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    End {
        reply: oneshot::Sender<()>,
    },
    SetThreshold {
        threshold: u64,
        reply: oneshot::Sender<()>,
    },
    BufferSize {
        reply: oneshot::Sender<u64>,
    },
    DataState {
        reply: oneshot::Sender<DataState>,
    },
    IsStarted {
        reply: oneshot::Sender<bool>,
    },
    IsEnded {
        reply: oneshot::Sender<bool>,
    },
    Threshold {
        reply: oneshot::Sender<u64>,
    },
}

/// Completions posted by acknowledge handles and disk operations.
#[derive(Debug)]
pub(crate) enum Completion {
    /// An acknowledge payload landed in its dispatch slot.
    Ack { seq: u64 },
    Append(std::io::Result<AppendDone>),
    Read(std::io::Result<ReadDone>),
}

/// A dispatched `on_data` whose acknowledge has not arrived yet.
struct Dispatch {
    seq: u64,
    len: usize,
    slot: AckSlot,
}

/// One turn of the event loop: either lane may have produced something.
enum Step {
    Producer(Option<Command>),
    Internal(Option<Completion>),
}

pub(crate) struct PipeTask<C> {
    commands: mpsc::UnboundedReceiver<Command>,
    completions: mpsc::UnboundedReceiver<Completion>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    consumer: C,
    dir: PathBuf,
    threshold: u64,
    started: bool,
    ending: bool,
    ended: bool,
    failed: bool,
    closing: bool,
    mem: ChunkList,
    spill: Option<SpillFile>,
    dispatch: Option<Dispatch>,
    next_seq: u64,
}

impl<C: Consumer> PipeTask<C> {
    pub(crate) fn new(
        dir: PathBuf,
        consumer: C,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (completions_tx, completions) = mpsc::unbounded_channel();
        Self {
            commands,
            completions,
            completions_tx,
            consumer,
            dir,
            threshold: DEFAULT_THRESHOLD,
            started: false,
            ending: false,
            ended: false,
            failed: false,
            closing: false,
            mem: ChunkList::new(),
            spill: None,
            dispatch: None,
            next_seq: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            // Once the handle is gone, only wait out the in-flight disk
            // operation so the file handle is not released mid-write.
            if self.closing && !self.spill_busy() {
                break;
            }
            let step = tokio::select! {
                cmd = self.commands.recv(), if !self.closing => Step::Producer(cmd),
                completion = self.completions.recv() => Step::Internal(completion),
            };
            match step {
                Step::Producer(Some(cmd)) => self.on_command(cmd),
                Step::Producer(None) => self.closing = true,
                Step::Internal(Some(completion)) => self.on_completion(completion),
                // Unreachable: the task holds a completion sender.
                Step::Internal(None) => {}
            }
        }
        if let Some(spill) = self.spill.take() {
            spill.discard();
        }
        trace!("pipe: task exited");
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Write { data, reply } => {
                let result = self.on_write(data);
                let _ = reply.send(result);
            }
            Command::Start { reply } => {
                self.on_start();
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                if !self.failed {
                    self.started = false;
                }
                let _ = reply.send(());
            }
            Command::End { reply } => {
                self.on_end();
                let _ = reply.send(());
            }
            Command::SetThreshold { threshold, reply } => {
                if !self.failed {
                    self.threshold = threshold;
                }
                let _ = reply.send(());
            }
            Command::BufferSize { reply } => {
                let _ = reply.send(self.buffer_size());
            }
            Command::DataState { reply } => {
                let _ = reply.send(self.data_state());
            }
            Command::IsStarted { reply } => {
                let _ = reply.send(self.started);
            }
            Command::IsEnded { reply } => {
                let _ = reply.send(self.ended);
            }
            Command::Threshold { reply } => {
                let _ = reply.send(self.threshold);
            }
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Ack { seq } => self.on_ack(seq),
            Completion::Append(result) => self.on_append(result),
            Completion::Read(result) => self.on_read(result),
        }
    }

    /// Write path. Returns true iff nothing was retained.
    fn on_write(&mut self, data: Bytes) -> bool {
        if self.ending || self.failed {
            return false;
        }
        if data.is_empty() {
            return true;
        }
        if self.started && self.dispatch.is_none() && self.buffer_size() == 0 {
            // Live pass-through: hand the bytes straight to the consumer.
            let len = data.len();
            let (dispatch, ack) = self.begin_dispatch(len);
            trace!("pipe: live dispatch of {} bytes", len);
            self.consumer.on_data(data.clone(), ack);

            let sync = dispatch.slot.lock().unwrap().take();
            match sync {
                Some((consumed, done)) => {
                    assert!(
                        consumed <= len,
                        "pipe: consumer acknowledged {} bytes of a {} byte chunk",
                        consumed,
                        len
                    );
                    if done {
                        self.started = false;
                        debug!("pipe: paused by consumer");
                    }
                    let fully = consumed == len;
                    if !fully {
                        self.admit(data.slice(consumed..));
                        self.drain();
                    }
                    self.after_change();
                    fully && !done
                }
                None => {
                    // Deferred acknowledge: retain everything until it
                    // arrives. The buffered copy shares storage with the
                    // dispatched chunk.
                    self.dispatch = Some(dispatch);
                    self.admit(data);
                    false
                }
            }
        } else {
            self.admit(data);
            false
        }
    }

    /// Admits a chunk into the buffer, spilling to disk past the threshold.
    fn admit(&mut self, data: Bytes) {
        let len = data.len() as u64;
        if let Some(spill) = &mut self.spill {
            // Once spilled, every new write routes through the file so the
            // head-of-stream data already there keeps its place in line.
            spill.enqueue(data);
            spill.maybe_append(&self.completions_tx);
            return;
        }
        if self.buffer_size() + len <= self.threshold {
            self.mem.push_back(data);
            return;
        }
        debug!(
            "pipe: buffer of {} bytes exceeds threshold {}, spilling to disk",
            self.buffer_size() + len,
            self.threshold
        );
        let mut spill = SpillFile::new(self.dir.clone());
        for chunk in self.mem.take_all() {
            spill.enqueue(chunk);
        }
        spill.enqueue(data);
        spill.maybe_append(&self.completions_tx);
        self.spill = Some(spill);
    }

    fn on_start(&mut self) {
        if self.failed || self.started {
            return;
        }
        self.started = true;
        self.drain();
        self.after_change();
    }

    fn on_end(&mut self) {
        if self.failed || self.ending {
            return;
        }
        self.ending = true;
        debug!("pipe: end requested, {} bytes buffered", self.buffer_size());
        self.after_change();
    }

    /// Delivers buffered bytes to the consumer, one slice per dispatch.
    ///
    /// Consecutive synchronous acknowledgements are handled by looping, so
    /// an eager consumer drains the whole buffer without recursion.
    fn drain(&mut self) {
        loop {
            if !self.started || self.failed || self.closing || self.dispatch.is_some() {
                return;
            }
            if let Some(chunk) = self.mem.front() {
                let len = chunk.len();
                let (dispatch, ack) = self.begin_dispatch(len);
                trace!("pipe: dispatching {} buffered bytes", len);
                self.consumer.on_data(chunk, ack);

                let sync = dispatch.slot.lock().unwrap().take();
                match sync {
                    Some((consumed, done)) => self.settle(consumed, done, len),
                    None => {
                        self.dispatch = Some(dispatch);
                        return;
                    }
                }
            } else if let Some(spill) = &mut self.spill {
                if spill.busy() {
                    return;
                }
                let len = spill.readable().min(READ_BLOCK);
                if len == 0 {
                    // The remaining bytes are still queued for the append;
                    // its completion re-enters the drain.
                    spill.maybe_append(&self.completions_tx);
                    return;
                }
                spill.begin_read(len, &self.completions_tx);
                return;
            } else {
                return;
            }
        }
    }

    /// Acknowledge bookkeeping shared by the synchronous and deferred paths.
    fn settle(&mut self, consumed: usize, done: bool, len: usize) {
        assert!(
            consumed <= len,
            "pipe: consumer acknowledged {} bytes of a {} byte chunk",
            consumed,
            len
        );
        self.drop_from_head(consumed as u64);
        if done {
            self.started = false;
            debug!("pipe: paused by consumer");
        }
    }

    /// Drops acknowledged bytes from the logical head of the buffer:
    /// memory chunks first, then the spill-file read cursor.
    fn drop_from_head(&mut self, n: u64) {
        let dropped = self.mem.drop_front(n);
        let rest = n - dropped;
        if rest > 0 {
            if let Some(spill) = &mut self.spill {
                spill.consume(rest);
            } else {
                debug_assert!(false, "acknowledged bytes exceed the buffered head");
            }
        }
    }

    fn on_ack(&mut self, seq: u64) {
        let Some(dispatch) = &self.dispatch else {
            // Already handled synchronously, or the pipe failed meanwhile.
            return;
        };
        if dispatch.seq != seq {
            return;
        }
        let Some((consumed, done)) = dispatch.slot.lock().unwrap().take() else {
            return;
        };
        let len = dispatch.len;
        self.dispatch = None;
        trace!("pipe: ack of {}/{} bytes, done={}", consumed, len, done);
        self.settle(consumed, done, len);
        self.drain();
        self.after_change();
    }

    fn on_append(&mut self, result: std::io::Result<AppendDone>) {
        if self.spill.is_none() {
            return;
        }
        match result {
            Ok(done) => {
                let closing = self.closing;
                if let Some(spill) = &mut self.spill {
                    spill.finish_append(done);
                    if !closing {
                        spill.maybe_append(&self.completions_tx);
                    }
                }
                self.drain();
                self.after_change();
            }
            Err(err) => self.fail(err),
        }
    }

    fn on_read(&mut self, result: std::io::Result<ReadDone>) {
        if self.spill.is_none() {
            return;
        }
        match result {
            Ok(done) => {
                let ReadDone { file, data } = done;
                trace!("pipe: read {} bytes back from spill file", data.len());
                let closing = self.closing;
                if let Some(spill) = &mut self.spill {
                    spill.finish_read(file, data.len() as u64);
                    if !closing {
                        spill.maybe_append(&self.completions_tx);
                    }
                }
                self.mem.push_front(data);
                self.drain();
                self.after_change();
            }
            Err(err) => self.fail(err),
        }
    }

    /// Fatal error latch. The pipe stops interacting with the producer and
    /// consumer apart from the one `on_error` notification.
    fn fail(&mut self, err: std::io::Error) {
        if self.failed {
            return;
        }
        self.failed = true;
        self.started = false;
        self.dispatch = None;
        error!("pipe: spill file i/o failed: {}", err);
        if let Some(spill) = self.spill.take() {
            spill.discard();
        }
        if !self.closing {
            self.consumer.on_error(Error::Io(err));
        }
    }

    /// Post-transition check: releases the drained spill file and commits
    /// end-of-stream once everything has been consumed.
    fn after_change(&mut self) {
        if self.failed || self.closing {
            return;
        }
        if self.buffer_size() != 0 {
            return;
        }
        if let Some(spill) = &self.spill {
            if !spill.idle() {
                // A disk operation still owns the file; its completion
                // lands here again.
                return;
            }
        }
        if let Some(spill) = self.spill.take() {
            spill.discard();
            debug!("pipe: spill file drained, back to live state");
        }
        if self.ending && !self.ended && self.started && self.dispatch.is_none() {
            self.ended = true;
            debug!("pipe: ended");
            self.consumer.on_end();
        }
    }

    fn begin_dispatch(&mut self, len: usize) -> (Dispatch, Ack) {
        self.next_seq += 1;
        let seq = self.next_seq;
        let slot: AckSlot = Arc::new(Mutex::new(None));
        let ack = Ack::new(seq, slot.clone(), self.completions_tx.clone());
        (Dispatch { seq, len, slot }, ack)
    }

    /// Total buffered bytes: memory plus the spill-file span. The span
    /// counts queued and in-flight spill bytes eagerly.
    fn buffer_size(&self) -> u64 {
        self.mem.len() + self.spill.as_ref().map_or(0, |s| s.span())
    }

    fn data_state(&self) -> DataState {
        if self.spill.is_some() {
            DataState::InFile
        } else if !self.mem.is_empty() {
            DataState::InMemory
        } else {
            DataState::Live
        }
    }

    fn spill_busy(&self) -> bool {
        self.spill.as_ref().map_or(false, |s| s.busy())
    }
}
