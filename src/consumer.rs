//! Consumer interface and the acknowledge handle.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Error;
use crate::state::Completion;

/// Shared slot the acknowledge payload is written into.
///
/// The pipe task inspects the slot right after `on_data` returns, which is
/// how a synchronous acknowledge is told apart from a deferred one.
pub(crate) type AckSlot = Arc<Mutex<Option<(usize, bool)>>>;

/// Receiver side of the pipe.
///
/// All methods run on the pipe task. `on_data` hands over a non-empty chunk
/// together with a one-shot [`Ack`]; the pipe re-presents unconsumed bytes
/// and does not dispatch again until the acknowledge arrives.
pub trait Consumer: Send + 'static {
    /// Called with the next run of buffered bytes while the pipe is started.
    fn on_data(&mut self, chunk: Bytes, ack: Ack);

    /// Called exactly once when the pipe has ended and every byte has been
    /// consumed.
    fn on_end(&mut self) {}

    /// Called when a spill file operation fails. The pipe is unusable
    /// afterwards and `on_end` will not fire.
    fn on_error(&mut self, _error: Error) {}
}

/// One-shot acknowledge handle for a single `on_data` dispatch.
///
/// The handle may be invoked from any thread; the payload is marshalled onto
/// the pipe task. Consuming `self` makes acknowledging twice impossible.
/// Dropping the handle without acknowledging counts as `(0, done = true)`.
pub struct Ack {
    seq: u64,
    slot: AckSlot,
    tx: mpsc::UnboundedSender<Completion>,
    fired: bool,
}

impl Ack {
    pub(crate) fn new(seq: u64, slot: AckSlot, tx: mpsc::UnboundedSender<Completion>) -> Self {
        Self {
            seq,
            slot,
            tx,
            fired: false,
        }
    }

    /// Reports how many bytes were accepted and whether the pipe should
    /// pause.
    ///
    /// `consumed` must not exceed the dispatched chunk length. `done = true`
    /// stops the pipe; buffered data is held until the next `start`.
    pub fn consumed(mut self, consumed: usize, done: bool) {
        self.fire(consumed, done);
    }

    fn fire(&mut self, consumed: usize, done: bool) {
        if self.fired {
            return;
        }
        self.fired = true;
        *self.slot.lock().unwrap() = Some((consumed, done));
        // The send fails only when the pipe task is gone; the acknowledge
        // becomes a no-op then.
        let _ = self.tx.send(Completion::Ack { seq: self.seq });
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        if !self.fired {
            warn!("pipe: ack dropped without being invoked, pausing");
            self.fire(0, true);
        }
    }
}
