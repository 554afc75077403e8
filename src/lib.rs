//! File-backed streaming pipe with backpressure and disk spill.
//!
//! A [`Pipe`] is a single-producer, single-consumer byte conduit. The
//! producer [`write`](Pipe::write)s chunks; the pipe delivers them, strictly
//! in order, to the [`Consumer`] callback and waits for an [`Ack`] telling
//! it how many bytes were accepted and whether to pause. Data the consumer
//! has not accepted yet is buffered: in memory up to a configurable
//! threshold, and in a temporary file beyond it. Once the backlog drains,
//! the file is removed and the pipe returns to live pass-through.
//!
//! # Flow control
//!
//! - The consumer acknowledges each dispatch with `(consumed, done)`.
//!   Partial consumption re-presents the unconsumed tail before any newer
//!   bytes; `done = true` pauses the pipe until [`start`](Pipe::start).
//! - [`write`](Pipe::write) returns whether the bytes were passed through
//!   without buffering, which a producer can use as a backpressure signal.
//! - [`end`](Pipe::end) stops admission and fires `on_end` exactly once,
//!   after every buffered byte has been consumed.
//!
//! # Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use spillpipe::{Ack, Consumer, Pipe};
//!
//! struct Stdout;
//!
//! impl Consumer for Stdout {
//!     fn on_data(&mut self, chunk: Bytes, ack: Ack) {
//!         print!("{}", String::from_utf8_lossy(&chunk));
//!         ack.consumed(chunk.len(), false);
//!     }
//!
//!     fn on_end(&mut self) {
//!         println!("<eof>");
//!     }
//! }
//!
//! # async fn run() -> spillpipe::Result<()> {
//! let pipe = Pipe::new(std::env::temp_dir(), Stdout);
//! pipe.start().await?;
//! pipe.write("hello").await?;
//! pipe.end().await?;
//! # Ok(())
//! # }
//! ```

mod chunks;
mod consumer;
mod error;
mod pipe;
mod spill;
mod state;

pub use consumer::{Ack, Consumer};
pub use error::{Error, Result};
pub use pipe::{DataState, Pipe, DEFAULT_THRESHOLD};
