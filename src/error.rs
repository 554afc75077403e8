//! Error types for the pipe.

use thiserror::Error;

/// Error type for pipe operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The pipe task has terminated and no longer accepts calls.
    #[error("pipe: closed")]
    Closed,

    /// A spill file operation failed. Fatal for the pipe instance.
    #[error("pipe: disk i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pipe operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::Closed.to_string(), "pipe: closed");

        let err = Error::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(err.to_string().contains("boom"));
    }
}
