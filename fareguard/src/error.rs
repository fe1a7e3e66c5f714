// fareguard/src/error.rs
//
// Library error types. The binary wraps these in anyhow.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store command failed: {0}")]
    Command(String),
    #[error("cannot decode value at {key}: {reason}")]
    Decode { key: String, reason: String },
}

impl StoreError {
    /// Timeouts and dropped connections are worth another attempt;
    /// a rejected command or an undecodable value is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connection(_))
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("batch {batch_id}: {} of {total} store operations failed", failed.len())]
    Partial {
        batch_id: String,
        total:    usize,
        /// (op index, op description, last error)
        failed:   Vec<(usize, String, StoreError)>,
    },
    #[error("batch {batch_id}: offset commit failed: {source}")]
    Commit {
        batch_id: String,
        #[source]
        source:   StoreError,
    },
    #[error("cannot load committed offsets: {0}")]
    Offsets(StoreError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Write(#[from] WriteError),
}
