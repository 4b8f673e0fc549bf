use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the flat-file storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another process held the sentinel for longer than the wait budget.
    /// Callers skip the file for this pass and retry on the next scan.
    #[error("timed out after {waited:?} waiting for lock {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    /// Wrapper around IO errors (directory creation, reads, renames).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The CSV reader rejected a line.
    #[error("malformed record in {path} at line {line}: {reason}")]
    MalformedRow {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

impl StoreError {
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, StoreError::LockTimeout { .. })
    }
}
