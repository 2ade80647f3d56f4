use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the acquisition and streaming core.
///
/// Variants map to distinct recovery strategies: hash mismatches and missing
/// files are retried inside the orchestrator loop, network errors are retried
/// per chunk, cancellation is surfaced as a `Cancel` feedback event rather
/// than a failure.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Invalid input detected before any work started.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A required file or directory does not exist.
    #[error("not found: {0:?}")]
    NotFound(PathBuf),

    /// Computed digest differs from the expected one.
    #[error("hash mismatch for {path:?}: expected {expected}, got {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Transport-level download failure (DNS, timeout, non-2xx).
    #[error("network error: {0}")]
    Network(String),

    /// The remote reported no usable content length.
    #[error("unknown download size for {0}")]
    UnknownSize(String),

    /// Archive decoding failed.
    #[error("extraction error: {0}")]
    Extraction(String),

    /// Archive format not recognised by suffix.
    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(String),

    /// An archive entry resolved outside the destination directory.
    #[error("archive entry escapes destination: {0}")]
    Security(String),

    /// Target volume cannot hold the model.
    #[error("insufficient disk space under {0:?}")]
    InsufficientSpace(PathBuf),

    /// Cooperative cancellation was observed.
    #[error("operation cancelled")]
    Cancelled,

    /// The native engine failed to construct.
    #[error("native engine init failed: {0}")]
    NativeInit(String),

    /// A public API was called after disposal.
    #[error("module already disposed")]
    Disposed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Whether this error represents cooperative cancellation.
    ///
    /// Cancellation is reported as a `Cancel` feedback event, never `Failed`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RuntimeError::Cancelled)
    }

    /// Whether the orchestrator loop may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::NotFound(_)
                | RuntimeError::HashMismatch { .. }
                | RuntimeError::Network(_)
                | RuntimeError::Extraction(_)
                | RuntimeError::Io(_)
        )
    }
}

/// Result alias used throughout the core.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
