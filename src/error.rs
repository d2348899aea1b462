//! Error types
//!
//! `LogError` covers the durable buffer; `SinkError` is what the orchestrator
//! surfaces to its caller. Duplicates are not errors and never appear here.

use std::io::{Error as IoError, ErrorKind};
use thiserror::Error;

/// Errors from the durable message log
#[derive(Debug, Error)]
pub enum LogError {
    #[error("log I/O error: {0}")]
    Io(IoError),
    /// A complete record whose checksum does not match its payload
    #[error("log corruption: {0}")]
    Corruption(String),
    #[error("log file not found: {0}")]
    NotFound(String),
    #[error("log disk full")]
    DiskFull,
    #[error("log fsync failed: {0}")]
    FsyncFailed(String),
}

impl From<IoError> for LogError {
    fn from(e: IoError) -> Self {
        match e.kind() {
            ErrorKind::NotFound => LogError::NotFound(e.to_string()),
            _ if e.to_string().contains("No space left") => LogError::DiskFull,
            _ => LogError::Io(e),
        }
    }
}

/// Errors surfaced by the sink core
#[derive(Debug, Error)]
pub enum SinkError {
    /// Upload failed but may succeed later; acks are withheld so the broker redelivers.
    #[error("upload of {key} failed (transient): {source}")]
    UploadTransient {
        key: String,
        #[source]
        source: IoError,
    },
    /// Upload can never succeed (rejected credentials, missing bucket, ...).
    #[error("upload of {key} failed (fatal): {source}")]
    UploadFatal {
        key: String,
        #[source]
        source: IoError,
    },
    /// The durable log can no longer be trusted.
    #[error("durability violation: {0}")]
    DurabilityViolation(#[from] LogError),
    #[error("batch mode '{0}' is not supported")]
    Unsupported(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The message source could not be read.
    #[error("failed to read input: {0}")]
    Input(#[source] IoError),
    #[error("final flush did not finish within {0:?}")]
    ShutdownTimeout(std::time::Duration),
}

impl SinkError {
    /// Classify an object store failure for the given key.
    pub fn from_upload(key: &str, source: IoError) -> Self {
        match source.kind() {
            ErrorKind::PermissionDenied | ErrorKind::InvalidInput | ErrorKind::NotFound => {
                SinkError::UploadFatal {
                    key: key.to_string(),
                    source,
                }
            }
            _ => SinkError::UploadTransient {
                key: key.to_string(),
                source,
            },
        }
    }

    /// Escalate a transient upload failure. Other errors are returned unchanged.
    pub fn into_fatal(self) -> Self {
        match self {
            SinkError::UploadTransient { key, source } => SinkError::UploadFatal { key, source },
            other => other,
        }
    }

    /// Whether the process must terminate so a supervisor can restart it.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SinkError::UploadTransient { .. })
    }

    /// Exit status the binary uses for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SinkError::Config(_) | SinkError::Unsupported(_) => 1,
            _ => 2,
        }
    }
}
