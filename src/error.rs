// src/error.rs
//
// Error taxonomy shared by every layer of the crate.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Errors surfaced by the store adapters, the tree builder and the service layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("upload of {size} bytes exceeds the limit of {limit} bytes")]
    SizeLimitExceeded { size: u64, limit: u64 },

    #[error("upload of {key} failed: {source}")]
    UploadFailed {
        key: String,
        #[source]
        source: Box<StorageError>,
    },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation cancelled")]
    Cancelled,

    /// A bulk operation kept going past failures; `failed` names the keys it could not process.
    #[error("{operation} of {path} failed for {} key(s)", .failed.len())]
    PartialFailure {
        operation: &'static str,
        path: String,
        failed: Vec<String>,
    },

    /// Retryable backend failure (timeouts, throttling, 5xx). Only escapes once retries run out.
    #[error("transient storage error: {0:#}")]
    Transient(anyhow::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StorageError {
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        StorageError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn upload_failed(key: impl Into<String>, source: StorageError) -> Self {
        StorageError::UploadFailed {
            key: key.into(),
            source: Box::new(source),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StorageError::Cancelled)
    }

    /// HTTP-equivalent status for the controller layer.
    pub fn status_code(&self) -> u16 {
        match self {
            StorageError::NotFound(_) => 404,
            StorageError::InvalidPath { .. } => 400,
            StorageError::SizeLimitExceeded { .. } => 413,
            StorageError::PermissionDenied(_) => 403,
            // nginx convention for "client closed request"
            StorageError::Cancelled => 499,
            StorageError::Transient(_) => 503,
            StorageError::UploadFailed { source, .. } => match source.as_ref() {
                StorageError::Transient(_) => 503,
                _ => 500,
            },
            StorageError::PartialFailure { .. } | StorageError::Internal(_) => 500,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(e.to_string()),
            ErrorKind::PermissionDenied => StorageError::PermissionDenied(e.to_string()),
            ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
                StorageError::Transient(e.into())
            }
            _ => StorageError::Internal(e.into()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Internal(e.into())
    }
}
