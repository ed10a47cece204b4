//! Error types shared by the object-store adapters, the transfer workers and
//! the listing layer.
//!
//! Every failure is classified so callers can decide between retrying,
//! surfacing a permission problem, or giving up on a single transfer. Message
//! translation stays shallow on purpose: `user_message()` gives a plain
//! sentence and the `Display` output carries the raw detail.

use std::{io, path::PathBuf};
use thiserror::Error;

use crate::models::transfer::TransferStatus;

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, throttling, 5xx. Retried with backoff.
    Transient,
    /// Access denied. Surfaced immediately, never retried.
    Permission,
    /// Object or bucket missing. Terminal for the transfer.
    NotFound,
    /// Local file or directory problems detected before touching the network.
    LocalPrecondition,
    /// Downloaded bytes do not match what the store advertised.
    Integrity,
    /// Anything else that retrying will not fix.
    Terminal,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

/// Typed failure returned by an [`ObjectStore`](crate::services::object_store::ObjectStore).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("transient store failure: {message}")]
    Transient { message: String },
    #[error("request throttled: {message}")]
    Throttled { message: String },
    #[error("access denied for `{key}`: {message}")]
    PermissionDenied { key: String, message: String },
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("multipart session `{0}` not found")]
    SessionNotFound(String),
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("range {start}-{end} not satisfiable for `{key}`")]
    InvalidRange { key: String, start: u64, end: u64 },
    #[error("store backend failure: {message}")]
    Backend { message: String },
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Transient { .. } | StoreError::Throttled { .. } => ErrorClass::Transient,
            StoreError::PermissionDenied { .. } => ErrorClass::Permission,
            StoreError::NotFound(_) | StoreError::SessionNotFound(_) => ErrorClass::NotFound,
            StoreError::InvalidKey(_)
            | StoreError::InvalidRange { .. }
            | StoreError::Backend { .. } => ErrorClass::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        StoreError::Backend {
            message: msg.into(),
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => {
                StoreError::Transient {
                    message: err.to_string(),
                }
            }
            io::ErrorKind::PermissionDenied => StoreError::PermissionDenied {
                key: String::new(),
                message: err.to_string(),
            },
            _ => StoreError::backend(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => StoreError::Transient {
                message: err.to_string(),
            },
            other => StoreError::backend(other.to_string()),
        }
    }
}

/// Failure of a transfer, an engine call, or a listing operation.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("source file `{}` no longer exists", .0.display())]
    SourceMissing(PathBuf),
    #[error("destination directory `{}` does not exist", .0.display())]
    DestinationMissing(PathBuf),
    #[error("size mismatch for `{key}`: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },
    #[error("checksum mismatch for `{key}`: store reported {expected}, local file is {actual}")]
    IntegrityMismatch {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("transfer {0} not found")]
    TransferNotFound(i64),
    #[error("transfer {id} is {status}, expected {expected}")]
    InvalidState {
        id: i64,
        status: TransferStatus,
        expected: &'static str,
    },
    #[error("transfer engine has shut down")]
    EngineStopped,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Repository(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type TransferResult<T> = Result<T, TransferError>;

impl TransferError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransferError::SourceMissing(_) | TransferError::DestinationMissing(_) => {
                ErrorClass::LocalPrecondition
            }
            TransferError::SizeMismatch { .. } | TransferError::IntegrityMismatch { .. } => {
                ErrorClass::Integrity
            }
            TransferError::TransferNotFound(_) => ErrorClass::NotFound,
            TransferError::Store(err) => err.class(),
            TransferError::Io(err) if err.kind() == io::ErrorKind::NotFound => {
                ErrorClass::LocalPrecondition
            }
            TransferError::Io(err) if err.kind() == io::ErrorKind::StorageFull => {
                ErrorClass::LocalPrecondition
            }
            TransferError::Io(_)
            | TransferError::Repository(_)
            | TransferError::InvalidState { .. }
            | TransferError::EngineStopped => ErrorClass::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Plain-language summary for display; the `Display` form is the raw detail.
    pub fn user_message(&self) -> String {
        match self {
            TransferError::SourceMissing(_) => "Source file no longer exists.".into(),
            TransferError::DestinationMissing(_) => {
                "Destination directory no longer exists.".into()
            }
            TransferError::SizeMismatch { .. } | TransferError::IntegrityMismatch { .. } => {
                "Downloaded file did not match the stored object.".into()
            }
            TransferError::TransferNotFound(_) => "Transfer record not found.".into(),
            TransferError::InvalidState { .. } => {
                "That action is not available for this transfer.".into()
            }
            TransferError::EngineStopped => "The transfer engine is not running.".into(),
            TransferError::Io(err) if err.kind() == io::ErrorKind::StorageFull => {
                "The disk is full.".into()
            }
            TransferError::Store(err) => match err.class() {
                ErrorClass::Transient => {
                    "The storage service is unavailable. Try again in a few moments.".into()
                }
                ErrorClass::Permission => {
                    "Access denied. Your credentials don't allow this action.".into()
                }
                ErrorClass::NotFound => {
                    "File not found. It may have been deleted or moved.".into()
                }
                _ => "The storage service rejected the request.".into(),
            },
            TransferError::Repository(_) | TransferError::Io(_) => {
                "An unexpected error occurred.".into()
            }
        }
    }
}
