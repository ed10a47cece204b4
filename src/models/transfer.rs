//! Transfer records and their multipart part bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, path::PathBuf};

/// Which way the bytes move.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

/// Lifecycle state of a transfer.
///
/// `Completed` and `Cancelled` are final. `Failed` is final until an explicit
/// retry puts the record back in the queue.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TransferStatus {
    Queued,
    Running,
    Paused,
    Failed,
    Completed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Failed | TransferStatus::Completed | TransferStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Queued => "queued",
            TransferStatus::Running => "running",
            TransferStatus::Paused => "paused",
            TransferStatus::Failed => "failed",
            TransferStatus::Completed => "completed",
            TransferStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued, running or finished upload/download.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Transfer {
    pub id: i64,

    pub direction: Direction,

    /// Key of the remote object (destination for uploads, source for downloads).
    pub object_key: String,

    /// Source file for uploads, destination file for downloads.
    pub local_path: String,

    /// Total size in bytes, known once the worker has probed the source.
    pub total_bytes: Option<i64>,

    /// Bytes confirmed so far.
    pub transferred: i64,

    pub status: TransferStatus,

    /// Store-side multipart session (uploads only).
    pub session_id: Option<String>,

    /// Raw detail of the last failure.
    pub error_message: Option<String>,

    pub retry_count: i64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    pub fn local_path(&self) -> PathBuf {
        PathBuf::from(&self.local_path)
    }
}

/// Caller-supplied intent used to create a [`Transfer`].
#[derive(Clone, Debug)]
pub struct NewTransfer {
    pub direction: Direction,
    pub object_key: String,
    pub local_path: PathBuf,
}

impl NewTransfer {
    pub fn upload(local_path: impl Into<PathBuf>, object_key: impl Into<String>) -> Self {
        Self {
            direction: Direction::Upload,
            object_key: object_key.into(),
            local_path: local_path.into(),
        }
    }

    pub fn download(object_key: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            direction: Direction::Download,
            object_key: object_key.into(),
            local_path: local_path.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PartStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One part of a multipart upload, identified by `(transfer_id, part_number)`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct TransferPart {
    pub transfer_id: i64,

    /// Part number (1-based).
    pub part_number: i64,

    /// Byte offset into the source file.
    pub byte_offset: i64,

    pub size: i64,

    pub status: PartStatus,

    /// Entity tag the store returned for this part.
    pub etag: Option<String>,
}

/// Byte layout of a part before it is persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartLayout {
    pub part_number: i64,
    pub byte_offset: i64,
    pub size: i64,
}
