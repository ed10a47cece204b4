//! Store-side multipart sessions and parts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An in-progress multipart session as reported by the store.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct MultipartSession {
    /// Object key being uploaded.
    pub key: String,

    /// Session handle returned when the session was created.
    pub session_id: String,

    /// Timestamp when the session was initiated.
    pub initiated_at: DateTime<Utc>,
}

/// A part the store has accepted for a session.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct UploadedPart {
    /// Part number (1-based).
    pub part_number: i64,

    /// Entity tag for this part.
    pub etag: String,

    /// Size in bytes.
    pub size_bytes: i64,
}

/// Part reference passed when completing a session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i64,
    pub etag: String,
}
