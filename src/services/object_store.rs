//! Object store client interface consumed by the transfer engine and the
//! listing layer.
//!
//! Implementations are bound to a single bucket. Multipart calls carry the
//! object key alongside the session id because real stores address sessions
//! by both.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::{
    errors::StoreError,
    models::{
        multipart::{CompletedPart, MultipartSession, UploadedPart},
        object::ObjectMeta,
    },
};

pub type StoreResult<T> = Result<T, StoreError>;

/// Inclusive byte range, as in an HTTP `Range: bytes=start-end` header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Range covering `len` bytes from `start`.
    pub fn from_len(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start + len.saturating_sub(1),
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Object summary from a listing page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub storage_class: Option<String>,
    pub etag: Option<String>,
}

impl ObjectEntry {
    pub fn meta(&self) -> ObjectMeta {
        ObjectMeta {
            size: self.size,
            last_modified: self.last_modified,
            storage_class: self.storage_class.clone(),
            etag: self.etag.clone(),
        }
    }
}

/// One page of a delimiter listing.
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectEntry>,
    /// Common prefixes, each ending with the delimiter.
    pub prefixes: Vec<String>,
    /// Present when more pages follow.
    pub next_token: Option<String>,
}

/// Result of a metadata probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectHead {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: DateTime<Utc>,
    pub storage_class: Option<String>,
}

/// What a server-side copy does with the source object's metadata.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MetadataPolicy {
    #[default]
    Preserve,
    Replace,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List one page of keys under `prefix`, grouping deeper keys into
    /// common prefixes.
    async fn list_objects(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> StoreResult<ListPage>;

    async fn head_object(&self, key: &str) -> StoreResult<ObjectHead>;

    /// Read the whole object (`None`) or an inclusive byte range.
    async fn get_object_range(&self, key: &str, range: Option<ByteRange>) -> StoreResult<Bytes>;

    /// Write a whole object, returning its entity tag.
    async fn put_object(&self, key: &str, body: Bytes) -> StoreResult<String>;

    async fn create_multipart_session(&self, key: &str) -> StoreResult<String>;

    /// Upload one part, returning its entity tag.
    async fn upload_part(
        &self,
        key: &str,
        session_id: &str,
        part_number: i64,
        body: Bytes,
    ) -> StoreResult<String>;

    /// Parts the store has actually received for a session.
    async fn list_parts(&self, key: &str, session_id: &str) -> StoreResult<Vec<UploadedPart>>;

    /// Assemble the object from `parts`, which must be in part-number order.
    async fn complete_multipart_session(
        &self,
        key: &str,
        session_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<String>;

    async fn abort_multipart_session(&self, key: &str, session_id: &str) -> StoreResult<()>;

    /// Every in-progress session in the bucket.
    async fn list_multipart_sessions(&self) -> StoreResult<Vec<MultipartSession>>;

    /// Delete keys, returning the ones actually removed.
    async fn delete_objects(&self, keys: &[String]) -> StoreResult<Vec<String>>;

    async fn copy_object(
        &self,
        src_key: &str,
        dst_key: &str,
        metadata: MetadataPolicy,
    ) -> StoreResult<()>;
}
