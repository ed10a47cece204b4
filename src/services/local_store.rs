//! LocalObjectStore: a directory-backed [`ObjectStore`].
//!
//! Metadata (objects, multipart sessions, uploaded parts) lives in SQLite;
//! payloads live on disk sharded beneath
//! `base_path/objects/{shard}/{shard}/{md5(key)}`. Entity tags follow the
//! usual conventions: MD5 hex for single writes, `md5(part digests)-N` for
//! assembled multipart objects. It backs the command-line tool and the test
//! suites; it does not speak any network protocol.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

use crate::{
    constants::{DEFAULT_STORAGE_CLASS, DELIMITER},
    errors::StoreError,
    models::multipart::{CompletedPart, MultipartSession, UploadedPart},
    services::{
        database,
        object_store::{
            ByteRange, ListPage, MetadataPolicy, ObjectEntry, ObjectHead, ObjectStore,
            StoreResult,
        },
    },
};

const MAX_OBJECT_KEY_LEN: usize = 1024;
const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, FromRow)]
struct ObjectRow {
    key: String,
    size_bytes: i64,
    etag: Option<String>,
    storage_class: String,
    last_modified: DateTime<Utc>,
}

impl ObjectRow {
    fn entry(self) -> ObjectEntry {
        ObjectEntry {
            key: self.key,
            size: self.size_bytes.max(0) as u64,
            last_modified: self.last_modified,
            storage_class: Some(self.storage_class),
            etag: self.etag,
        }
    }
}

#[derive(Clone)]
pub struct LocalObjectStore {
    /// Shared SQLite connection pool used for metadata operations.
    db: Arc<SqlitePool>,

    /// Base directory on disk where payloads and parts are stored.
    base_path: PathBuf,

    /// Maximum keys scanned per listing page.
    page_size: usize,
}

impl LocalObjectStore {
    /// Wrap an existing pool whose schema is already in place.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Open (or create) a store rooted at `base_path`, keeping its metadata
    /// database under `base_path/.meta/`.
    pub async fn open(base_path: impl Into<PathBuf>) -> StoreResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;
        let pool = database::connect_file(&base_path.join(".meta").join("store.db")).await?;
        database::run_migrations(&pool, database::LOCAL_STORE_SCHEMA).await?;
        Ok(Self::new(Arc::new(pool), base_path))
    }

    /// Limit how many keys a single listing page scans.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, DEFAULT_PAGE_SIZE);
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Reject empty, oversized, absolute, traversing or control-character keys.
    fn ensure_key_safe(&self, key: &str) -> StoreResult<()> {
        let invalid = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.split('/').any(|segment| segment == "..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if invalid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    /// Two-level shard directories plus a file name derived from MD5(key).
    fn object_path(&self, key: &str) -> PathBuf {
        let digest = md5::compute(key.as_bytes());
        let mut path = self.base_path.join("objects");
        path.push(format!("{:02x}", digest[0]));
        path.push(format!("{:02x}", digest[1]));
        path.push(format!("{:x}", digest));
        path
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.base_path.join("multipart").join(session_id)
    }

    fn part_path(&self, session_id: &str, part_number: i64) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("{:05}.part", part_number))
    }

    async fn fetch_object(&self, key: &str) -> StoreResult<ObjectRow> {
        sqlx::query_as::<_, ObjectRow>(
            "SELECT key, size_bytes, etag, storage_class, last_modified
             FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::NotFound(key.to_string()),
            other => other.into(),
        })
    }

    async fn fetch_session(&self, key: &str, session_id: &str) -> StoreResult<MultipartSession> {
        sqlx::query_as::<_, MultipartSession>(
            "SELECT key, session_id, initiated_at FROM multipart_sessions
             WHERE session_id = ? AND key = ?",
        )
        .bind(session_id)
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::SessionNotFound(session_id.to_string()),
            other => other.into(),
        })
    }

    /// Write `body` to a fresh temp file next to `target`, fsynced.
    async fn write_temp(&self, target: &Path, body: &[u8]) -> StoreResult<PathBuf> {
        let parent = target.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::backend("payload path missing parent directory")
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;
        let written = async {
            file.write_all(body).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Ok(tmp_path)
    }

    /// Move a finished temp file over `target`.
    async fn commit_temp(&self, tmp_path: &Path, target: &Path) -> StoreResult<()> {
        if let Err(err) = fs::rename(tmp_path, target).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(target).await?;
                fs::rename(tmp_path, target).await?;
            } else {
                let _ = fs::remove_file(tmp_path).await;
                return Err(err.into());
            }
        }
        Ok(())
    }

    async fn upsert_object(
        &self,
        key: &str,
        size_bytes: i64,
        etag: &str,
        storage_class: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO objects (key, size_bytes, etag, storage_class, last_modified)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                storage_class = excluded.storage_class,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(key)
        .bind(size_bytes)
        .bind(etag)
        .bind(storage_class)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Drop a session's rows and part files.
    async fn discard_session(&self, session_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM multipart_parts WHERE session_id = ?")
            .bind(session_id)
            .execute(&*self.db)
            .await?;
        sqlx::query("DELETE FROM multipart_sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&*self.db)
            .await?;
        match fs::remove_dir_all(self.session_dir(session_id)).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => debug!(session_id, "failed to remove part files: {}", err),
        }
        Ok(())
    }

    /// Recursively remove empty shard directories up to the objects root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let stop = self.base_path.join("objects");
        let mut current = start.to_path_buf();
        while current.starts_with(&stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    /// Rows under `prefix` in key order, resuming at `cursor`.
    async fn fetch_listing_rows(
        &self,
        prefix: &str,
        cursor: Option<&ListCursor>,
        limit: usize,
    ) -> StoreResult<Vec<ObjectRow>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT key, size_bytes, etag, storage_class, last_modified FROM objects WHERE 1 = 1",
        );
        if !prefix.is_empty() {
            builder.push(" AND substr(key, 1, ");
            builder.push_bind(prefix.chars().count() as i64);
            builder.push(") = ");
            builder.push_bind(prefix.to_string());
        }
        match cursor {
            Some(ListCursor::After(key)) => {
                builder.push(" AND key > ");
                builder.push_bind(key.clone());
            }
            Some(ListCursor::From(bound)) => {
                builder.push(" AND key >= ");
                builder.push_bind(bound.clone());
            }
            None => {}
        }
        builder.push(" ORDER BY key ASC LIMIT ");
        builder.push_bind(limit as i64);

        Ok(builder
            .build_query_as::<ObjectRow>()
            .fetch_all(&*self.db)
            .await?)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn list_objects(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> StoreResult<ListPage> {
        let mut cursor = continuation_token.map(ListCursor::decode).transpose()?;
        let mut objects = Vec::new();
        let mut prefixes: Vec<String> = Vec::new();
        let mut next_token = None;

        // A folder counts as one entry and is reported once, however many
        // keys sit beneath it.
        'fill: loop {
            let rows = self
                .fetch_listing_rows(prefix, cursor.as_ref(), self.page_size + 1)
                .await?;
            let exhausted = rows.len() <= self.page_size;
            for row in rows {
                let common = compute_common_prefix(&row.key, prefix, DELIMITER);
                if common.is_some() && common.as_ref() == prefixes.last() {
                    continue;
                }
                if objects.len() + prefixes.len() == self.page_size {
                    next_token = cursor.as_ref().map(ListCursor::encode);
                    break 'fill;
                }
                match common {
                    Some(common) => {
                        cursor = Some(ListCursor::From(prefix_upper_bound(&common)));
                        prefixes.push(common);
                    }
                    None => {
                        cursor = Some(ListCursor::After(row.key.clone()));
                        objects.push(row.entry());
                    }
                }
            }
            if exhausted {
                break;
            }
        }

        Ok(ListPage {
            objects,
            prefixes,
            next_token,
        })
    }

    async fn head_object(&self, key: &str) -> StoreResult<ObjectHead> {
        self.ensure_key_safe(key)?;
        let row = self.fetch_object(key).await?;
        Ok(ObjectHead {
            key: row.key,
            size: row.size_bytes.max(0) as u64,
            etag: row.etag,
            last_modified: row.last_modified,
            storage_class: Some(row.storage_class),
        })
    }

    async fn get_object_range(&self, key: &str, range: Option<ByteRange>) -> StoreResult<Bytes> {
        self.ensure_key_safe(key)?;
        let row = self.fetch_object(key).await?;
        let size = row.size_bytes.max(0) as u64;
        let path = self.object_path(key);

        let Some(range) = range else {
            let body = fs::read(&path).await.map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    StoreError::NotFound(key.to_string())
                } else {
                    err.into()
                }
            })?;
            return Ok(Bytes::from(body));
        };

        if range.is_empty() || range.start >= size {
            return Err(StoreError::InvalidRange {
                key: key.to_string(),
                start: range.start,
                end: range.end,
            });
        }
        let end = range.end.min(size - 1);
        let mut file = File::open(&path).await?;
        file.seek(SeekFrom::Start(range.start)).await?;
        let mut buf = vec![0u8; (end - range.start + 1) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn put_object(&self, key: &str, body: Bytes) -> StoreResult<String> {
        self.ensure_key_safe(key)?;
        let path = self.object_path(key);
        let etag = format!("{:x}", md5::compute(&body));
        let tmp_path = self.write_temp(&path, &body).await?;
        self.commit_temp(&tmp_path, &path).await?;

        if let Err(err) = self
            .upsert_object(key, body.len() as i64, &etag, DEFAULT_STORAGE_CLASS)
            .await
        {
            let _ = fs::remove_file(&path).await;
            return Err(err);
        }
        debug!(key, size = body.len(), "stored object");
        Ok(etag)
    }

    async fn create_multipart_session(&self, key: &str) -> StoreResult<String> {
        self.ensure_key_safe(key)?;
        let session_id = Uuid::new_v4().simple().to_string();
        sqlx::query(
            "INSERT INTO multipart_sessions (session_id, key, initiated_at) VALUES (?, ?, ?)",
        )
        .bind(&session_id)
        .bind(key)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        fs::create_dir_all(self.session_dir(&session_id)).await?;
        debug!(key, session_id = %session_id, "created multipart session");
        Ok(session_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        session_id: &str,
        part_number: i64,
        body: Bytes,
    ) -> StoreResult<String> {
        self.fetch_session(key, session_id).await?;
        let path = self.part_path(session_id, part_number);
        let etag = format!("{:x}", md5::compute(&body));
        let tmp_path = self.write_temp(&path, &body).await?;
        self.commit_temp(&tmp_path, &path).await?;

        sqlx::query(
            r#"
            INSERT INTO multipart_parts (session_id, part_number, etag, size_bytes, uploaded_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(session_id, part_number) DO UPDATE SET
                etag = excluded.etag,
                size_bytes = excluded.size_bytes,
                uploaded_at = excluded.uploaded_at
            "#,
        )
        .bind(session_id)
        .bind(part_number)
        .bind(&etag)
        .bind(body.len() as i64)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(etag)
    }

    async fn list_parts(&self, key: &str, session_id: &str) -> StoreResult<Vec<UploadedPart>> {
        self.fetch_session(key, session_id).await?;
        let parts = sqlx::query_as::<_, UploadedPart>(
            "SELECT part_number, etag, size_bytes FROM multipart_parts
             WHERE session_id = ? ORDER BY part_number ASC",
        )
        .bind(session_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(parts)
    }

    async fn complete_multipart_session(
        &self,
        key: &str,
        session_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<String> {
        self.fetch_session(key, session_id).await?;
        if parts.is_empty() || parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(StoreError::backend("parts must be non-empty and in ascending order"));
        }
        let stored = self.list_parts(key, session_id).await?;

        let target = self.object_path(key);
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| StoreError::backend("payload path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut out = File::create(&tmp_path).await?;

        let mut digests = Vec::with_capacity(parts.len() * 16);
        let mut size_bytes: i64 = 0;
        for part in parts {
            let matching = stored
                .iter()
                .find(|p| p.part_number == part.part_number && p.etag == part.etag);
            let Some(stored_part) = matching else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::backend(format!(
                    "part {} missing or entity tag mismatch",
                    part.part_number
                )));
            };
            let mut input = File::open(self.part_path(session_id, part.part_number)).await?;
            tokio::io::copy(&mut input, &mut out).await?;
            size_bytes += stored_part.size_bytes;
            digests.extend(decode_hex(&part.etag).ok_or_else(|| {
                StoreError::backend(format!("malformed entity tag `{}`", part.etag))
            })?);
        }
        out.flush().await?;
        out.sync_all().await?;
        drop(out);
        self.commit_temp(&tmp_path, &target).await?;

        let etag = format!("{:x}-{}", md5::compute(&digests), parts.len());
        self.upsert_object(key, size_bytes, &etag, DEFAULT_STORAGE_CLASS)
            .await?;
        self.discard_session(session_id).await?;
        debug!(key, session_id, size_bytes, "completed multipart session");
        Ok(etag)
    }

    async fn abort_multipart_session(&self, key: &str, session_id: &str) -> StoreResult<()> {
        self.fetch_session(key, session_id).await?;
        self.discard_session(session_id).await?;
        debug!(key, session_id, "aborted multipart session");
        Ok(())
    }

    async fn list_multipart_sessions(&self) -> StoreResult<Vec<MultipartSession>> {
        let sessions = sqlx::query_as::<_, MultipartSession>(
            "SELECT key, session_id, initiated_at FROM multipart_sessions ORDER BY initiated_at",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(sessions)
    }

    async fn delete_objects(&self, keys: &[String]) -> StoreResult<Vec<String>> {
        let mut deleted = Vec::with_capacity(keys.len());
        for key in keys {
            self.ensure_key_safe(key)?;
            let result = sqlx::query("DELETE FROM objects WHERE key = ?")
                .bind(key)
                .execute(&*self.db)
                .await?;
            if result.rows_affected() == 0 {
                continue;
            }

            let path = self.object_path(key);
            match fs::remove_file(&path).await {
                Ok(_) => debug!("removed physical file {}", path.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!("file {} already missing", path.display());
                }
                Err(err) => return Err(err.into()),
            }
            if let Some(parent) = path.parent() {
                self.prune_empty_dirs(parent).await;
            }
            deleted.push(key.clone());
        }
        Ok(deleted)
    }

    async fn copy_object(
        &self,
        src_key: &str,
        dst_key: &str,
        metadata: MetadataPolicy,
    ) -> StoreResult<()> {
        self.ensure_key_safe(src_key)?;
        self.ensure_key_safe(dst_key)?;
        let source = self.fetch_object(src_key).await?;

        let target = self.object_path(dst_key);
        let body = fs::read(self.object_path(src_key)).await?;
        let tmp_path = self.write_temp(&target, &body).await?;
        self.commit_temp(&tmp_path, &target).await?;

        let (etag, storage_class) = match metadata {
            MetadataPolicy::Preserve => (
                source
                    .etag
                    .unwrap_or_else(|| format!("{:x}", md5::compute(&body))),
                source.storage_class,
            ),
            MetadataPolicy::Replace => (
                format!("{:x}", md5::compute(&body)),
                DEFAULT_STORAGE_CLASS.to_string(),
            ),
        };
        self.upsert_object(dst_key, source.size_bytes, &etag, &storage_class)
            .await
    }
}

/// Resume point of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ListCursor {
    /// Continue with keys strictly after this one.
    After(String),
    /// Continue with keys at or after this bound; skips a reported folder.
    From(String),
}

impl ListCursor {
    fn encode(&self) -> String {
        let tagged = match self {
            ListCursor::After(key) => format!("k{key}"),
            ListCursor::From(bound) => format!("p{bound}"),
        };
        URL_SAFE_NO_PAD.encode(tagged.as_bytes())
    }

    fn decode(token: &str) -> StoreResult<Self> {
        let tagged = URL_SAFE_NO_PAD
            .decode(token)
            .ok()
            .and_then(|raw| String::from_utf8(raw).ok());
        match tagged.as_deref().map(|t| t.split_at_checked(1)) {
            Some(Some(("k", key))) => Ok(ListCursor::After(key.to_string())),
            Some(Some(("p", bound))) => Ok(ListCursor::From(bound.to_string())),
            _ => Err(StoreError::backend(format!(
                "invalid continuation token `{}`",
                token
            ))),
        }
    }
}

/// Smallest string sorting after every key that starts with `common`.
fn prefix_upper_bound(common: &str) -> String {
    let mut bound = common.to_string();
    if let Some(last) = bound.pop() {
        match char::from_u32(last as u32 + 1) {
            Some(next) => bound.push(next),
            None => {
                bound.push(last);
                bound.push(char::MAX);
            }
        }
    }
    bound
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Group `key` under a common prefix when it sits deeper than `prefix`.
fn compute_common_prefix(key: &str, prefix: &str, delimiter: &str) -> Option<String> {
    let after_prefix = key.strip_prefix(prefix)?;
    let pos = after_prefix.find(delimiter)?;
    let mut combined = String::from(prefix);
    combined.push_str(&after_prefix[..pos + delimiter.len()]);
    Some(combined)
}
