//! Shared fixtures for the integration suites: a scriptable store wrapper,
//! temp-dir backed repositories and small helpers around engine events.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use rand::{RngCore, SeedableRng, rngs::StdRng};
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

use object_transfer::{
    EngineConfig, LocalObjectStore, SqliteTransferStore, StoreError, TransferEngine,
    TransferEvent, TransferStatus,
    models::multipart::{CompletedPart, MultipartSession, UploadedPart},
    services::{
        object_store::{ByteRange, ListPage, MetadataPolicy, ObjectHead, ObjectStore, StoreResult},
        retry::RetryPolicy,
    },
};

/// [`LocalObjectStore`] wrapper that records calls and injects failures.
pub struct ScriptedStore {
    inner: LocalObjectStore,
    /// The next N data calls fail with a transient error.
    transient_failures: AtomicUsize,
    /// Writes fail with access denied while set.
    deny_writes: AtomicBool,
    /// Only multipart completion is denied while set.
    deny_completion: AtomicBool,
    /// Added to every data call (put, part upload, ranged get).
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    put_calls: AtomicUsize,
    list_calls: AtomicUsize,
    uploaded_parts: Mutex<Vec<i64>>,
    ranges: Mutex<Vec<ByteRange>>,
}

/// Decrements the in-flight counter when the call ends.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedStore {
    pub fn new(inner: LocalObjectStore) -> Self {
        Self {
            inner,
            transient_failures: AtomicUsize::new(0),
            deny_writes: AtomicBool::new(false),
            deny_completion: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            put_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            uploaded_parts: Mutex::new(Vec::new()),
            ranges: Mutex::new(Vec::new()),
        }
    }

    /// The wrapped store, bypassing scripting and call records.
    pub fn inner(&self) -> &LocalObjectStore {
        &self.inner
    }

    pub fn fail_next(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn deny_writes(&self, deny: bool) {
        self.deny_writes.store(deny, Ordering::SeqCst);
    }

    pub fn deny_completion(&self, deny: bool) {
        self.deny_completion.store(deny, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn uploaded_parts(&self) -> Vec<i64> {
        self.uploaded_parts.lock().unwrap().clone()
    }

    pub fn ranges(&self) -> Vec<ByteRange> {
        self.ranges.lock().unwrap().clone()
    }

    /// Common prologue of data calls: delay, concurrency bookkeeping and
    /// scripted transient failures.
    async fn data_call(&self) -> StoreResult<InFlight<'_>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::Transient {
                message: "scripted timeout".into(),
            });
        }
        Ok(guard)
    }

    fn check_write(&self, key: &str) -> StoreResult<()> {
        if self.deny_writes.load(Ordering::SeqCst) {
            return Err(StoreError::PermissionDenied {
                key: key.to_string(),
                message: "AccessDenied".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for ScriptedStore {
    async fn list_objects(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> StoreResult<ListPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.list_objects(prefix, continuation_token).await
    }

    async fn head_object(&self, key: &str) -> StoreResult<ObjectHead> {
        self.inner.head_object(key).await
    }

    async fn get_object_range(&self, key: &str, range: Option<ByteRange>) -> StoreResult<Bytes> {
        if let Some(range) = range {
            self.ranges.lock().unwrap().push(range);
        }
        let _guard = self.data_call().await?;
        self.inner.get_object_range(key, range).await
    }

    async fn put_object(&self, key: &str, body: Bytes) -> StoreResult<String> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.check_write(key)?;
        let _guard = self.data_call().await?;
        self.inner.put_object(key, body).await
    }

    async fn create_multipart_session(&self, key: &str) -> StoreResult<String> {
        self.check_write(key)?;
        self.inner.create_multipart_session(key).await
    }

    async fn upload_part(
        &self,
        key: &str,
        session_id: &str,
        part_number: i64,
        body: Bytes,
    ) -> StoreResult<String> {
        self.uploaded_parts.lock().unwrap().push(part_number);
        self.check_write(key)?;
        let _guard = self.data_call().await?;
        self.inner
            .upload_part(key, session_id, part_number, body)
            .await
    }

    async fn list_parts(&self, key: &str, session_id: &str) -> StoreResult<Vec<UploadedPart>> {
        self.inner.list_parts(key, session_id).await
    }

    async fn complete_multipart_session(
        &self,
        key: &str,
        session_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<String> {
        self.check_write(key)?;
        if self.deny_completion.load(Ordering::SeqCst) {
            return Err(StoreError::PermissionDenied {
                key: key.to_string(),
                message: "AccessDenied".into(),
            });
        }
        self.inner
            .complete_multipart_session(key, session_id, parts)
            .await
    }

    async fn abort_multipart_session(&self, key: &str, session_id: &str) -> StoreResult<()> {
        self.inner.abort_multipart_session(key, session_id).await
    }

    async fn list_multipart_sessions(&self) -> StoreResult<Vec<MultipartSession>> {
        self.inner.list_multipart_sessions().await
    }

    async fn delete_objects(&self, keys: &[String]) -> StoreResult<Vec<String>> {
        if let Some(key) = keys.first() {
            self.check_write(key)?;
        }
        self.inner.delete_objects(keys).await
    }

    async fn copy_object(
        &self,
        src_key: &str,
        dst_key: &str,
        metadata: MetadataPolicy,
    ) -> StoreResult<()> {
        self.check_write(dst_key)?;
        self.inner.copy_object(src_key, dst_key, metadata).await
    }
}

/// A bucket, a transfer database and a scratch directory under one temp dir.
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<ScriptedStore>,
    pub repo: Arc<SqliteTransferStore>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_page_size(1000).await
    }

    /// Harness whose bucket lists at most `page_size` entries per page.
    pub async fn with_page_size(page_size: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let bucket = LocalObjectStore::open(dir.path().join("bucket"))
            .await
            .unwrap()
            .with_page_size(page_size);
        let url = format!("sqlite://{}", dir.path().join("transfers.db").display());
        let repo = SqliteTransferStore::open(&url).await.unwrap();
        std::fs::create_dir_all(dir.path().join("files")).unwrap();
        Self {
            dir,
            store: Arc::new(ScriptedStore::new(bucket)),
            repo: Arc::new(repo),
        }
    }

    /// Path of a scratch file.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join("files").join(name)
    }

    pub fn engine(&self, config: EngineConfig) -> TransferEngine {
        TransferEngine::start(self.store.clone(), self.repo.clone(), config)
    }
}

/// Engine settings for tests: immediate retries and deterministic jitter.
pub fn test_config(concurrency: usize) -> EngineConfig {
    let mut config = EngineConfig::default()
        .with_concurrency(concurrency)
        .with_retry(RetryPolicy::immediate(3));
    config.jitter_seed = Some(7);
    config
}

pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

pub fn write_file(path: &Path, data: &[u8]) {
    std::fs::write(path, data).unwrap();
}

/// Everything already sitting in the receiver.
pub fn drain(events: &mut broadcast::Receiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Ids in the order they were admitted to a worker.
pub fn admission_order(events: &[TransferEvent]) -> Vec<i64> {
    events
        .iter()
        .filter_map(|event| match event {
            TransferEvent::StatusChanged {
                id,
                status: TransferStatus::Running,
            } => Some(*id),
            _ => None,
        })
        .collect()
}

/// Poll `check` every 10 ms until it holds, panicking after five seconds.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
