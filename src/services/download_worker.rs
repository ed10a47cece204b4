//! Download worker: ranged retrieval into a resumable temp file.
//!
//! The temp file sits next to the destination and its length is the resume
//! offset. The finished file is verified before it is renamed into place.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, info, warn};

use crate::{
    constants::{DOWNLOAD_CHUNK_SIZE, MULTIPART_THRESHOLD},
    errors::TransferError,
    models::transfer::{Direction, Transfer},
    services::{
        object_store::ByteRange,
        worker::{StepResult, TransferEvent, WorkerContext, WorkerOutcome, outcome_of},
    },
};

/// Temp file a download of `dest` writes into before the final rename.
pub fn download_temp_path(dest: &Path, transfer_id: i64) -> PathBuf {
    destination_dir(dest).join(format!(".download-{transfer_id}.tmp"))
}

fn destination_dir(dest: &Path) -> PathBuf {
    match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Remove a download's temp file, if any.
pub(crate) async fn discard_temp(dest: &Path, transfer_id: i64) {
    let tmp = download_temp_path(dest, transfer_id);
    match fs::remove_file(&tmp).await {
        Ok(()) => debug!(transfer_id, path = %tmp.display(), "removed temp file"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(transfer_id, path = %tmp.display(), "failed to remove temp file: {}", err),
    }
}

/// Whether the destination directory of a download still exists.
pub(crate) async fn destination_exists(dest: &Path) -> bool {
    fs::metadata(destination_dir(dest))
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

/// Run one download to its next resting state.
pub async fn run(mut ctx: WorkerContext, transfer: Transfer) -> WorkerOutcome {
    info!(
        transfer_id = transfer.id,
        key = %transfer.object_key,
        path = %transfer.local_path,
        "starting download"
    );
    let result = download(&mut ctx, &transfer).await;
    let size = result.as_ref().ok().copied();
    let outcome = outcome_of(result);

    if matches!(outcome, WorkerOutcome::Cancelled) {
        discard_temp(&transfer.local_path(), transfer.id).await;
    }
    ctx.finish(&outcome).await;

    if let Some(size) = size {
        ctx.emit(TransferEvent::Finished {
            id: transfer.id,
            direction: Direction::Download,
            key: transfer.object_key.clone(),
            size,
        });
    }
    outcome
}

async fn download(ctx: &mut WorkerContext, transfer: &Transfer) -> StepResult<u64> {
    let id = transfer.id;
    let dest = transfer.local_path();
    if !destination_exists(&dest).await {
        return Err(TransferError::DestinationMissing(destination_dir(&dest)).into());
    }

    let store = ctx.store.clone();
    let key = transfer.object_key.clone();
    let head = ctx
        .with_retry("head object", || {
            let store = store.clone();
            let key = key.clone();
            async move { store.head_object(&key).await.map_err(TransferError::from) }
        })
        .await?;
    let total = head.size;
    ctx.repo.set_total(id, total as i64).await?;
    ctx.checkpoint()?;

    let tmp = download_temp_path(&dest, id);
    if total < MULTIPART_THRESHOLD {
        let body = ctx
            .with_retry("get object", || {
                let store = store.clone();
                let key = key.clone();
                async move {
                    store
                        .get_object_range(&key, None)
                        .await
                        .map_err(TransferError::from)
                }
            })
            .await?;
        let mut file = File::create(&tmp).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        ctx.report_progress(body.len() as u64, total).await?;
    } else {
        fetch_ranges(ctx, &key, &tmp, total).await?;
    }

    if let Err(err) = verify(&key, &tmp, total, head.etag.as_deref()).await {
        discard_temp(&dest, id).await;
        return Err(err.into());
    }
    fs::rename(&tmp, &dest).await?;
    ctx.report_complete(total).await?;
    info!(transfer_id = id, key = %key, total, "download completed");
    Ok(total)
}

async fn fetch_ranges(
    ctx: &mut WorkerContext,
    key: &str,
    tmp: &Path,
    total: u64,
) -> StepResult<()> {
    let mut offset = match fs::metadata(tmp).await {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == ErrorKind::NotFound => 0,
        Err(err) => return Err(err.into()),
    };
    if offset > total {
        warn!(transfer_id = ctx.transfer_id, offset, total, "temp file larger than object, starting over");
        fs::remove_file(tmp).await?;
        ctx.reset_progress().await?;
        offset = 0;
    } else if offset > 0 {
        info!(transfer_id = ctx.transfer_id, offset, total, "resuming download");
    }

    let mut file = OpenOptions::new().create(true).append(true).open(tmp).await?;
    ctx.report_progress(offset, total).await?;

    let store = ctx.store.clone();
    while offset < total {
        ctx.checkpoint()?;
        let range = ByteRange::from_len(offset, DOWNLOAD_CHUNK_SIZE.min(total - offset));
        let range_key = key.to_string();
        let chunk = ctx
            .with_retry("get range", || {
                let store = store.clone();
                let key = range_key.clone();
                async move {
                    store
                        .get_object_range(&key, Some(range))
                        .await
                        .map_err(TransferError::from)
                }
            })
            .await?;
        if chunk.is_empty() {
            return Err(TransferError::SizeMismatch {
                key: key.to_string(),
                expected: total,
                actual: offset,
            }
            .into());
        }
        file.write_all(&chunk).await?;
        file.flush().await?;
        file.sync_data().await?;
        offset += chunk.len() as u64;
        debug!(transfer_id = ctx.transfer_id, offset, total, "range written");
        ctx.report_progress(offset.min(total), total).await?;
    }
    file.sync_all().await?;
    Ok(())
}

/// Check the temp file's size, and its MD5 when the entity tag is a plain digest.
async fn verify(key: &str, tmp: &Path, expected: u64, etag: Option<&str>) -> Result<(), TransferError> {
    let actual = fs::metadata(tmp).await?.len();
    if actual != expected {
        return Err(TransferError::SizeMismatch {
            key: key.to_string(),
            expected,
            actual,
        });
    }

    let Some(etag) = etag.map(|tag| tag.trim_matches('"')) else {
        return Ok(());
    };
    if !is_plain_md5(etag) {
        return Ok(());
    }
    let digest = file_md5(tmp).await?;
    if !digest.eq_ignore_ascii_case(etag) {
        return Err(TransferError::IntegrityMismatch {
            key: key.to_string(),
            expected: etag.to_string(),
            actual: digest,
        });
    }
    Ok(())
}

fn is_plain_md5(etag: &str) -> bool {
    etag.len() == 32 && etag.bytes().all(|b| b.is_ascii_hexdigit())
}

async fn file_md5(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}
