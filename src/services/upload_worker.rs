//! Upload worker: single put for small files, resumable multipart otherwise.
//!
//! A multipart run moves through session setup, sequential part uploads and
//! completion. The session id is persisted before the first part goes out,
//! and on resume the store's own part list decides which parts still need
//! sending.

use bytes::Bytes;
use std::{collections::HashMap, io::ErrorKind, io::SeekFrom};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt},
};
use tracing::{debug, info, warn};

use crate::{
    constants::{
        HUGE_PART_SIZE, LARGE_PART_SIZE, LARGE_TIER_LIMIT, MAX_PARTS, MULTIPART_THRESHOLD,
        SMALL_PART_SIZE, SMALL_TIER_LIMIT,
    },
    errors::{StoreError, TransferError},
    models::{
        multipart::CompletedPart,
        transfer::{Direction, PartLayout, PartStatus, Transfer, TransferPart},
    },
    services::{
        object_store::ObjectStore,
        transfer_store::TransferRepository,
        worker::{StepError, StepResult, TransferEvent, WorkerContext, WorkerOutcome, outcome_of},
    },
};

/// Part size for a multipart upload of `total` bytes.
pub fn select_part_size(total: u64) -> u64 {
    let tier = if total <= SMALL_TIER_LIMIT {
        SMALL_PART_SIZE
    } else if total <= LARGE_TIER_LIMIT {
        LARGE_PART_SIZE
    } else {
        HUGE_PART_SIZE
    };
    tier.max(total.div_ceil(MAX_PARTS))
}

/// Split `total` bytes into consecutive parts numbered from 1.
pub fn plan_parts(total: u64, part_size: u64) -> Vec<PartLayout> {
    let part_size = part_size.max(1);
    let mut parts = Vec::with_capacity(total.div_ceil(part_size) as usize);
    let mut offset = 0;
    while offset < total {
        let size = part_size.min(total - offset);
        parts.push(PartLayout {
            part_number: parts.len() as i64 + 1,
            byte_offset: offset as i64,
            size: size as i64,
        });
        offset += size;
    }
    parts
}

/// Run one upload to its next resting state.
pub async fn run(mut ctx: WorkerContext, transfer: Transfer) -> WorkerOutcome {
    info!(
        transfer_id = transfer.id,
        key = %transfer.object_key,
        path = %transfer.local_path,
        "starting upload"
    );
    let result = upload(&mut ctx, &transfer).await;
    let size = result.as_ref().ok().copied();
    let outcome = outcome_of(result);

    if matches!(outcome, WorkerOutcome::Cancelled) {
        abort_upload(
            ctx.store.as_ref(),
            ctx.repo.as_ref(),
            transfer.id,
            &transfer.object_key,
        )
        .await;
    }
    ctx.finish(&outcome).await;

    if let Some(size) = size {
        ctx.emit(TransferEvent::Finished {
            id: transfer.id,
            direction: Direction::Upload,
            key: transfer.object_key.clone(),
            size,
        });
    }
    outcome
}

/// Abort the transfer's multipart session and forget its parts.
///
/// Store failures are logged and otherwise ignored; orphan cleanup catches
/// whatever is left behind.
pub(crate) async fn abort_upload(
    store: &dyn ObjectStore,
    repo: &dyn TransferRepository,
    transfer_id: i64,
    key: &str,
) {
    let session_id = match repo.get(transfer_id).await {
        Ok(transfer) => transfer.session_id,
        Err(err) => {
            warn!(transfer_id, "cannot load transfer for abort: {}", err);
            return;
        }
    };
    if let Some(session_id) = session_id {
        match store.abort_multipart_session(key, &session_id).await {
            Ok(()) => info!(transfer_id, session_id = %session_id, "aborted multipart session"),
            Err(StoreError::SessionNotFound(_)) => {}
            Err(err) => warn!(transfer_id, session_id = %session_id, "failed to abort multipart session: {}", err),
        }
    }
    if let Err(err) = repo.delete_parts(transfer_id).await {
        warn!(transfer_id, "failed to drop part records: {}", err);
    }
    if let Err(err) = repo.set_session(transfer_id, None).await {
        warn!(transfer_id, "failed to clear session id: {}", err);
    }
}

async fn upload(ctx: &mut WorkerContext, transfer: &Transfer) -> StepResult<u64> {
    let id = transfer.id;
    let path = transfer.local_path();
    let meta = fs::metadata(&path).await.map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            TransferError::SourceMissing(path.clone())
        } else {
            err.into()
        }
    })?;
    if !meta.is_file() {
        return Err(TransferError::SourceMissing(path).into());
    }
    let total = meta.len();

    if transfer.session_id.is_some() && transfer.total_bytes.is_some_and(|prev| prev as u64 != total)
    {
        warn!(transfer_id = id, "source size changed, restarting multipart upload");
        abort_upload(ctx.store.as_ref(), ctx.repo.as_ref(), id, &transfer.object_key).await;
        return restart(ctx, transfer, total).await;
    }
    ctx.repo.set_total(id, total as i64).await?;
    ctx.checkpoint()?;

    if total < MULTIPART_THRESHOLD {
        let body = Bytes::from(fs::read(&path).await?);
        let store = ctx.store.clone();
        let key = transfer.object_key.clone();
        ctx.with_retry("put object", || {
            let store = store.clone();
            let key = key.clone();
            let body = body.clone();
            async move { store.put_object(&key, body).await.map_err(TransferError::from) }
        })
        .await?;
        ctx.report_complete(total).await?;
        return Ok(total);
    }

    upload_multipart(ctx, transfer, total, transfer.session_id.clone()).await
}

async fn restart(ctx: &mut WorkerContext, transfer: &Transfer, total: u64) -> StepResult<u64> {
    ctx.reset_progress().await?;
    ctx.repo.set_total(transfer.id, total as i64).await?;
    ctx.checkpoint()?;
    upload_multipart(ctx, transfer, total, None).await
}

async fn upload_multipart(
    ctx: &mut WorkerContext,
    transfer: &Transfer,
    total: u64,
    mut session: Option<String>,
) -> StepResult<u64> {
    let id = transfer.id;
    let key = transfer.object_key.clone();
    let layout = plan_parts(total, select_part_size(total));
    let mut file = File::open(transfer.local_path()).await?;

    if let Some(existing) = session.clone() {
        ctx.repo.insert_parts(id, &layout).await?;
        let parts = ctx.repo.list_parts(id).await?;
        if !reconcile(ctx, &key, &existing, &parts).await? {
            warn!(transfer_id = id, session_id = %existing, "store no longer knows the session, starting over");
            session = None;
        }
    }

    let session_id = match session {
        Some(session_id) => session_id,
        None => {
            ctx.repo.delete_parts(id).await?;
            let store = ctx.store.clone();
            let create_key = key.clone();
            let session_id = ctx
                .with_retry("create multipart session", || {
                    let store = store.clone();
                    let key = create_key.clone();
                    async move {
                        store
                            .create_multipart_session(&key)
                            .await
                            .map_err(TransferError::from)
                    }
                })
                .await?;
            ctx.repo.set_session(id, Some(&session_id)).await?;
            ctx.repo.insert_parts(id, &layout).await?;
            info!(transfer_id = id, session_id = %session_id, parts = layout.len(), "created multipart session");
            session_id
        }
    };

    let parts = ctx.repo.list_parts(id).await?;
    let mut done: u64 = parts
        .iter()
        .filter(|p| p.status == PartStatus::Completed)
        .map(|p| p.size as u64)
        .sum();
    ctx.report_progress(done, total).await?;

    for part in parts.iter().filter(|p| p.status != PartStatus::Completed) {
        ctx.checkpoint()?;
        let body = read_chunk(&mut file, part.byte_offset as u64, part.size as u64).await?;
        let store = ctx.store.clone();
        let part_key = key.clone();
        let part_session = session_id.clone();
        let part_number = part.part_number;
        let etag = ctx
            .with_retry("upload part", || {
                let store = store.clone();
                let key = part_key.clone();
                let session_id = part_session.clone();
                let body = body.clone();
                async move {
                    store
                        .upload_part(&key, &session_id, part_number, body)
                        .await
                        .map_err(TransferError::from)
                }
            })
            .await?;
        ctx.repo.complete_part(id, part_number, &etag).await?;
        done += part.size as u64;
        debug!(transfer_id = id, part_number, done, total, "part uploaded");
        ctx.report_progress(done, total).await?;
    }

    ctx.checkpoint()?;
    let completed: Vec<CompletedPart> = ctx
        .repo
        .list_parts(id)
        .await?
        .into_iter()
        .map(|p| CompletedPart {
            part_number: p.part_number,
            etag: p.etag.unwrap_or_default(),
        })
        .collect();
    let store = ctx.store.clone();
    let complete_session = session_id.clone();
    ctx.with_retry("complete multipart session", || {
        let store = store.clone();
        let key = key.clone();
        let session_id = complete_session.clone();
        let completed = completed.clone();
        async move {
            store
                .complete_multipart_session(&key, &session_id, &completed)
                .await
                .map_err(TransferError::from)
        }
    })
    .await?;

    ctx.repo.delete_parts(id).await?;
    ctx.repo.set_session(id, None).await?;
    ctx.report_complete(total).await?;
    info!(transfer_id = id, session_id = %session_id, total, "multipart upload completed");
    Ok(total)
}

/// Align local part records with what the store reports for the session.
///
/// Returns `false` when the store has no such session.
async fn reconcile(
    ctx: &mut WorkerContext,
    key: &str,
    session_id: &str,
    parts: &[TransferPart],
) -> StepResult<bool> {
    let store = ctx.store.clone();
    let list_key = key.to_string();
    let list_session = session_id.to_string();
    let listed = ctx
        .with_retry("list parts", || {
            let store = store.clone();
            let key = list_key.clone();
            let session_id = list_session.clone();
            async move {
                store
                    .list_parts(&key, &session_id)
                    .await
                    .map_err(TransferError::from)
            }
        })
        .await;
    let remote = match listed {
        Ok(remote) => remote,
        Err(StepError::Failed(TransferError::Store(StoreError::SessionNotFound(_)))) => {
            return Ok(false);
        }
        Err(err) => return Err(err),
    };

    let confirmed: HashMap<i64, _> = remote.iter().map(|p| (p.part_number, p)).collect();
    let mut resumed = 0;
    for part in parts {
        match confirmed.get(&part.part_number) {
            Some(remote) if remote.size_bytes == part.size => {
                if part.status != PartStatus::Completed || part.etag.as_deref() != Some(remote.etag.as_str()) {
                    ctx.repo
                        .complete_part(part.transfer_id, part.part_number, &remote.etag)
                        .await?;
                }
                resumed += 1;
            }
            _ if part.status == PartStatus::Completed => {
                ctx.repo.reset_part(part.transfer_id, part.part_number).await?;
            }
            _ => {}
        }
    }
    info!(
        transfer_id = ctx.transfer_id,
        session_id,
        confirmed = resumed,
        total = parts.len(),
        "reconciled parts with store"
    );
    Ok(true)
}

async fn read_chunk(file: &mut File, offset: u64, len: u64) -> std::io::Result<Bytes> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
