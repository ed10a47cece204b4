//! Scheduling, pause/resume, cancellation and retry through the public engine API.

mod common;

use bytes::Bytes;
use std::time::Duration;

use common::{Harness, admission_order, drain, eventually, random_bytes, test_config, write_file};
use object_transfer::{
    NewTransfer, ObjectStore, StoreError, TransferEvent, TransferRepository, TransferStatus,
};

const MIB: usize = 1024 * 1024;

#[tokio::test]
async fn five_uploads_run_two_at_a_time_in_fifo_order() {
    let h = Harness::new().await;
    h.store.set_delay(Duration::from_millis(100));
    let engine = h.engine(test_config(2));
    let mut events = engine.subscribe();

    let mut ids = Vec::new();
    for n in 0..5 {
        let path = h.file(&format!("f{n}.bin"));
        write_file(&path, &random_bytes(64 * 1024, n));
        let t = engine
            .submit(NewTransfer::upload(&path, format!("batch/f{n}.bin")))
            .await
            .unwrap();
        ids.push(t.id);
    }
    engine.wait_idle().await;

    assert_eq!(h.store.max_in_flight(), 2);
    assert_eq!(admission_order(&drain(&mut events)), ids);
    for id in &ids {
        assert_eq!(engine.transfer(*id).await.unwrap().status, TransferStatus::Completed);
    }
    let page = h.store.list_objects("batch/", None).await.unwrap();
    assert_eq!(page.objects.len(), 5);
}

#[tokio::test]
async fn paused_upload_resumes_to_identical_object() {
    let h = Harness::new().await;
    h.store.set_delay(Duration::from_millis(150));
    let engine = h.engine(test_config(1));

    let data = random_bytes(20 * MIB, 11);
    let path = h.file("big.bin");
    write_file(&path, &data);
    let t = engine
        .submit(NewTransfer::upload(&path, "big.bin"))
        .await
        .unwrap();

    let store = h.store.clone();
    eventually("first part upload", || !store.uploaded_parts().is_empty()).await;
    engine.pause(t.id).await.unwrap();
    engine.wait_idle().await;

    let paused = engine.transfer(t.id).await.unwrap();
    assert_eq!(paused.status, TransferStatus::Paused);
    assert!(paused.session_id.is_some());
    assert!(h.store.head_object("big.bin").await.is_err());

    engine.resume(t.id).await.unwrap();
    engine.wait_idle().await;

    let done = engine.transfer(t.id).await.unwrap();
    assert_eq!(done.status, TransferStatus::Completed);
    assert_eq!(done.transferred, data.len() as i64);
    assert!(done.session_id.is_none());

    let body = h.store.get_object_range("big.bin", None).await.unwrap();
    assert_eq!(body, Bytes::from(data));

    // Every part went out exactly once across both runs.
    let mut parts = h.store.uploaded_parts();
    parts.sort();
    assert_eq!(parts, vec![1, 2, 3]);
}

#[tokio::test]
async fn cancelled_upload_leaves_no_object_or_session() {
    let h = Harness::new().await;
    h.store.set_delay(Duration::from_millis(150));
    let engine = h.engine(test_config(1));
    let mut events = engine.subscribe();

    let path = h.file("doomed.bin");
    write_file(&path, &random_bytes(20 * MIB, 3));
    let t = engine
        .submit(NewTransfer::upload(&path, "doomed.bin"))
        .await
        .unwrap();

    let store = h.store.clone();
    eventually("first part upload", || !store.uploaded_parts().is_empty()).await;
    engine.cancel(t.id).await.unwrap();
    engine.wait_idle().await;

    let cancelled = engine.transfer(t.id).await.unwrap();
    assert_eq!(cancelled.status, TransferStatus::Cancelled);
    assert!(cancelled.session_id.is_none());
    assert!(matches!(
        h.store.head_object("doomed.bin").await,
        Err(StoreError::NotFound(_))
    ));
    assert!(h.store.list_multipart_sessions().await.unwrap().is_empty());
    assert!(h.repo.list_parts(t.id).await.unwrap().is_empty());

    let finished = drain(&mut events)
        .into_iter()
        .any(|event| matches!(event, TransferEvent::Finished { .. }));
    assert!(!finished);
}

#[tokio::test]
async fn cancelling_a_queued_transfer_skips_it() {
    let h = Harness::new().await;
    h.store.set_delay(Duration::from_millis(100));
    let engine = h.engine(test_config(1));

    let first = h.file("first.bin");
    let second = h.file("second.bin");
    write_file(&first, b"first");
    write_file(&second, b"second");
    let a = engine.submit(NewTransfer::upload(&first, "first.bin")).await.unwrap();
    let b = engine.submit(NewTransfer::upload(&second, "second.bin")).await.unwrap();

    engine.cancel(b.id).await.unwrap();
    engine.wait_idle().await;

    assert_eq!(engine.transfer(a.id).await.unwrap().status, TransferStatus::Completed);
    assert_eq!(engine.transfer(b.id).await.unwrap().status, TransferStatus::Cancelled);
    assert_eq!(h.store.put_calls(), 1);
    assert!(engine.cancel(b.id).await.is_err());
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let h = Harness::new().await;
    h.store.fail_next(2);
    let engine = h.engine(test_config(1));

    let path = h.file("flaky.txt");
    write_file(&path, b"eventually consistent");
    let t = engine
        .submit(NewTransfer::upload(&path, "flaky.txt"))
        .await
        .unwrap();
    engine.wait_idle().await;

    let done = engine.transfer(t.id).await.unwrap();
    assert_eq!(done.status, TransferStatus::Completed);
    assert_eq!(done.retry_count, 2);
    assert_eq!(h.store.put_calls(), 3);
}

#[tokio::test]
async fn exhausted_retries_fail_the_transfer() {
    let h = Harness::new().await;
    h.store.fail_next(10);
    let engine = h.engine(test_config(1));

    let path = h.file("down.txt");
    write_file(&path, b"nobody home");
    let t = engine
        .submit(NewTransfer::upload(&path, "down.txt"))
        .await
        .unwrap();
    engine.wait_idle().await;

    let failed = engine.transfer(t.id).await.unwrap();
    assert_eq!(failed.status, TransferStatus::Failed);
    assert_eq!(h.store.put_calls(), 3);
    assert!(failed.error_message.unwrap().contains("scripted timeout"));
}

#[tokio::test]
async fn permission_denied_fails_without_retry_and_can_be_retried_later() {
    let h = Harness::new().await;
    h.store.deny_writes(true);
    let engine = h.engine(test_config(1));
    let mut events = engine.subscribe();

    let path = h.file("secret.txt");
    write_file(&path, b"classified");
    let t = engine
        .submit(NewTransfer::upload(&path, "secret.txt"))
        .await
        .unwrap();
    engine.wait_idle().await;

    let failed = engine.transfer(t.id).await.unwrap();
    assert_eq!(failed.status, TransferStatus::Failed);
    assert_eq!(failed.retry_count, 0);
    assert_eq!(h.store.put_calls(), 1);

    let message = drain(&mut events).into_iter().find_map(|event| match event {
        TransferEvent::Error { user_message, .. } => Some(user_message),
        _ => None,
    });
    assert_eq!(
        message.as_deref(),
        Some("Access denied. Your credentials don't allow this action.")
    );

    h.store.deny_writes(false);
    engine.retry(t.id).await.unwrap();
    engine.wait_idle().await;
    assert_eq!(engine.transfer(t.id).await.unwrap().status, TransferStatus::Completed);

    // Only failed transfers can be retried.
    assert!(engine.retry(t.id).await.is_err());
}

#[tokio::test]
async fn upload_of_missing_file_fails_as_local_precondition() {
    let h = Harness::new().await;
    let engine = h.engine(test_config(1));
    let mut events = engine.subscribe();

    let t = engine
        .submit(NewTransfer::upload(h.file("nope.bin"), "nope.bin"))
        .await
        .unwrap();
    engine.wait_idle().await;

    assert_eq!(engine.transfer(t.id).await.unwrap().status, TransferStatus::Failed);
    assert_eq!(h.store.put_calls(), 0);
    let message = drain(&mut events).into_iter().find_map(|event| match event {
        TransferEvent::Error { user_message, .. } => Some(user_message),
        _ => None,
    });
    assert_eq!(message.as_deref(), Some("Source file no longer exists."));
}

#[tokio::test]
async fn download_writes_verified_file() {
    let h = Harness::new().await;
    let data = random_bytes(12 * MIB, 5);
    h.store
        .inner()
        .put_object("media/clip.bin", Bytes::from(data.clone()))
        .await
        .unwrap();
    let engine = h.engine(test_config(1));
    let mut events = engine.subscribe();

    let dest = h.file("clip.bin");
    let t = engine
        .submit(NewTransfer::download("media/clip.bin", &dest))
        .await
        .unwrap();
    engine.wait_idle().await;

    assert_eq!(engine.transfer(t.id).await.unwrap().status, TransferStatus::Completed);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    let starts: Vec<u64> = h.store.ranges().iter().map(|r| r.start).collect();
    assert_eq!(starts, vec![0, 8 * MIB as u64]);

    let progress: Vec<u64> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            TransferEvent::Progress { bytes_done, .. } => Some(bytes_done),
            _ => None,
        })
        .collect();
    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(progress.last().copied(), Some(data.len() as u64));
}

#[tokio::test]
async fn download_into_missing_directory_fails_before_any_request() {
    let h = Harness::new().await;
    h.store
        .inner()
        .put_object("a.txt", Bytes::from_static(b"a"))
        .await
        .unwrap();
    let engine = h.engine(test_config(1));

    let dest = h.dir.path().join("gone").join("a.txt");
    let t = engine.submit(NewTransfer::download("a.txt", &dest)).await.unwrap();
    engine.wait_idle().await;

    let failed = engine.transfer(t.id).await.unwrap();
    assert_eq!(failed.status, TransferStatus::Failed);
    assert!(h.store.ranges().is_empty());
}

#[tokio::test]
async fn pause_all_parks_queued_work_and_resume_all_finishes_it() {
    let h = Harness::new().await;
    h.store.set_delay(Duration::from_millis(100));
    let engine = h.engine(test_config(1));

    let mut ids = Vec::new();
    for n in 0..3 {
        let path = h.file(&format!("p{n}.txt"));
        write_file(&path, format!("payload {n}").as_bytes());
        ids.push(
            engine
                .submit(NewTransfer::upload(&path, format!("p{n}.txt")))
                .await
                .unwrap()
                .id,
        );
    }
    engine.pause_all().await.unwrap();
    engine.wait_idle().await;
    for id in &ids[1..] {
        assert_eq!(engine.transfer(*id).await.unwrap().status, TransferStatus::Paused);
    }

    engine.resume_all().await.unwrap();
    engine.wait_idle().await;
    for id in &ids {
        assert_eq!(engine.transfer(*id).await.unwrap().status, TransferStatus::Completed);
    }
}

#[tokio::test]
async fn failed_completion_keeps_transferred_below_total() {
    let h = Harness::new().await;
    h.store.deny_completion(true);
    let engine = h.engine(test_config(1));

    let data = random_bytes(20 * MIB, 12);
    let path = h.file("held.bin");
    write_file(&path, &data);
    let t = engine
        .submit(NewTransfer::upload(&path, "held.bin"))
        .await
        .unwrap();
    engine.wait_idle().await;

    let total = data.len() as i64;
    let failed = engine.transfer(t.id).await.unwrap();
    assert_eq!(failed.status, TransferStatus::Failed);
    assert_eq!(failed.total_bytes, Some(total));
    assert_eq!(failed.transferred, total - 1);

    h.store.deny_completion(false);
    engine.retry(t.id).await.unwrap();
    engine.wait_idle().await;

    let done = engine.transfer(t.id).await.unwrap();
    assert_eq!(done.status, TransferStatus::Completed);
    assert_eq!(done.transferred, total);
    // The parts sent before the failure were reused.
    assert_eq!(h.store.uploaded_parts(), vec![1, 2, 3]);
}

#[tokio::test]
async fn pause_after_last_part_keeps_transferred_below_total() {
    let h = Harness::new().await;
    h.store.set_delay(Duration::from_millis(150));
    let engine = h.engine(test_config(1));

    let data = random_bytes(20 * MIB, 13);
    let path = h.file("last.bin");
    write_file(&path, &data);
    let t = engine
        .submit(NewTransfer::upload(&path, "last.bin"))
        .await
        .unwrap();

    let store = h.store.clone();
    eventually("last part upload", || store.uploaded_parts().len() == 3).await;
    engine.pause(t.id).await.unwrap();
    engine.wait_idle().await;

    let total = data.len() as i64;
    let paused = engine.transfer(t.id).await.unwrap();
    assert_eq!(paused.status, TransferStatus::Paused);
    assert!(paused.transferred < total);
    assert!(h.store.head_object("last.bin").await.is_err());

    engine.resume(t.id).await.unwrap();
    engine.wait_idle().await;
    let done = engine.transfer(t.id).await.unwrap();
    assert_eq!(done.status, TransferStatus::Completed);
    assert_eq!(done.transferred, total);
}
