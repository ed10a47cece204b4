//! Listing cache behaviour seen through the navigation service: cache hits,
//! optimistic updates from transfers and file operations, and revalidation
//! racing with local changes.

mod common;

use bytes::Bytes;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use common::{Harness, eventually, test_config, write_file};
use object_transfer::{
    CacheConfig, FileOperations, ListingCache, ListingConsumer, ListingService, NewTransfer,
    ObjectPatch, ObjectStore, StorageObject, services::listing::fetch_all,
};

/// Table model stand-in that applies every event to its own rows.
#[derive(Clone, Default)]
struct Recorder {
    rows: Arc<Mutex<Vec<StorageObject>>>,
    inserts: Arc<Mutex<Vec<(String, usize)>>>,
}

impl Recorder {
    fn keys(&self) -> Vec<String> {
        self.rows.lock().unwrap().iter().map(|row| row.key.clone()).collect()
    }
}

impl ListingConsumer for Recorder {
    fn on_insert(&mut self, item: &StorageObject, position: usize) {
        self.rows.lock().unwrap().insert(position, item.clone());
        self.inserts.lock().unwrap().push((item.key.clone(), position));
    }

    fn on_remove(&mut self, key: &str) {
        self.rows.lock().unwrap().retain(|row| row.key != key);
    }

    fn on_update(&mut self, key: &str, patch: &ObjectPatch) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|row| row.key == key) {
            if let (object_transfer::EntryKind::Object(meta), Some(size)) = (&mut row.kind, patch.size) {
                meta.size = size;
            }
        }
    }

    fn on_batch_append(&mut self, items: &[StorageObject]) {
        self.rows.lock().unwrap().extend_from_slice(items);
    }
}

async fn seed(h: &Harness) {
    seed_keys(h, &["docs/a.txt", "docs/b.txt", "docs/sub/c.txt", "top.txt"]).await;
}

async fn seed_keys(h: &Harness, keys: &[&str]) {
    for key in keys {
        h.store
            .inner()
            .put_object(key, Bytes::from(key.as_bytes().to_vec()))
            .await
            .unwrap();
    }
}

fn service(h: &Harness, config: CacheConfig) -> (ListingService, Recorder) {
    let recorder = Recorder::default();
    let listing = ListingService::new(
        h.store.clone(),
        Arc::new(ListingCache::new(config)),
        Box::new(recorder.clone()),
    );
    (listing, recorder)
}

fn cached_keys(listing: &ListingService, prefix: &str) -> Vec<String> {
    listing
        .cache()
        .get(prefix)
        .map(|snapshot| snapshot.items.into_iter().map(|item| item.key).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn second_visit_is_served_from_cache() {
    let h = Harness::new().await;
    seed(&h).await;
    let (listing, recorder) = service(&h, CacheConfig::default());

    let first = listing.navigate("docs/").await.unwrap();
    assert!(!first.from_cache);
    let keys: Vec<&str> = first.items.iter().map(|item| item.key.as_str()).collect();
    assert_eq!(keys, ["docs/sub/", "docs/a.txt", "docs/b.txt"]);
    assert_eq!(recorder.keys(), keys);
    assert_eq!(h.store.list_calls(), 1);

    let second = listing.navigate("docs/").await.unwrap();
    assert!(second.from_cache);
    assert!(second.revalidation.is_none());
    assert_eq!(second.items, first.items);
    assert_eq!(h.store.list_calls(), 1);
    assert_eq!(listing.current_prefix().as_deref(), Some("docs/"));
}

#[tokio::test]
async fn stale_hit_is_refreshed_in_the_background() {
    let h = Harness::new().await;
    seed(&h).await;
    let (listing, recorder) = service(
        &h,
        CacheConfig {
            max_entries: 30,
            stale_after: Duration::ZERO,
        },
    );
    listing.navigate("docs/").await.unwrap();
    recorder.rows.lock().unwrap().clear();

    h.store
        .inner()
        .put_object("docs/fresh.txt", Bytes::from_static(b"new"))
        .await
        .unwrap();
    let hit = listing.navigate("docs/").await.unwrap();
    assert!(hit.from_cache);
    assert!(!hit.items.iter().any(|item| item.key == "docs/fresh.txt"));

    hit.revalidation.expect("stale hit revalidates").await.unwrap();
    assert_eq!(
        cached_keys(&listing, "docs/"),
        ["docs/sub/", "docs/a.txt", "docs/b.txt", "docs/fresh.txt"]
    );
    assert_eq!(recorder.keys(), cached_keys(&listing, "docs/"));
}

#[tokio::test]
async fn completed_uploads_appear_without_a_refetch() {
    let h = Harness::new().await;
    seed(&h).await;
    let (listing, recorder) = service(&h, CacheConfig::default());
    listing.navigate("docs/").await.unwrap();

    let engine = h.engine(test_config(2));
    let bridge = listing.attach_engine(&engine);

    let report = h.file("report.pdf");
    let sheet = h.file("q1.csv");
    write_file(&report, b"%PDF-1.7");
    write_file(&sheet, b"a,b\n1,2\n");
    engine
        .submit(NewTransfer::upload(&report, "docs/report.pdf"))
        .await
        .unwrap();
    engine
        .submit(NewTransfer::upload(&sheet, "docs/2026/q1.csv"))
        .await
        .unwrap();
    engine.wait_idle().await;

    eventually("uploads mirrored into the cache", || {
        let keys = cached_keys(&listing, "docs/");
        keys.iter().any(|k| k == "docs/report.pdf") && keys.iter().any(|k| k == "docs/2026/")
    })
    .await;

    assert_eq!(h.store.list_calls(), 1);
    assert_eq!(
        cached_keys(&listing, "docs/"),
        ["docs/2026/", "docs/sub/", "docs/a.txt", "docs/b.txt", "docs/report.pdf"]
    );
    assert_eq!(recorder.keys(), cached_keys(&listing, "docs/"));
    let size = listing.lookup("docs/report.pdf").and_then(|item| item.size());
    assert_eq!(size, Some(8));

    engine.shutdown();
    bridge.abort();
}

#[tokio::test]
async fn revalidation_keeps_local_changes_made_during_the_fetch() {
    let h = Harness::new().await;
    seed(&h).await;
    let (listing, recorder) = service(&h, CacheConfig::default());
    listing.navigate("docs/").await.unwrap();
    let counter = listing.cache().mutation_counter("docs/").unwrap();

    // An upload finishes locally while a refresh is in flight, and the store
    // has meanwhile changed on its own.
    listing.notify_upload_complete("docs/local.bin", 4);
    h.store
        .inner()
        .put_object("docs/remote.bin", Bytes::from_static(b"remote"))
        .await
        .unwrap();
    h.store
        .inner()
        .delete_objects(&["docs/a.txt".to_string()])
        .await
        .unwrap();

    listing.revalidate("docs/", counter).await;
    assert_eq!(
        cached_keys(&listing, "docs/"),
        ["docs/sub/", "docs/b.txt", "docs/local.bin", "docs/remote.bin"]
    );
    assert!(listing.cache().get("docs/").unwrap().dirty);
    assert_eq!(recorder.keys(), cached_keys(&listing, "docs/"));

    // A refresh with no mutation in between takes the store's word.
    listing.refresh().await.unwrap();
    assert_eq!(
        cached_keys(&listing, "docs/"),
        ["docs/sub/", "docs/b.txt", "docs/remote.bin"]
    );
    assert!(!listing.cache().get("docs/").unwrap().dirty);
    assert_eq!(recorder.keys(), cached_keys(&listing, "docs/"));
}

#[tokio::test]
async fn revalidation_does_not_resurrect_locally_deleted_keys() {
    let h = Harness::new().await;
    seed(&h).await;
    let (listing, _recorder) = service(&h, CacheConfig::default());
    listing.navigate("docs/").await.unwrap();
    let counter = listing.cache().mutation_counter("docs/").unwrap();

    listing.notify_delete_complete(&["docs/b.txt".to_string()]);
    listing.revalidate("docs/", counter).await;

    assert_eq!(cached_keys(&listing, "docs/"), ["docs/sub/", "docs/a.txt"]);
}

#[tokio::test]
async fn failed_rename_rolls_the_listing_back() {
    let h = Harness::new().await;
    seed(&h).await;
    let (listing, recorder) = service(&h, CacheConfig::default());
    listing.navigate("docs/").await.unwrap();
    let before = cached_keys(&listing, "docs/");
    let ops = FileOperations::new(h.store.clone(), listing.clone());

    h.store.deny_writes(true);
    assert!(ops.rename_object("docs/a.txt", "docs/z.txt").await.is_err());
    assert_eq!(cached_keys(&listing, "docs/"), before);
    assert_eq!(recorder.keys(), before);

    h.store.deny_writes(false);
    ops.rename_object("docs/a.txt", "docs/z.txt").await.unwrap();
    assert_eq!(
        cached_keys(&listing, "docs/"),
        ["docs/sub/", "docs/b.txt", "docs/z.txt"]
    );
    assert!(h.store.head_object("docs/a.txt").await.is_err());
    let moved = h.store.get_object_range("docs/z.txt", None).await.unwrap();
    assert_eq!(&moved[..], b"docs/a.txt");
    assert_eq!(recorder.keys(), cached_keys(&listing, "docs/"));
}

#[tokio::test]
async fn folder_copy_and_delete_update_the_listing() {
    let h = Harness::new().await;
    seed(&h).await;
    let (listing, recorder) = service(&h, CacheConfig::default());
    listing.navigate("docs/").await.unwrap();
    let ops = FileOperations::new(h.store.clone(), listing.clone());

    let folder = ops.create_folder("docs/new").await.unwrap();
    assert_eq!(folder, "docs/new/");
    assert!(h.store.head_object("docs/new/").await.is_ok());

    ops.copy_object("docs/a.txt", "docs/a-copy.txt").await.unwrap();
    assert_eq!(
        cached_keys(&listing, "docs/"),
        ["docs/new/", "docs/sub/", "docs/a-copy.txt", "docs/a.txt", "docs/b.txt"]
    );

    h.store.deny_writes(true);
    assert!(ops.delete_objects(&["docs/b.txt".to_string()]).await.is_err());
    assert!(cached_keys(&listing, "docs/").contains(&"docs/b.txt".to_string()));

    h.store.deny_writes(false);
    let deleted = ops
        .delete_objects(&["docs/b.txt".to_string(), "docs/missing.txt".to_string()])
        .await
        .unwrap();
    assert_eq!(deleted, ["docs/b.txt"]);
    assert_eq!(
        cached_keys(&listing, "docs/"),
        ["docs/new/", "docs/sub/", "docs/a-copy.txt", "docs/a.txt"]
    );
    assert_eq!(recorder.keys(), cached_keys(&listing, "docs/"));
}

#[tokio::test]
async fn folders_split_across_pages_are_listed_once() {
    let h = Harness::with_page_size(2).await;
    seed_keys(&h, &["a/1", "a/2", "a/3", "b.txt"]).await;

    let fetched = fetch_all(h.store.as_ref(), "").await.unwrap();
    let keys: Vec<&str> = fetched.iter().map(|item| item.key.as_str()).collect();
    assert_eq!(keys, ["a/", "b.txt"]);

    let (listing, recorder) = service(&h, CacheConfig::default());
    let nav = listing.navigate("").await.unwrap();
    let keys: Vec<&str> = nav.items.iter().map(|item| item.key.as_str()).collect();
    assert_eq!(keys, ["a/", "b.txt"]);
    assert_eq!(cached_keys(&listing, ""), keys);
    assert_eq!(recorder.keys(), keys);
}

#[tokio::test]
async fn paged_miss_leaves_consumer_rows_in_cache_order() {
    let h = Harness::with_page_size(2).await;
    seed_keys(&h, &["b.txt", "c.txt", "d/x"]).await;
    let (listing, recorder) = service(&h, CacheConfig::default());

    listing.navigate("").await.unwrap();
    assert!(h.store.list_calls() >= 2);
    assert_eq!(cached_keys(&listing, ""), ["d/", "b.txt", "c.txt"]);
    assert_eq!(recorder.keys(), cached_keys(&listing, ""));

    listing.notify_upload_complete("a.txt", 1);
    assert_eq!(cached_keys(&listing, ""), ["d/", "a.txt", "b.txt", "c.txt"]);
    assert_eq!(recorder.keys(), cached_keys(&listing, ""));
    assert_eq!(
        recorder.inserts.lock().unwrap().last().cloned(),
        Some(("a.txt".to_string(), 1))
    );
}

#[tokio::test]
async fn late_revalidation_keeps_uploads_made_after_the_prefix_was_refetched() {
    let h = Harness::new().await;
    seed(&h).await;
    let (listing, recorder) = service(&h, CacheConfig::default());
    listing.navigate("docs/").await.unwrap();

    listing.notify_delete_complete(&["docs/a.txt".to_string()]);
    listing.notify_delete_complete(&["docs/b.txt".to_string()]);
    let counter = listing.cache().mutation_counter("docs/").unwrap();

    // The entry is dropped and fetched again while an older refresh is
    // still out, then an upload lands in the new entry.
    listing.cache().invalidate("docs/");
    recorder.rows.lock().unwrap().clear();
    listing.navigate("docs/").await.unwrap();
    assert!(listing.cache().mutation_counter("docs/").unwrap() >= counter);
    listing.notify_upload_complete("docs/late.bin", 3);

    listing.revalidate("docs/", counter).await;
    assert_eq!(
        cached_keys(&listing, "docs/"),
        ["docs/sub/", "docs/a.txt", "docs/b.txt", "docs/late.bin"]
    );
    assert_eq!(recorder.keys(), cached_keys(&listing, "docs/"));
}
