//! Navigation over cached listings.
//!
//! `navigate` serves the cache first and refreshes stale entries in the
//! background. File-mutating completions land in the cache as optimistic
//! mutations and reach the consumer as granular events when they touch the
//! prefix on screen.

use chrono::Utc;
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    constants::{DEFAULT_STORAGE_CLASS, DELIMITER},
    errors::StoreError,
    models::{
        object::{EntryKind, ObjectMeta, StorageObject, parent_prefix},
        transfer::Direction,
    },
    services::{
        engine::TransferEngine,
        listing_cache::ListingCache,
        listing_merge::{ListingConsumer, sort_listing},
        object_store::{ListPage, ObjectStore, StoreResult},
        worker::TransferEvent,
    },
};

/// Result of a navigation request.
#[derive(Debug)]
pub struct Navigation {
    pub items: Vec<StorageObject>,
    pub from_cache: bool,
    /// Background refresh started for a stale hit.
    pub revalidation: Option<JoinHandle<()>>,
}

type SharedConsumer = Arc<Mutex<Box<dyn ListingConsumer>>>;

#[derive(Clone)]
pub struct ListingService {
    store: Arc<dyn ObjectStore>,
    cache: Arc<ListingCache>,
    consumer: SharedConsumer,
    current: Arc<Mutex<Option<String>>>,
}

impl ListingService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        cache: Arc<ListingCache>,
        consumer: Box<dyn ListingConsumer>,
    ) -> Self {
        Self {
            store,
            cache,
            consumer: Arc::new(Mutex::new(consumer)),
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn cache(&self) -> &Arc<ListingCache> {
        &self.cache
    }

    pub fn current_prefix(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_current(&self, prefix: &str) -> bool {
        self.current_prefix().as_deref() == Some(prefix)
    }

    fn consumer(&self) -> MutexGuard<'_, Box<dyn ListingConsumer>> {
        self.consumer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Show `prefix`: cached items right away, or on a miss the whole
    /// paginated listing, delivered sorted once every page is in.
    pub async fn navigate(&self, prefix: &str) -> StoreResult<Navigation> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(prefix.to_string());

        if let Some(snapshot) = self.cache.get(prefix) {
            debug!(prefix, stale = snapshot.stale, "listing cache hit");
            self.consumer().on_batch_append(&snapshot.items);
            let revalidation = snapshot.stale.then(|| {
                let service = self.clone();
                let prefix = prefix.to_string();
                let counter = snapshot.counter;
                tokio::spawn(async move { service.revalidate(&prefix, counter).await })
            });
            return Ok(Navigation {
                items: snapshot.items,
                from_cache: true,
                revalidation,
            });
        }

        debug!(prefix, "listing cache miss");
        let items = fetch_all(self.store.as_ref(), prefix).await?;
        {
            let mut consumer = self.consumer();
            self.cache.put(prefix, items.clone());
            if self.is_current(prefix) && !items.is_empty() {
                consumer.on_batch_append(&items);
            }
        }
        Ok(Navigation {
            items,
            from_cache: false,
            revalidation: None,
        })
    }

    /// Refetch the current prefix and apply the differences in place.
    pub async fn refresh(&self) -> StoreResult<()> {
        let Some(prefix) = self.current_prefix() else {
            return Ok(());
        };
        match self.cache.mutation_counter(&prefix) {
            Some(counter) => {
                let fetched = fetch_all(self.store.as_ref(), &prefix).await?;
                self.merge_fetched(&prefix, fetched, counter);
            }
            None => {
                self.navigate(&prefix).await?;
            }
        }
        Ok(())
    }

    /// Background refresh of a stale entry. Failures keep the cached data.
    pub async fn revalidate(&self, prefix: &str, counter_at_start: u64) {
        match fetch_all(self.store.as_ref(), prefix).await {
            Ok(fetched) => self.merge_fetched(prefix, fetched, counter_at_start),
            Err(err) => warn!(prefix, "revalidation failed: {}", err),
        }
    }

    fn merge_fetched(&self, prefix: &str, fetched: Vec<StorageObject>, counter_at_start: u64) {
        let mut consumer = self.consumer();
        if let Some(diff) = self.cache.safe_revalidate(prefix, fetched, counter_at_start) {
            debug!(
                prefix,
                inserted = diff.inserted.len(),
                removed = diff.removed.len(),
                updated = diff.updated.len(),
                "revalidated listing"
            );
            if self.is_current(prefix) && !diff.is_empty() {
                diff.dispatch(&mut **consumer);
            }
        }
    }

    /// Apply `mutate` to a cached prefix, forwarding the change set when that
    /// prefix is on screen.
    fn mutate<F>(&self, prefix: &str, mutate: F)
    where
        F: FnOnce(&mut Vec<StorageObject>),
    {
        let mut consumer = self.consumer();
        if let Some(diff) = self.cache.apply_mutation(prefix, mutate) {
            if self.is_current(prefix) && !diff.is_empty() {
                diff.dispatch(&mut **consumer);
            }
        }
    }

    /// Insert or replace entries in their parent listings.
    pub fn insert_items(&self, items: Vec<StorageObject>) {
        let mut by_parent: BTreeMap<String, Vec<StorageObject>> = BTreeMap::new();
        for item in items {
            by_parent.entry(parent_prefix(&item.key)).or_default().push(item);
        }
        for (prefix, group) in by_parent {
            self.mutate(&prefix, |listing| {
                listing.retain(|existing| !group.iter().any(|item| item.key == existing.key));
                listing.extend(group);
            });
        }
    }

    /// Drop keys from their parent listings.
    pub fn remove_keys(&self, keys: &[String]) {
        let mut by_parent: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for key in keys {
            by_parent.entry(parent_prefix(key)).or_default().push(key);
        }
        for (prefix, group) in by_parent {
            self.mutate(&prefix, |listing| {
                listing.retain(|existing| !group.contains(&existing.key.as_str()));
            });
        }
    }

    /// Cached entry for `key`, if its parent listing is cached.
    pub fn lookup(&self, key: &str) -> Option<StorageObject> {
        self.cache.find(&parent_prefix(key), key)
    }

    pub fn notify_upload_complete(&self, key: &str, size: u64) {
        let item = StorageObject::object(
            key,
            ObjectMeta {
                size,
                last_modified: Utc::now(),
                storage_class: Some(DEFAULT_STORAGE_CLASS.to_string()),
                etag: None,
            },
        );
        let mut items = vec![item];
        // Intermediate folders become visible in their parents too.
        let mut folder = parent_prefix(key);
        while !folder.is_empty() {
            items.push(StorageObject::container(folder.clone()));
            folder = parent_prefix(&folder);
        }
        self.insert_items(items);
    }

    pub fn notify_delete_complete(&self, keys: &[String]) {
        self.remove_keys(keys);
    }

    pub fn notify_rename_complete(&self, old_key: &str, new_key: &str) {
        let moved = self.lookup(old_key);
        self.remove_keys(&[old_key.to_string()]);
        if let Some(item) = moved {
            self.insert_items(vec![with_key(item, new_key)]);
        }
    }

    pub fn notify_copy_complete(&self, src_key: &str, dst_key: &str) {
        if let Some(item) = self.lookup(src_key) {
            self.insert_items(vec![with_key(item, dst_key)]);
        }
    }

    pub fn notify_new_folder(&self, key: &str) {
        self.insert_items(vec![StorageObject::container(folder_key(key))]);
    }

    /// Mirror completed uploads from `engine` into the cache until the
    /// engine's event stream closes.
    pub fn attach_engine(&self, engine: &TransferEngine) -> JoinHandle<()> {
        let mut events = engine.subscribe();
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransferEvent::Finished {
                        direction: Direction::Upload,
                        key,
                        size,
                        ..
                    }) => service.notify_upload_complete(&key, size),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "listing bridge lagged behind transfer events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            info!("listing bridge stopped");
        })
    }
}

/// Same entry under a different key.
pub(crate) fn with_key(item: StorageObject, key: &str) -> StorageObject {
    match item.kind {
        EntryKind::Object(meta) => StorageObject::object(key, meta),
        EntryKind::Container => StorageObject::container(folder_key(key)),
    }
}

/// `key` with exactly one trailing delimiter.
pub(crate) fn folder_key(key: &str) -> String {
    if key.ends_with(DELIMITER) {
        key.to_string()
    } else {
        format!("{key}{DELIMITER}")
    }
}

/// Listing entries of one page; the prefix's own marker object is skipped.
fn page_items(prefix: &str, page: ListPage) -> Vec<StorageObject> {
    let mut items: Vec<StorageObject> = page
        .prefixes
        .into_iter()
        .filter(|common| common != prefix)
        .map(StorageObject::container)
        .collect();
    items.extend(
        page.objects
            .into_iter()
            .filter(|object| object.key != prefix)
            .map(|object| {
                let meta = object.meta();
                StorageObject::object(object.key, meta)
            }),
    );
    items
}

/// Every entry under `prefix`, following continuation tokens to the end.
/// Keys repeated across pages are kept once.
pub async fn fetch_all(store: &dyn ObjectStore, prefix: &str) -> StoreResult<Vec<StorageObject>> {
    let mut items = Vec::new();
    let mut seen = HashSet::new();
    let mut token: Option<String> = None;
    loop {
        let page = store.list_objects(prefix, token.as_deref()).await?;
        let next = page.next_token.clone();
        for item in page_items(prefix, page) {
            if seen.insert(item.key.clone()) {
                items.push(item);
            }
        }
        match next {
            Some(next) if Some(&next) == token.as_ref() => {
                return Err(StoreError::backend(format!(
                    "listing of `{prefix}` returned a repeated continuation token"
                )));
            }
            Some(next) => token = Some(next),
            None => break,
        }
    }
    sort_listing(&mut items);
    Ok(items)
}
