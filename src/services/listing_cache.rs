//! Bounded LRU cache of prefix listings.
//!
//! Each entry carries a mutation counter. Optimistic mutations bump it, and a
//! background revalidation compares the counter it started with against the
//! current one to decide between a plain diff and a merge. Counter values
//! come from one cache-wide sequence, so a prefix that is dropped and cached
//! again never hands out a value it used before. All read-modify-write
//! sequences on an entry run under one lock.

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Instant,
};
use tracing::debug;

use crate::{
    config::CacheConfig,
    models::object::StorageObject,
    services::listing_merge::{ListingDiff, diff_listings, merge_revalidated, sort_listing},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerKind {
    Added,
    Removed,
}

/// Last local mutation of a key and the counter value it produced.
#[derive(Debug, Clone, Copy)]
struct Marker {
    kind: MarkerKind,
    counter: u64,
}

#[derive(Debug)]
struct CachedListing {
    items: Vec<StorageObject>,
    fetched_at: Instant,
    dirty: bool,
    mutation_counter: u64,
    last_used: u64,
    markers: HashMap<String, Marker>,
}

/// Copy of a cached listing handed to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingSnapshot {
    pub items: Vec<StorageObject>,
    /// Counter value to pass back to `safe_revalidate`.
    pub counter: u64,
    pub stale: bool,
    pub dirty: bool,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CachedListing>,
    tick: u64,
    /// Highest mutation counter handed out to any entry.
    counter: u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

pub struct ListingCache {
    inner: Mutex<CacheInner>,
    config: CacheConfig,
}

impl Default for ListingCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl ListingCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, entry: &CachedListing, now: Instant) -> ListingSnapshot {
        ListingSnapshot {
            items: entry.items.clone(),
            counter: entry.mutation_counter,
            stale: now.duration_since(entry.fetched_at) >= self.config.stale_after,
            dirty: entry.dirty,
        }
    }

    /// Cached listing for `prefix`, marked most recently used. Never fetches.
    pub fn get(&self, prefix: &str) -> Option<ListingSnapshot> {
        let mut inner = self.lock();
        let tick = inner.next_tick();
        let entry = inner.entries.get_mut(prefix)?;
        entry.last_used = tick;
        Some(self.snapshot(entry, Instant::now()))
    }

    /// Install a fully fetched listing, evicting the least recently used
    /// entry when over capacity.
    pub fn put(&self, prefix: &str, mut items: Vec<StorageObject>) {
        sort_listing(&mut items);
        let mut inner = self.lock();
        let tick = inner.next_tick();
        let counter = inner.counter;
        inner.entries.insert(
            prefix.to_string(),
            CachedListing {
                items,
                fetched_at: Instant::now(),
                dirty: false,
                mutation_counter: counter,
                last_used: tick,
                markers: HashMap::new(),
            },
        );

        while inner.entries.len() > self.config.max_entries.max(1) {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    debug!(prefix = %key, "evicting cached listing");
                    inner.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn invalidate(&self, prefix: &str) {
        if self.lock().entries.remove(prefix).is_some() {
            debug!(prefix, "invalidated cached listing");
        }
    }

    pub fn invalidate_all(&self) {
        let mut inner = self.lock();
        debug!(entries = inner.entries.len(), "invalidating all cached listings");
        inner.entries.clear();
    }

    /// Whether the entry is old enough to warrant a background refresh.
    /// Absent entries are not stale, they are misses.
    pub fn is_stale(&self, prefix: &str) -> bool {
        self.lock()
            .entries
            .get(prefix)
            .is_some_and(|entry| entry.fetched_at.elapsed() >= self.config.stale_after)
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.lock().entries.contains_key(prefix)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached entry for `key` under `prefix`, without touching recency.
    pub fn find(&self, prefix: &str, key: &str) -> Option<StorageObject> {
        self.lock()
            .entries
            .get(prefix)?
            .items
            .iter()
            .find(|item| item.key == key)
            .cloned()
    }

    pub fn mutation_counter(&self, prefix: &str) -> Option<u64> {
        self.lock()
            .entries
            .get(prefix)
            .map(|entry| entry.mutation_counter)
    }

    /// Apply `mutate` to the cached items of `prefix`.
    ///
    /// The entry is re-sorted, marked dirty and its counter bumped; its
    /// freshness is left alone. Returns the resulting change set, or `None`
    /// when nothing is cached for `prefix`.
    pub fn apply_mutation<F>(&self, prefix: &str, mutate: F) -> Option<ListingDiff>
    where
        F: FnOnce(&mut Vec<StorageObject>),
    {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = inner.entries.get_mut(prefix)?;

        let before = entry.items.clone();
        mutate(&mut entry.items);
        sort_listing(&mut entry.items);

        inner.counter += 1;
        let counter = inner.counter;
        entry.mutation_counter = counter;
        entry.dirty = true;

        let diff = diff_listings(&before, &entry.items);
        for (_, item) in &diff.inserted {
            entry.markers.insert(
                item.key.clone(),
                Marker {
                    kind: MarkerKind::Added,
                    counter,
                },
            );
        }
        for (key, _) in &diff.updated {
            entry.markers.insert(
                key.clone(),
                Marker {
                    kind: MarkerKind::Added,
                    counter,
                },
            );
        }
        let now_present: HashSet<&str> = entry.items.iter().map(|i| i.key.as_str()).collect();
        for key in &diff.removed {
            if !now_present.contains(key.as_str()) {
                entry.markers.insert(
                    key.clone(),
                    Marker {
                        kind: MarkerKind::Removed,
                        counter,
                    },
                );
            }
        }
        debug!(prefix, counter, "applied optimistic mutation");
        Some(diff)
    }

    /// Fold a fetch that started at `counter_at_start` into the cache.
    ///
    /// With no mutation in between, the fetched listing replaces the cached
    /// one. Otherwise the two are merged so that local changes made during the
    /// fetch survive. Returns the change set for consumers; `None` when the
    /// entry had been evicted (the fetched listing is installed as is).
    pub fn safe_revalidate(
        &self,
        prefix: &str,
        mut fetched: Vec<StorageObject>,
        counter_at_start: u64,
    ) -> Option<ListingDiff> {
        sort_listing(&mut fetched);
        let mut inner = self.lock();
        let tick = inner.next_tick();
        let Some(entry) = inner.entries.get_mut(prefix) else {
            drop(inner);
            self.put(prefix, fetched);
            return None;
        };

        let merged = if entry.mutation_counter == counter_at_start {
            entry.markers.clear();
            fetched
        } else {
            entry.markers.retain(|_, marker| marker.counter > counter_at_start);
            let added: HashSet<String> = entry
                .markers
                .iter()
                .filter(|(_, marker)| marker.kind == MarkerKind::Added)
                .map(|(key, _)| key.clone())
                .collect();
            let removed: HashSet<String> = entry
                .markers
                .iter()
                .filter(|(_, marker)| marker.kind == MarkerKind::Removed)
                .map(|(key, _)| key.clone())
                .collect();
            debug!(
                prefix,
                counter_at_start,
                counter = entry.mutation_counter,
                kept = added.len(),
                "merging revalidation with concurrent mutations"
            );
            merge_revalidated(&entry.items, &fetched, &added, &removed)
        };

        let diff = diff_listings(&entry.items, &merged);
        entry.items = merged;
        entry.fetched_at = Instant::now();
        entry.dirty = !entry.markers.is_empty();
        entry.last_used = tick;
        Some(diff)
    }
}
