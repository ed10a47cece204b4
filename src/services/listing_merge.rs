//! Pure diff and merge of prefix listings, plus event dispatch to a
//! [`ListingConsumer`].

use std::collections::{HashMap, HashSet};

use crate::models::object::{ObjectPatch, StorageObject};

/// Receiver of granular listing changes, typically a table model.
pub trait ListingConsumer: Send {
    /// `position` is the item's index in the updated listing.
    fn on_insert(&mut self, item: &StorageObject, position: usize);
    fn on_remove(&mut self, key: &str);
    fn on_update(&mut self, key: &str, patch: &ObjectPatch);
    /// A page of a first load, in listing order.
    fn on_batch_append(&mut self, items: &[StorageObject]);
}

/// Changes turning one listing into another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingDiff {
    /// New items with their index in the updated listing, ascending.
    pub inserted: Vec<(usize, StorageObject)>,
    pub removed: Vec<String>,
    pub updated: Vec<(String, ObjectPatch)>,
}

impl ListingDiff {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    /// Deliver removals, then updates, then insertions in ascending position.
    pub fn dispatch(&self, consumer: &mut dyn ListingConsumer) {
        for key in &self.removed {
            consumer.on_remove(key);
        }
        for (key, patch) in &self.updated {
            consumer.on_update(key, patch);
        }
        for (position, item) in &self.inserted {
            consumer.on_insert(item, *position);
        }
    }
}

/// Sort items into listing order.
pub fn sort_listing(items: &mut [StorageObject]) {
    items.sort_by(|a, b| a.listing_order(b));
}

/// Compute the events that turn `old` into `new`. Both must be sorted.
///
/// Entries whose sort position could move (name or kind changed) are
/// reported as a removal plus an insertion rather than an update.
pub fn diff_listings(old: &[StorageObject], new: &[StorageObject]) -> ListingDiff {
    let old_by_key: HashMap<&str, &StorageObject> =
        old.iter().map(|item| (item.key.as_str(), item)).collect();
    let new_keys: HashSet<&str> = new.iter().map(|item| item.key.as_str()).collect();

    let mut diff = ListingDiff::default();
    for item in old {
        if !new_keys.contains(item.key.as_str()) {
            diff.removed.push(item.key.clone());
        }
    }
    for (position, item) in new.iter().enumerate() {
        match old_by_key.get(item.key.as_str()) {
            None => diff.inserted.push((position, item.clone())),
            Some(previous) => {
                if let Some(patch) = previous.patch_to(item) {
                    if patch.name.is_some() || patch.kind.is_some() {
                        diff.removed.push(item.key.clone());
                        diff.inserted.push((position, item.clone()));
                    } else {
                        diff.updated.push((item.key.clone(), patch));
                    }
                }
            }
        }
    }
    diff
}

/// Merge a fetch that raced with local mutations.
///
/// `added` and `removed` are the keys mutated locally after the fetch
/// started. Fetched entries win everywhere else; locally added entries are
/// kept as they are now, and locally removed keys stay gone even when the
/// fetch still reports them.
pub fn merge_revalidated(
    current: &[StorageObject],
    fetched: &[StorageObject],
    added: &HashSet<String>,
    removed: &HashSet<String>,
) -> Vec<StorageObject> {
    let mut merged: Vec<StorageObject> = fetched
        .iter()
        .filter(|item| !removed.contains(&item.key) && !added.contains(&item.key))
        .cloned()
        .collect();
    merged.extend(
        current
            .iter()
            .filter(|item| added.contains(&item.key))
            .cloned(),
    );
    sort_listing(&mut merged);
    merged
}
