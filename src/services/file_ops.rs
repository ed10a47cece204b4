//! Remote file operations with optimistic listing updates.
//!
//! Each operation updates the cached listings first, then calls the store.
//! When the store call fails, the inverse change is applied so the listing
//! returns to what it showed before.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    errors::{TransferError, TransferResult},
    models::object::StorageObject,
    services::{
        listing::{ListingService, folder_key, with_key},
        object_store::{MetadataPolicy, ObjectStore},
    },
};

#[derive(Clone)]
pub struct FileOperations {
    store: Arc<dyn ObjectStore>,
    listing: ListingService,
}

impl FileOperations {
    pub fn new(store: Arc<dyn ObjectStore>, listing: ListingService) -> Self {
        Self { store, listing }
    }

    /// Delete `keys`, returning the ones the store actually removed.
    pub async fn delete_objects(&self, keys: &[String]) -> TransferResult<Vec<String>> {
        let previous: Vec<StorageObject> =
            keys.iter().filter_map(|key| self.listing.lookup(key)).collect();
        self.listing.notify_delete_complete(keys);

        match self.store.delete_objects(keys).await {
            Ok(deleted) => {
                info!(requested = keys.len(), deleted = deleted.len(), "deleted objects");
                Ok(deleted)
            }
            Err(err) => {
                warn!("delete failed, restoring listing: {}", err);
                self.listing.insert_items(previous);
                Err(err.into())
            }
        }
    }

    /// Rename by server-side copy (metadata preserved) followed by delete.
    pub async fn rename_object(&self, src_key: &str, dst_key: &str) -> TransferResult<()> {
        let previous = self.listing.lookup(src_key);
        let displaced = self.listing.lookup(dst_key);
        self.listing.notify_rename_complete(src_key, dst_key);

        if let Err(err) = self
            .store
            .copy_object(src_key, dst_key, MetadataPolicy::Preserve)
            .await
        {
            warn!(src_key, dst_key, "rename copy failed, restoring listing: {}", err);
            self.undo_insert(dst_key, displaced);
            self.listing.insert_items(previous.into_iter().collect());
            return Err(err.into());
        }

        if let Err(err) = self.store.delete_objects(&[src_key.to_string()]).await {
            // The copy exists, so only the source comes back.
            warn!(src_key, "rename delete failed, restoring source: {}", err);
            self.listing.insert_items(previous.into_iter().collect());
            return Err(err.into());
        }
        info!(src_key, dst_key, "renamed object");
        Ok(())
    }

    pub async fn copy_object(&self, src_key: &str, dst_key: &str) -> TransferResult<()> {
        let displaced = self.listing.lookup(dst_key);
        self.listing.notify_copy_complete(src_key, dst_key);

        if let Err(err) = self
            .store
            .copy_object(src_key, dst_key, MetadataPolicy::Preserve)
            .await
        {
            warn!(src_key, dst_key, "copy failed, restoring listing: {}", err);
            self.undo_insert(dst_key, displaced);
            return Err(err.into());
        }
        info!(src_key, dst_key, "copied object");
        Ok(())
    }

    /// Create an empty folder marker object.
    pub async fn create_folder(&self, key: &str) -> TransferResult<String> {
        let key = folder_key(key);
        let displaced = self.listing.lookup(&key);
        self.listing.notify_new_folder(&key);

        if let Err(err) = self.store.put_object(&key, Bytes::new()).await {
            warn!(key = %key, "folder creation failed, restoring listing: {}", err);
            self.undo_insert(&key, displaced);
            return Err(TransferError::from(err));
        }
        info!(key = %key, "created folder");
        Ok(key)
    }

    /// Revert an optimistic insert at `key`, bringing back what it replaced.
    fn undo_insert(&self, key: &str, displaced: Option<StorageObject>) {
        match displaced {
            Some(item) => self.listing.insert_items(vec![with_key(item, key)]),
            None => self.listing.remove_keys(&[key.to_string()]),
        }
    }
}
