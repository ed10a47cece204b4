//! Resumable object-store transfers and a coherent listing cache.
//!
//! The [`TransferEngine`] schedules uploads and downloads against any
//! [`ObjectStore`], persisting progress through a [`TransferRepository`] so
//! work survives restarts. The [`ListingService`] serves prefix listings from
//! a [`ListingCache`] and keeps it in step with completed transfers and file
//! operations.

pub mod config;
pub mod constants;
pub mod errors;
pub mod models;
pub mod services;

pub use config::{CacheConfig, EngineConfig};
pub use errors::{ErrorClass, StoreError, TransferError, TransferResult};
pub use models::{
    object::{EntryKind, ObjectMeta, ObjectPatch, StorageObject},
    transfer::{Direction, NewTransfer, Transfer, TransferStatus},
};
pub use services::{
    engine::{RestoreReport, TransferEngine},
    file_ops::FileOperations,
    listing::ListingService,
    listing_cache::ListingCache,
    listing_merge::{ListingConsumer, ListingDiff},
    local_store::LocalObjectStore,
    object_store::ObjectStore,
    transfer_store::{SqliteTransferStore, TransferRepository},
    worker::TransferEvent,
};
