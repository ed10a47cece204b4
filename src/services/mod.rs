pub mod database;
pub mod download_worker;
pub mod engine;
pub mod file_ops;
pub mod listing;
pub mod listing_cache;
pub mod listing_merge;
pub mod local_store;
pub mod object_store;
pub mod progress;
pub mod retry;
pub mod transfer_store;
pub mod upload_worker;
pub mod worker;
