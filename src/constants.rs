//! Fixed sizes, limits and timings shared by the transfer engine and the
//! listing cache.

use std::time::Duration;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Files at or above this size go through a multipart session (uploads) or
/// ranged retrieval (downloads).
pub const MULTIPART_THRESHOLD: u64 = 8 * MIB;

pub const SMALL_PART_SIZE: u64 = 8 * MIB;
pub const LARGE_PART_SIZE: u64 = 64 * MIB;
pub const HUGE_PART_SIZE: u64 = 512 * MIB;

/// Upper bound of the small part-size tier.
pub const SMALL_TIER_LIMIT: u64 = 50 * GIB;
/// Upper bound of the large part-size tier.
pub const LARGE_TIER_LIMIT: u64 = 500 * GIB;

/// Parts-per-object limit imposed by the store.
pub const MAX_PARTS: u64 = 10_000;

/// Byte length of one ranged retrieval.
pub const DOWNLOAD_CHUNK_SIZE: u64 = 8 * MIB;

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Sessions unknown to the transfer store are only aborted once older than this.
pub const ORPHAN_GRACE: Duration = Duration::from_secs(24 * 60 * 60);

/// Completed and cancelled records are kept this long before pruning.
pub const FINISHED_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub const SPEED_WINDOW: Duration = Duration::from_secs(3);
pub const SPEED_EMIT_INTERVAL: Duration = Duration::from_millis(500);

pub const LISTING_CACHE_MAX_ENTRIES: usize = 30;
pub const LISTING_CACHE_STALE_AFTER: Duration = Duration::from_secs(30);

/// Delimiter used to emulate folders in the flat key space.
pub const DELIMITER: &str = "/";

/// Default storage tier reported for freshly written objects.
pub const DEFAULT_STORAGE_CLASS: &str = "STANDARD";
