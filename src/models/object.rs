//! Remote listing entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::constants::DELIMITER;

/// Metadata that only real objects carry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Size in bytes.
    pub size: u64,

    pub last_modified: DateTime<Utc>,

    /// Storage tier (e.g. STANDARD, GLACIER).
    pub storage_class: Option<String>,

    /// Integrity tag reported by the store.
    pub etag: Option<String>,
}

/// Prefixes and objects have disjoint field sets.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryKind {
    Container,
    Object(ObjectMeta),
}

/// One entry of a prefix listing.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StorageObject {
    /// Display name relative to the listed prefix.
    pub name: String,

    /// Full key. Containers end with the delimiter.
    pub key: String,

    pub kind: EntryKind,
}

impl StorageObject {
    pub fn container(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            name: display_name(&key),
            key,
            kind: EntryKind::Container,
        }
    }

    pub fn object(key: impl Into<String>, meta: ObjectMeta) -> Self {
        let key = key.into();
        Self {
            name: display_name(&key),
            key,
            kind: EntryKind::Object(meta),
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self.kind, EntryKind::Container)
    }

    pub fn meta(&self) -> Option<&ObjectMeta> {
        match &self.kind {
            EntryKind::Object(meta) => Some(meta),
            EntryKind::Container => None,
        }
    }

    pub fn size(&self) -> Option<u64> {
        self.meta().map(|m| m.size)
    }

    /// Listing order: containers first, then case-insensitive name, then key.
    pub fn listing_order(&self, other: &Self) -> Ordering {
        other
            .is_container()
            .cmp(&self.is_container())
            .then_with(|| self.name.to_lowercase().cmp(&other.name.to_lowercase()))
            .then_with(|| self.key.cmp(&other.key))
    }

    /// Fields that differ between `self` and `newer`, if any.
    pub fn patch_to(&self, newer: &StorageObject) -> Option<ObjectPatch> {
        let mut patch = ObjectPatch::default();
        if self.name != newer.name {
            patch.name = Some(newer.name.clone());
        }
        match (&self.kind, &newer.kind) {
            (EntryKind::Object(old), EntryKind::Object(new)) => {
                if old.size != new.size {
                    patch.size = Some(new.size);
                }
                if old.last_modified != new.last_modified {
                    patch.last_modified = Some(new.last_modified);
                }
                if old.storage_class != new.storage_class {
                    patch.storage_class = new.storage_class.clone();
                }
                if old.etag != new.etag {
                    patch.etag = new.etag.clone();
                }
            }
            (EntryKind::Container, EntryKind::Container) => {}
            _ => patch.kind = Some(newer.kind.clone()),
        }
        (!patch.is_empty()).then_some(patch)
    }
}

/// Sparse field update delivered to listing consumers.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectPatch {
    pub name: Option<String>,
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub storage_class: Option<String>,
    pub etag: Option<String>,
    /// Set when an entry flips between container and object.
    pub kind: Option<EntryKind>,
}

impl ObjectPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.size.is_none()
            && self.last_modified.is_none()
            && self.storage_class.is_none()
            && self.etag.is_none()
            && self.kind.is_none()
    }
}

/// Last path segment of a key, without the trailing delimiter.
pub fn display_name(key: &str) -> String {
    let trimmed = key.strip_suffix(DELIMITER).unwrap_or(key);
    trimmed
        .rsplit(DELIMITER)
        .next()
        .unwrap_or(trimmed)
        .to_string()
}

/// Prefix under which `key` is listed ("" for top-level keys).
pub fn parent_prefix(key: &str) -> String {
    let trimmed = key.strip_suffix(DELIMITER).unwrap_or(key);
    match trimmed.rfind(DELIMITER) {
        Some(pos) => trimmed[..pos + DELIMITER.len()].to_string(),
        None => String::new(),
    }
}
