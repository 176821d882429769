//! The local cache.
//!
//! Holds the last known value of every document the engine has read,
//! written, or received through a subscription. Reads are served from here
//! first, which is what makes the engine usable offline.

use crate::{path, CacheKey, DocPath, Timestamp, Version};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One cached document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Cache key (usually the document path, or a subscription key)
    pub key: CacheKey,
    /// Document path the value belongs to
    pub path: DocPath,
    /// Last known value
    pub data: Value,
    /// When the entry last changed
    pub last_modified: Timestamp,
    /// Incremented on every change to the entry
    pub version: Version,
    /// Set when a refresh from the remote store failed
    pub stale: bool,
}

/// Cached documents keyed by cache key.
///
/// Uses BTreeMap for deterministic serialization order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cache {
    entries: BTreeMap<CacheKey, CacheEntry>,
}

impl Cache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an entry.
    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store a value, replacing the previous one. Returns the new version.
    pub fn put(&mut self, key: &str, path: &str, data: Value, now: Timestamp) -> Version {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry {
                key: key.to_string(),
                path: path.to_string(),
                data: Value::Null,
                last_modified: now,
                version: 0,
                stale: false,
            });
        entry.path = path.to_string();
        entry.data = data;
        entry.last_modified = now;
        entry.version += 1;
        entry.stale = false;
        entry.version
    }

    /// Shallow-merge `fields` into the cached object. Returns the new version.
    ///
    /// A missing or non-object entry is replaced by `fields`.
    pub fn merge_fields(
        &mut self,
        key: &str,
        path: &str,
        fields: &Map<String, Value>,
        now: Timestamp,
    ) -> Version {
        let mut merged = match self.entries.get(key).map(|e| &e.data) {
            Some(Value::Object(existing)) => existing.clone(),
            _ => Map::new(),
        };
        for (field, value) in fields {
            merged.insert(field.clone(), value.clone());
        }
        self.put(key, path, Value::Object(merged), now)
    }

    /// Remove an entry.
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    /// Flag an entry whose refresh failed.
    pub fn mark_stale(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.stale = true;
        }
    }

    /// Entries for documents directly inside `collection`, in key order.
    pub fn children<'a>(&'a self, collection: &'a str) -> impl Iterator<Item = &'a CacheEntry> {
        self.entries
            .values()
            .filter(move |e| e.key == e.path && path::is_child_of(&e.path, collection))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
