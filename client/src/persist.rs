//! The persisted state blob.
//!
//! Queue, cache, pending-change markers and conflict records are saved
//! together as one JSON document, so a restart restores a consistent view of
//! all four. Maps are BTreeMaps for deterministic output.

use crate::{
    cache::Cache,
    conflict::{ConflictRecord, PendingChange},
    error::Result,
    queue::OfflineQueue,
    DocPath, Error, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the persisted format.
pub const PERSIST_FORMAT_VERSION: u32 = 1;

/// Everything the engine restores after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub format_version: u32,
    /// When the blob was written
    pub saved_at: Timestamp,
    pub queue: OfflineQueue,
    pub cache: Cache,
    #[serde(default)]
    pub pending_changes: BTreeMap<DocPath, PendingChange>,
    #[serde(default)]
    pub conflicts: Vec<ConflictRecord>,
}

impl PersistedState {
    /// Create an empty blob.
    pub fn new(saved_at: Timestamp) -> Self {
        Self {
            format_version: PERSIST_FORMAT_VERSION,
            saved_at,
            ..Self::default()
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON, rejecting formats newer than this build.
    pub fn from_json(json: &str) -> Result<Self> {
        let state: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if state.format_version > PERSIST_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported state format version: {} (max supported: {})",
                state.format_version, PERSIST_FORMAT_VERSION
            )));
        }

        Ok(state)
    }

    /// Deserialize from raw storage bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let json = std::str::from_utf8(bytes).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        Self::from_json(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OfflineOperation, OperationKind};
    use serde_json::json;

    #[test]
    fn empty_state_roundtrip() {
        let state = PersistedState::new(42);
        let json = state.to_json().unwrap();
        assert!(json.contains("\"formatVersion\":1"));
        assert_eq!(PersistedState::from_json(&json).unwrap(), state);
    }

    #[test]
    fn queue_and_cache_survive() {
        let mut state = PersistedState::new(1);
        state.queue.enqueue(OfflineOperation::new(
            OperationKind::Update,
            "inv/5",
            Some(json!({"stock": 4})),
            Some("cashier-1".into()),
            1,
            5,
        ));
        state.cache.put("inv/5", "inv/5", json!({"stock": 4}), 1);

        let restored = PersistedState::from_slice(state.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(restored.queue.len(), 1);
        assert_eq!(restored.cache.get("inv/5").unwrap().version, 1);
        assert_eq!(restored, state);
    }

    #[test]
    fn rejects_newer_format() {
        let json = r#"{"formatVersion":99,"savedAt":0,"queue":{"pending":[],"failed":[]},"cache":{"entries":{}}}"#;
        let err = PersistedState::from_json(json).unwrap_err();
        assert!(matches!(err, Error::InvalidSnapshot(_)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(PersistedState::from_slice(b"not json").is_err());
        assert!(PersistedState::from_slice(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn older_blob_without_conflicts_loads() {
        let json = r#"{"formatVersion":1,"savedAt":0,"queue":{"pending":[],"failed":[]},"cache":{"entries":{}}}"#;
        let state = PersistedState::from_json(json).unwrap();
        assert!(state.conflicts.is_empty());
        assert!(state.pending_changes.is_empty());
    }
}
