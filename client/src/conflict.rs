//! Conflict detection and resolution.
//!
//! Every local write leaves a [`PendingChange`] marker on its document until
//! the remote store has acknowledged it. When an authoritative snapshot
//! arrives for a document with a pending change, each written field whose
//! server value is neither the latest local value nor one the document held
//! earlier on this client produces one [`ConflictRecord`]. Records stay
//! pending until the application picks an action with
//! [`SyncEngine::resolve_conflict`], or until the local change they concern
//! is gone.

use crate::{
    error::Result,
    remote::{is_server_timestamp, UPDATED_AT_FIELD, UPDATED_BY_FIELD},
    state::{Action, Outcome},
    ActorId, ConflictId, DocPath, Error, OperationKind, SyncEngine, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// How a conflict was (or is to be) settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    /// Keep the local value and write it again
    AcceptLocal,
    /// Drop the local value in favor of the server's
    AcceptServer,
    /// Write the server document overlaid with every local field
    Merge,
    /// Not resolved yet
    Pending,
}

/// One field on which a local write and the server disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: ConflictId,
    /// Document path
    pub key: DocPath,
    pub field: String,
    pub local_value: Value,
    pub server_value: Value,
    pub local_timestamp: Timestamp,
    pub server_timestamp: Timestamp,
    /// Identity that made the local write
    pub actor_id: ActorId,
    pub action: ConflictAction,
    /// Full server document when the conflict was last observed
    #[serde(default)]
    pub server_document: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<Timestamp>,
}

impl ConflictRecord {
    /// Whether the record still awaits a decision.
    pub fn is_pending(&self) -> bool {
        self.action == ConflictAction::Pending
    }
}

/// Local fields written to a document and not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub path: DocPath,
    pub kind: OperationKind,
    /// Every field written locally since the last acknowledgement
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<ActorId>,
    pub updated_at: Timestamp,
    /// Earlier values of each written field: the value before the first
    /// local write, and every local value overwritten since. A server still
    /// holding one of them has not seen the latest write yet.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub prior: BTreeMap<String, Vec<Value>>,
}

impl PendingChange {
    /// Whether `server` for `field` is explained by this client's own history.
    /// Until a queued create lands, any field may still be missing.
    fn expects(&self, field: &str, server: &Value) -> bool {
        self.fields.get(field) == Some(server)
            || (self.kind == OperationKind::Create && server.is_null())
            || self.prior.get(field).is_some_and(|values| values.contains(server))
    }
}

fn field_of(document: Option<&Value>, field: &str) -> Value {
    document
        .and_then(|d| d.get(field))
        .cloned()
        .unwrap_or(Value::Null)
}

fn is_metadata(field: &str) -> bool {
    field == UPDATED_AT_FIELD || field == UPDATED_BY_FIELD
}

/// A write the engine must enqueue to carry out a resolution.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolutionWrite {
    pub path: DocPath,
    pub fields: Map<String, Value>,
    pub actor_id: ActorId,
}

/// Result of resolving a record.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Resolution {
    pub record: ConflictRecord,
    pub write: Option<ResolutionWrite>,
}

/// Pending-change markers and conflict records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictLedger {
    pending: BTreeMap<DocPath, PendingChange>,
    records: Vec<ConflictRecord>,
}

impl ConflictLedger {
    pub(crate) fn from_parts(
        pending: BTreeMap<DocPath, PendingChange>,
        records: Vec<ConflictRecord>,
    ) -> Self {
        Self { pending, records }
    }

    /// Pending changes by document path.
    pub fn pending_changes(&self) -> &BTreeMap<DocPath, PendingChange> {
        &self.pending
    }

    /// The pending change on `path`, if any.
    pub fn pending_change(&self, path: &str) -> Option<&PendingChange> {
        self.pending.get(path)
    }

    /// Every conflict record, resolved ones included, in detection order.
    pub fn records(&self) -> &[ConflictRecord] {
        &self.records
    }

    /// Number of unresolved records.
    pub fn pending_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_pending()).count()
    }

    /// Whether any unresolved record targets `path`.
    pub fn has_pending_conflict(&self, path: &str) -> bool {
        self.records.iter().any(|r| r.key == path && r.is_pending())
    }

    /// Record a local write on `path`. `before` is the document as this
    /// client saw it just before the write.
    pub(crate) fn record_write(
        &mut self,
        kind: OperationKind,
        path: &str,
        fields: Option<&Map<String, Value>>,
        before: Option<&Value>,
        actor_id: Option<ActorId>,
        now: Timestamp,
    ) {
        let fields = fields.cloned().unwrap_or_default();
        match (kind, self.pending.get_mut(path)) {
            (OperationKind::Update, Some(existing)) if existing.kind != OperationKind::Delete => {
                for (field, value) in fields {
                    let earlier = existing
                        .fields
                        .get(&field)
                        .cloned()
                        .unwrap_or_else(|| field_of(before, &field));
                    if earlier != value {
                        let history = existing.prior.entry(field.clone()).or_default();
                        if !history.contains(&earlier) {
                            history.push(earlier);
                        }
                    }
                    existing.fields.insert(field, value);
                }
                existing.actor_id = actor_id.or(existing.actor_id.take());
                existing.updated_at = now;
            }
            _ => {
                let prior = fields
                    .keys()
                    .map(|field| (field.clone(), vec![field_of(before, field)]))
                    .collect();
                self.pending.insert(
                    path.to_string(),
                    PendingChange {
                        path: path.to_string(),
                        kind,
                        fields,
                        actor_id,
                        updated_at: now,
                        prior,
                    },
                );
            }
        }
    }

    /// Drop the pending change on `path`, and with it every unresolved
    /// record on the document.
    pub(crate) fn clear_pending(&mut self, path: &str) -> Option<PendingChange> {
        let before = self.records.len();
        self.records.retain(|r| !(r.key == path && r.is_pending()));
        let dropped = before - self.records.len();
        if dropped > 0 {
            tracing::debug!(path = %path, dropped, "local change settled; open conflicts dropped");
        }
        self.pending.remove(path)
    }

    /// Keep at most `keep` resolved records, dropping the oldest first.
    /// Returns how many were dropped.
    pub(crate) fn prune_resolved(&mut self, keep: usize) -> usize {
        let resolved = self.records.iter().filter(|r| !r.is_pending()).count();
        let mut excess = resolved.saturating_sub(keep);
        let before = self.records.len();
        self.records.retain(|r| {
            if excess > 0 && !r.is_pending() {
                excess -= 1;
                false
            } else {
                true
            }
        });
        before - self.records.len()
    }

    /// Compare an authoritative server document against the pending change
    /// on `path`. Returns the ids of newly created records.
    ///
    /// A field that already has a pending record is refreshed in place.
    pub(crate) fn detect(&mut self, path: &str, server: &Value, now: Timestamp) -> Vec<ConflictId> {
        let Some(pending) = self.pending.get(path) else {
            return Vec::new();
        };

        let diverged: Vec<(String, Value, Value)> = pending
            .fields
            .iter()
            .filter(|(field, local)| !is_metadata(field) && !is_server_timestamp(local))
            .filter_map(|(field, local)| {
                let server_value = field_of(Some(server), field);
                (!pending.expects(field, &server_value))
                    .then(|| (field.clone(), local.clone(), server_value))
            })
            .collect();
        if diverged.is_empty() {
            return Vec::new();
        }

        let Some(actor_id) = pending.actor_id.clone() else {
            tracing::warn!(
                path = %path,
                fields = diverged.len(),
                "server diverged from a local write with no acting identity; conflict not recorded"
            );
            return Vec::new();
        };
        let local_timestamp = pending.updated_at;
        let server_timestamp = server
            .get(UPDATED_AT_FIELD)
            .and_then(Value::as_u64)
            .unwrap_or(now);

        let mut created = Vec::new();
        for (field, local_value, server_value) in diverged {
            if let Some(existing) = self
                .records
                .iter_mut()
                .find(|r| r.key == path && r.field == field && r.is_pending())
            {
                existing.local_value = local_value;
                existing.server_value = server_value;
                existing.server_timestamp = server_timestamp;
                existing.server_document = server.clone();
                continue;
            }

            let record = ConflictRecord {
                id: uuid::Uuid::new_v4().to_string(),
                key: path.to_string(),
                field,
                local_value,
                server_value,
                local_timestamp,
                server_timestamp,
                actor_id: actor_id.clone(),
                action: ConflictAction::Pending,
                server_document: server.clone(),
                resolved_at: None,
            };
            created.push(record.id.clone());
            self.records.push(record);
        }
        created
    }

    /// Settle a record.
    pub(crate) fn resolve(
        &mut self,
        id: &str,
        action: ConflictAction,
        now: Timestamp,
    ) -> Result<Resolution> {
        if action == ConflictAction::Pending {
            return Err(Error::InvalidResolution);
        }
        let index = self
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| Error::ConflictNotFound(id.to_string()))?;
        if !self.records[index].is_pending() {
            return Err(Error::ConflictAlreadyResolved(id.to_string()));
        }

        self.records[index].action = action;
        self.records[index].resolved_at = Some(now);
        let record = self.records[index].clone();

        // A later local delete stands; neither side's fields are written back
        let deleted = self
            .pending
            .get(&record.key)
            .is_some_and(|p| p.kind == OperationKind::Delete);

        let write = match action {
            ConflictAction::AcceptLocal if deleted => None,
            ConflictAction::AcceptLocal => Some(ResolutionWrite {
                path: record.key.clone(),
                fields: std::iter::once((record.field.clone(), record.local_value.clone()))
                    .collect(),
                actor_id: record.actor_id.clone(),
            }),
            ConflictAction::AcceptServer => {
                if let Some(pending) = self.pending.get_mut(&record.key) {
                    pending.fields.remove(&record.field);
                }
                None
            }
            ConflictAction::Merge => {
                let mut merged = record.server_document.as_object().cloned().unwrap_or_default();
                if let Some(pending) = self.pending.get(&record.key) {
                    merged.extend(pending.fields.clone());
                }
                merged
                    .entry(record.field.clone())
                    .or_insert_with(|| record.local_value.clone());
                merged.retain(|field, _| !is_metadata(field));

                for sibling in self
                    .records
                    .iter_mut()
                    .filter(|r| r.key == record.key && r.is_pending())
                {
                    sibling.action = ConflictAction::Merge;
                    sibling.resolved_at = Some(now);
                }
                (!deleted).then(|| ResolutionWrite {
                    path: record.key.clone(),
                    fields: merged,
                    actor_id: record.actor_id.clone(),
                })
            }
            ConflictAction::Pending => None,
        };

        Ok(Resolution { record, write })
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.records.clear();
    }
}

impl SyncEngine {
    /// Every conflict record, resolved ones included.
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.with_state(|s| s.conflicts().records().to_vec())
    }

    /// Unresolved conflict records.
    pub fn pending_conflicts(&self) -> Vec<ConflictRecord> {
        self.with_state(|s| {
            s.conflicts()
                .records()
                .iter()
                .filter(|r| r.is_pending())
                .cloned()
                .collect()
        })
    }

    /// Whether any conflict awaits a decision.
    pub fn has_conflicts(&self) -> bool {
        self.with_state(|s| s.conflicts().pending_count() > 0)
    }

    /// Fails with [`Error::Conflict`] while `path` has an unresolved conflict.
    pub fn ensure_no_conflict(&self, path: &str) -> Result<()> {
        if self.with_state(|s| s.conflicts().has_pending_conflict(path)) {
            return Err(Error::Conflict(path.to_string()));
        }
        Ok(())
    }

    /// Settle a conflict.
    ///
    /// `AcceptLocal` and `Merge` enqueue a write; `AcceptServer` gives up the
    /// local value of the field in every queued write on the document. When
    /// the latest local write on the document is a delete, no write is
    /// enqueued and the delete replays as issued. Queued writes for the
    /// document are held back until none of its conflicts is pending.
    pub fn resolve_conflict(&self, id: &str, action: ConflictAction) -> Result<ConflictRecord> {
        let resolution = match self.dispatch(Action::ConflictResolved {
            id: id.to_string(),
            action,
        }) {
            Outcome::Resolved(resolution) => resolution,
            Outcome::Rejected(err) => return Err(err),
            _ => return Err(Error::ConflictNotFound(id.to_string())),
        };

        let record = resolution.record;
        tracing::info!(
            conflict_id = %record.id,
            path = %record.key,
            field = %record.field,
            action = ?action,
            "conflict resolved"
        );

        if let Some(write) = resolution.write {
            self.enqueue_write(
                OperationKind::Update,
                write.path,
                Some(Value::Object(write.fields)),
                Some(write.actor_id),
            );
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn ledger_with_pending(actor: Option<&str>) -> ConflictLedger {
        let mut ledger = ConflictLedger::default();
        ledger.record_write(
            OperationKind::Update,
            "menu/9",
            Some(&fields(json!({"price": 12}))),
            Some(&json!({"name": "Soup", "price": 10})),
            actor.map(String::from),
            100,
        );
        ledger
    }

    #[test]
    fn updates_accumulate_fields() {
        let mut ledger = ledger_with_pending(Some("manager-1"));
        ledger.record_write(
            OperationKind::Update,
            "menu/9",
            Some(&fields(json!({"name": "Stew"}))),
            None,
            None,
            200,
        );

        let pending = ledger.pending_change("menu/9").unwrap();
        assert_eq!(pending.fields, fields(json!({"price": 12, "name": "Stew"})));
        assert_eq!(pending.actor_id.as_deref(), Some("manager-1"));
        assert_eq!(pending.updated_at, 200);

        ledger.record_write(OperationKind::Delete, "menu/9", None, None, None, 300);
        let pending = ledger.pending_change("menu/9").unwrap();
        assert_eq!(pending.kind, OperationKind::Delete);
        assert!(pending.fields.is_empty());
    }

    #[test]
    fn detects_one_record_per_field() {
        let mut ledger = ledger_with_pending(Some("manager-1"));
        ledger.record_write(
            OperationKind::Update,
            "menu/9",
            Some(&fields(json!({"name": "Stew"}))),
            None,
            None,
            110,
        );

        let server = json!({"name": "Soup", "price": 15, "updatedAt": 500});
        let ids = ledger.detect("menu/9", &server, 900);
        assert_eq!(ids.len(), 2);

        let price = ledger.records().iter().find(|r| r.field == "price").unwrap();
        assert_eq!(price.local_value, json!(12));
        assert_eq!(price.server_value, json!(15));
        assert_eq!(price.server_timestamp, 500);
        assert_eq!(price.local_timestamp, 110);
        assert_eq!(price.actor_id, "manager-1");
        assert!(ledger.has_pending_conflict("menu/9"));
    }

    #[test]
    fn repeated_snapshot_refreshes_existing_record() {
        let mut ledger = ledger_with_pending(Some("manager-1"));
        assert_eq!(ledger.detect("menu/9", &json!({"price": 15}), 1).len(), 1);
        assert!(ledger.detect("menu/9", &json!({"price": 16}), 2).is_empty());

        assert_eq!(ledger.records().len(), 1);
        assert_eq!(ledger.records()[0].server_value, json!(16));
    }

    #[test]
    fn matching_server_value_is_not_a_conflict() {
        let mut ledger = ledger_with_pending(Some("manager-1"));
        assert!(ledger
            .detect("menu/9", &json!({"price": 12, "name": "Soup"}), 1)
            .is_empty());
        assert!(ledger.detect("menu/10", &json!({"price": 1}), 1).is_empty());
    }

    #[test]
    fn own_earlier_values_are_not_divergence() {
        let mut ledger = ledger_with_pending(Some("manager-1"));
        ledger.record_write(
            OperationKind::Update,
            "menu/9",
            Some(&fields(json!({"price": 13}))),
            None,
            None,
            110,
        );
        assert_eq!(ledger.pending_change("menu/9").unwrap().prior["price"], vec![json!(10), json!(12)]);

        // first write landed, second still in flight
        assert!(ledger.detect("menu/9", &json!({"price": 12}), 1).is_empty());
        // nothing landed yet
        assert!(ledger.detect("menu/9", &json!({"price": 10}), 2).is_empty());
        assert!(ledger.records().is_empty());

        assert_eq!(ledger.detect("menu/9", &json!({"price": 15}), 3).len(), 1);
    }

    #[test]
    fn metadata_fields_never_conflict() {
        let mut ledger = ConflictLedger::default();
        ledger.record_write(
            OperationKind::Update,
            "menu/9",
            Some(&fields(json!({"price": 12, "updatedAt": 1, "updatedBy": "manager-1"}))),
            None,
            Some("manager-1".into()),
            100,
        );
        let server = json!({"price": 12, "updatedAt": 900, "updatedBy": "manager-2"});
        assert!(ledger.detect("menu/9", &server, 1).is_empty());
    }

    #[test]
    fn clearing_pending_drops_open_records() {
        let mut ledger = ledger_with_pending(Some("manager-1"));
        ledger.detect("menu/9", &json!({"price": 15}), 1);
        assert!(ledger.has_pending_conflict("menu/9"));

        ledger.clear_pending("menu/9");
        assert!(ledger.records().is_empty());
        assert_eq!(ledger.pending_count(), 0);
    }

    #[test]
    fn prune_keeps_newest_resolved() {
        let mut ledger = ConflictLedger::default();
        for (i, path) in ["menu/1", "menu/2", "menu/3"].iter().enumerate() {
            ledger.record_write(
                OperationKind::Update,
                path,
                Some(&fields(json!({"price": 12}))),
                None,
                Some("manager-1".into()),
                i as Timestamp,
            );
            ledger.detect(path, &json!({"price": 15}), 10);
        }
        let ids: Vec<_> = ledger.records().iter().map(|r| r.id.clone()).collect();
        ledger.resolve(&ids[0], ConflictAction::AcceptServer, 20).unwrap();
        ledger.resolve(&ids[1], ConflictAction::AcceptServer, 21).unwrap();

        assert_eq!(ledger.prune_resolved(1), 1);
        let left: Vec<_> = ledger.records().iter().map(|r| r.id.clone()).collect();
        assert_eq!(left, vec![ids[1].clone(), ids[2].clone()]);
        assert_eq!(ledger.prune_resolved(1), 0);
    }

    #[test]
    fn later_delete_suppresses_resolution_writes() {
        let mut ledger = ledger_with_pending(Some("manager-1"));
        ledger.record_write(
            OperationKind::Update,
            "menu/9",
            Some(&fields(json!({"name": "Stew"}))),
            None,
            None,
            110,
        );
        ledger.detect("menu/9", &json!({"name": "Broth", "price": 15}), 1);
        ledger.record_write(OperationKind::Delete, "menu/9", None, None, None, 120);

        let ids: Vec<_> = ledger.records().iter().map(|r| r.id.clone()).collect();
        let local = ledger.resolve(&ids[0], ConflictAction::AcceptLocal, 2).unwrap();
        assert!(local.write.is_none());
        let merged = ledger.resolve(&ids[1], ConflictAction::Merge, 3).unwrap();
        assert!(merged.write.is_none());
        assert!(!ledger.has_pending_conflict("menu/9"));
    }

    #[test]
    fn unknown_actor_records_nothing() {
        let mut ledger = ledger_with_pending(None);
        assert!(ledger.detect("menu/9", &json!({"price": 15}), 1).is_empty());
        assert!(ledger.records().is_empty());
    }

    #[test]
    fn merge_overlays_local_fields_and_settles_siblings() {
        let mut ledger = ledger_with_pending(Some("manager-1"));
        ledger.record_write(
            OperationKind::Update,
            "menu/9",
            Some(&fields(json!({"name": "Stew"}))),
            None,
            None,
            110,
        );
        let server = json!({"name": "Soup", "price": 15, "vegan": true});
        ledger.detect("menu/9", &server, 1);
        let id = ledger.records()[0].id.clone();

        let resolution = ledger.resolve(&id, ConflictAction::Merge, 5).unwrap();
        let write = resolution.write.unwrap();
        assert_eq!(
            write.fields,
            fields(json!({"name": "Stew", "price": 12, "vegan": true}))
        );
        assert!(ledger.records().iter().all(|r| r.action == ConflictAction::Merge));
        assert!(!ledger.has_pending_conflict("menu/9"));
    }

    #[test]
    fn accept_server_strips_pending_field() {
        let mut ledger = ledger_with_pending(Some("manager-1"));
        ledger.detect("menu/9", &json!({"price": 15}), 1);
        let id = ledger.records()[0].id.clone();

        let resolution = ledger.resolve(&id, ConflictAction::AcceptServer, 5).unwrap();
        assert!(resolution.write.is_none());
        assert_eq!(resolution.record.resolved_at, Some(5));
        assert!(ledger.pending_change("menu/9").unwrap().fields.is_empty());
    }

    #[test]
    fn resolve_errors() {
        let mut ledger = ledger_with_pending(Some("manager-1"));
        ledger.detect("menu/9", &json!({"price": 15}), 1);
        let id = ledger.records()[0].id.clone();

        assert_eq!(
            ledger.resolve(&id, ConflictAction::Pending, 2),
            Err(Error::InvalidResolution)
        );
        assert!(matches!(
            ledger.resolve("missing", ConflictAction::Merge, 2),
            Err(Error::ConflictNotFound(_))
        ));

        let accepted = ledger.resolve(&id, ConflictAction::AcceptLocal, 3).unwrap();
        assert_eq!(
            accepted.write.unwrap().fields,
            fields(json!({"price": 12}))
        );
        assert!(matches!(
            ledger.resolve(&id, ConflictAction::Merge, 4),
            Err(Error::ConflictAlreadyResolved(_))
        ));
    }
}
