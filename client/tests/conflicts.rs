//! Conflict detection on reconnect and the three resolutions.

mod common;

use async_trait::async_trait;
use carry_client::{
    ConflictAction, ConflictRecord, Document, Error, Filter, MemoryRemoteStore, RemoteStore,
    Result, SnapshotStream, SubscriptionHandle,
};
use common::{manual_config, wait_until, Harness};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

/// Yields to other tasks before every update, so the snapshot of one write
/// can reach the engine while the next write is in flight.
struct YieldingStore(Arc<MemoryRemoteStore>);

#[async_trait]
impl RemoteStore for YieldingStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        self.0.get(path).await
    }

    async fn list(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Document>> {
        self.0.list(collection, filters).await
    }

    async fn subscribe(&self, path: &str) -> Result<SnapshotStream> {
        self.0.subscribe(path).await
    }

    async fn create(&self, path: &str, data: Value) -> Result<()> {
        self.0.create(path, data).await
    }

    async fn update(&self, path: &str, data: Value) -> Result<()> {
        tokio::task::yield_now().await;
        self.0.update(path, data).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.0.delete(path).await
    }
}

/// Subscribe to the menu item, recording every value handed over.
async fn watch(h: &Harness) -> (SubscriptionHandle, Arc<Mutex<Vec<Value>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handle = h
        .engine
        .subscribe("menu/9", "menu/9", move |value| sink.lock().push(value.clone()))
        .await
        .unwrap();
    assert!(h.engine.is_subscription_attached("menu/9"));
    (handle, seen)
}

async fn go_offline(h: &Harness) {
    h.engine.set_online(false).await;
    h.remote.set_reachable(false);
    wait_until(|| !h.engine.is_subscription_attached("menu/9")).await;
}

async fn come_back(h: &Harness) {
    h.remote.set_reachable(true);
    h.engine.set_online(true).await;
}

/// Subscribe to a menu item, go offline, change it locally while another
/// client changes the price on the server, then reconnect.
async fn diverge(
    h: &Harness,
    local: Value,
    actor: Option<&str>,
) -> (SubscriptionHandle, Arc<Mutex<Vec<Value>>>) {
    diverge_to(h, local, json!({"name": "Soup", "price": 15}), actor).await
}

/// Like [`diverge`], with the server ending up at `server`.
async fn diverge_to(
    h: &Harness,
    local: Value,
    server: Value,
    actor: Option<&str>,
) -> (SubscriptionHandle, Arc<Mutex<Vec<Value>>>) {
    h.remote
        .put_external("menu/9", json!({"name": "Soup", "price": 10}));
    let watched = watch(h).await;

    go_offline(h).await;
    h.engine.update("menu/9", local, actor).unwrap();
    h.remote.put_external("menu/9", server);
    come_back(h).await;
    watched
}

fn only_conflict(h: &Harness) -> ConflictRecord {
    let pending = h.engine.pending_conflicts();
    assert_eq!(pending.len(), 1, "expected one conflict, got {pending:?}");
    pending.into_iter().next().unwrap()
}

#[tokio::test]
async fn reconnect_detects_divergence_and_merge_resolves_it() {
    let h = Harness::new(manual_config(), true);
    let (_handle, seen) = diverge(&h, json!({"price": 12}), Some("manager-1")).await;

    let conflict = only_conflict(&h);
    assert_eq!(conflict.key, "menu/9");
    assert_eq!(conflict.field, "price");
    assert_eq!(conflict.local_value, json!(12));
    assert_eq!(conflict.server_value, json!(15));
    assert_eq!(conflict.actor_id, "manager-1");
    assert_eq!(conflict.action, ConflictAction::Pending);

    let status = h.engine.status();
    assert!(status.has_conflicts);
    assert_eq!(status.conflict_count, 1);
    // held back until resolved
    assert_eq!(status.queued_count, 1);
    assert_eq!(h.remote.document("menu/9").unwrap()["price"], 15);
    assert_eq!(
        h.engine.ensure_no_conflict("menu/9"),
        Err(Error::Conflict("menu/9".into()))
    );

    // The local value is what the app keeps seeing
    assert_eq!(h.engine.cached("menu/9").unwrap()["price"], 12);
    assert_eq!(seen.lock().last().unwrap()["price"], 12);

    let resolved = h
        .engine
        .resolve_conflict(&conflict.id, ConflictAction::Merge)
        .unwrap();
    assert_eq!(resolved.action, ConflictAction::Merge);
    assert!(resolved.resolved_at.is_some());
    assert!(!h.engine.has_conflicts());

    let report = h.engine.force_sync().await;
    assert!(report.is_clean());
    assert_eq!(h.engine.status().queued_count, 0);

    let server = h.remote.document("menu/9").unwrap();
    assert_eq!(server["price"], 12);
    assert_eq!(server["name"], "Soup");
    assert_eq!(server["updatedBy"], "manager-1");

    assert!(matches!(
        h.engine.resolve_conflict(&conflict.id, ConflictAction::AcceptLocal),
        Err(Error::ConflictAlreadyResolved(_))
    ));
}

#[tokio::test]
async fn accept_local_overwrites_server() {
    let h = Harness::new(manual_config(), true);
    let _sub = diverge(&h, json!({"price": 12}), Some("manager-1")).await;
    let conflict = only_conflict(&h);

    h.engine
        .resolve_conflict(&conflict.id, ConflictAction::AcceptLocal)
        .unwrap();
    h.engine.force_sync().await;

    assert_eq!(h.remote.document("menu/9").unwrap()["price"], 12);
    assert_eq!(h.engine.status().queued_count, 0);
    assert_eq!(h.engine.conflicts().len(), 1);
    assert!(h.engine.pending_conflicts().is_empty());
}

#[tokio::test]
async fn accept_server_drops_local_field() {
    let h = Harness::new(manual_config(), true);
    let _sub = diverge(&h, json!({"price": 12}), Some("manager-1")).await;
    let conflict = only_conflict(&h);
    let writes = h.remote.write_count();

    h.engine
        .resolve_conflict(&conflict.id, ConflictAction::AcceptServer)
        .unwrap();

    // The queued update carried only the price, so nothing is left to send
    assert_eq!(h.engine.status().queued_count, 0);
    assert_eq!(h.engine.cached("menu/9").unwrap()["price"], 15);

    h.engine.force_sync().await;
    assert_eq!(h.remote.write_count(), writes);
    assert_eq!(h.remote.document("menu/9").unwrap()["price"], 15);
}

#[tokio::test]
async fn merge_settles_every_field_of_the_document() {
    let h = Harness::new(manual_config(), true);
    let _sub = diverge_to(
        &h,
        json!({"price": 12, "name": "Stew"}),
        json!({"name": "Broth", "price": 15}),
        Some("manager-1"),
    )
    .await;

    let pending = h.engine.pending_conflicts();
    let mut fields: Vec<_> = pending.iter().map(|c| c.field.as_str()).collect();
    fields.sort_unstable();
    assert_eq!(fields, vec!["name", "price"]);

    h.engine
        .resolve_conflict(&pending[0].id, ConflictAction::Merge)
        .unwrap();
    assert!(h.engine.pending_conflicts().is_empty());

    h.engine.force_sync().await;
    let server = h.remote.document("menu/9").unwrap();
    assert_eq!(server["price"], 12);
    assert_eq!(server["name"], "Stew");
}

#[tokio::test]
async fn write_without_actor_is_not_a_conflict() {
    let h = Harness::new(manual_config(), true);
    let _sub = diverge(&h, json!({"price": 12}), None).await;

    assert!(h.engine.pending_conflicts().is_empty());
    // replayed straight over the server value
    assert_eq!(h.engine.status().queued_count, 0);
    assert_eq!(h.remote.document("menu/9").unwrap()["price"], 12);
}

#[tokio::test]
async fn engine_actor_is_used_when_call_names_none() {
    let h = Harness::new(manual_config(), true);
    h.engine.set_actor(Some("manager-2"));
    assert_eq!(h.engine.actor_id().as_deref(), Some("manager-2"));

    let _sub = diverge(&h, json!({"price": 12}), None).await;

    assert_eq!(only_conflict(&h).actor_id, "manager-2");
}

#[tokio::test]
async fn pending_is_not_a_resolution() {
    let h = Harness::new(manual_config(), true);
    let _sub = diverge(&h, json!({"price": 12}), Some("manager-1")).await;
    let conflict = only_conflict(&h);

    assert_eq!(
        h.engine.resolve_conflict(&conflict.id, ConflictAction::Pending),
        Err(Error::InvalidResolution)
    );
    assert_eq!(
        h.engine.resolve_conflict("missing", ConflictAction::Merge),
        Err(Error::ConflictNotFound("missing".into()))
    );
    assert!(h.engine.has_conflicts());
}

#[tokio::test]
async fn conflicts_survive_restart() {
    let h = Harness::new(manual_config(), true);
    let _sub = diverge(&h, json!({"price": 12}), Some("manager-1")).await;
    let conflict = only_conflict(&h);

    let restarted = h.restart(h.storage.clone(), manual_config(), true);
    let pending = restarted.pending_conflicts();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, conflict.id);

    // still held after the restart
    let report = restarted.force_sync().await;
    assert_eq!(report.attempted, 0);
    assert_eq!(report.deferred, 1);
}

#[tokio::test]
async fn untouched_server_fields_are_not_conflicts() {
    let h = Harness::new(manual_config(), true);
    // only the price moved on the server
    let _sub = diverge(&h, json!({"price": 12, "name": "Stew"}), Some("manager-1")).await;

    assert_eq!(only_conflict(&h).field, "price");
}

#[tokio::test]
async fn reconnect_without_server_change_is_not_a_conflict() {
    let h = Harness::new(manual_config(), true);
    let _sub = diverge_to(
        &h,
        json!({"price": 12}),
        json!({"name": "Soup", "price": 10}),
        Some("manager-1"),
    )
    .await;

    assert!(!h.engine.has_conflicts());
    assert_eq!(h.engine.status().queued_count, 0);
    assert_eq!(h.remote.document("menu/9").unwrap()["price"], 12);
}

#[tokio::test]
async fn own_consecutive_writes_do_not_conflict() {
    let h = Harness::with_remote(manual_config(), true, |remote| {
        Arc::new(YieldingStore(remote)) as Arc<dyn RemoteStore>
    });
    h.remote
        .put_external("menu/9", json!({"name": "Soup", "price": 10}));
    let (_handle, seen) = watch(&h).await;

    h.engine.update("menu/9", json!({"price": 12}), Some("m-1")).unwrap();
    h.engine.update("menu/9", json!({"price": 13}), Some("m-1")).unwrap();
    let report = h.engine.force_sync().await;
    assert_eq!(report.succeeded.len(), 2);

    wait_until(|| seen.lock().last().is_some_and(|v| v["price"] == 13)).await;
    assert_eq!(h.remote.document("menu/9").unwrap()["price"], 13);
    assert!(h.engine.pending_conflicts().is_empty());
    assert!(!h.engine.has_conflicts());

    // later writes to the document are not held
    h.engine.update("menu/9", json!({"price": 14}), Some("m-1")).unwrap();
    let report = h.engine.force_sync().await;
    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.deferred, 0);
}

#[tokio::test]
async fn accept_server_on_offline_create_keeps_server_value() {
    let h = Harness::new(manual_config(), true);
    let _sub = watch(&h).await;
    go_offline(&h).await;
    h.engine
        .create("menu/9", json!({"price": 12, "stock": 1}), Some("manager-1"))
        .unwrap();
    h.remote.put_external("menu/9", json!({"price": 15, "stock": 1}));
    come_back(&h).await;

    let conflict = only_conflict(&h);
    assert_eq!(conflict.field, "price");
    h.engine
        .resolve_conflict(&conflict.id, ConflictAction::AcceptServer)
        .unwrap();
    assert_eq!(h.engine.cached("menu/9"), Some(json!({"price": 15, "stock": 1})));

    let report = h.engine.force_sync().await;
    assert_eq!(report.succeeded.len(), 1);
    let server = h.remote.document("menu/9").unwrap();
    assert_eq!(server["price"], 15);
    assert_eq!(server["stock"], 1);
}

#[tokio::test]
async fn merge_on_offline_create_keeps_server_only_fields() {
    let h = Harness::new(manual_config(), true);
    let _sub = watch(&h).await;
    go_offline(&h).await;
    h.engine
        .create("menu/9", json!({"price": 12, "stock": 1}), Some("manager-1"))
        .unwrap();
    h.remote
        .put_external("menu/9", json!({"price": 15, "stock": 1, "vegan": true}));
    come_back(&h).await;

    let conflict = only_conflict(&h);
    h.engine
        .resolve_conflict(&conflict.id, ConflictAction::Merge)
        .unwrap();
    h.engine.force_sync().await;

    assert_eq!(h.engine.status().queued_count, 0);
    assert!(!h.engine.has_conflicts());
    let server = h.remote.document("menu/9").unwrap();
    assert_eq!(server["price"], 12);
    assert_eq!(server["stock"], 1);
    assert_eq!(server["vegan"], true);
}

#[tokio::test]
async fn accept_server_leaves_a_later_delete_queued() {
    let h = Harness::new(manual_config(), true);
    let _sub = diverge(&h, json!({"price": 12}), Some("manager-1")).await;
    let conflict = only_conflict(&h);
    h.engine.delete("menu/9", Some("manager-1")).unwrap();
    assert_eq!(h.engine.status().queued_count, 2);
    let writes = h.remote.write_count();

    h.engine
        .resolve_conflict(&conflict.id, ConflictAction::AcceptServer)
        .unwrap();
    // the emptied update is gone, the delete is not
    assert_eq!(h.engine.status().queued_count, 1);

    h.engine.force_sync().await;
    assert_eq!(h.remote.write_count(), writes + 1);
    assert!(h.remote.document("menu/9").is_none());
    assert_eq!(h.engine.cached("menu/9"), None);
}

#[tokio::test]
async fn merge_before_a_later_delete_writes_nothing_back() {
    let h = Harness::new(manual_config(), true);
    let _sub = diverge(&h, json!({"price": 12}), Some("manager-1")).await;
    let conflict = only_conflict(&h);
    h.engine.delete("menu/9", Some("manager-1")).unwrap();

    h.engine
        .resolve_conflict(&conflict.id, ConflictAction::Merge)
        .unwrap();
    assert_eq!(h.engine.status().queued_count, 2);

    h.engine.force_sync().await;
    assert_eq!(h.engine.status().queued_count, 0);
    assert!(h.remote.document("menu/9").is_none());
    assert!(!h.engine.has_conflicts());
}

#[tokio::test]
async fn configured_actor_survives_clear_all() {
    let h = Harness::new(manual_config().with_actor("manager-1"), true);
    h.engine.clear_all().await.unwrap();
    assert_eq!(h.engine.actor_id().as_deref(), Some("manager-1"));

    let _sub = diverge(&h, json!({"price": 12}), None).await;

    assert_eq!(only_conflict(&h).actor_id, "manager-1");
}

#[tokio::test]
async fn resolved_records_are_pruned_past_the_limit() {
    let h = Harness::new(manual_config().with_resolved_conflict_limit(0), true);
    let _sub = diverge(&h, json!({"price": 12}), Some("manager-1")).await;
    let conflict = only_conflict(&h);

    h.engine
        .resolve_conflict(&conflict.id, ConflictAction::AcceptLocal)
        .unwrap();
    assert!(h.engine.conflicts().is_empty());
    assert_eq!(
        h.engine.resolve_conflict(&conflict.id, ConflictAction::Merge),
        Err(Error::ConflictNotFound(conflict.id.clone()))
    );
}
