use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use fleet_sync::config::OfflineConfig;
use fleet_sync::offline::{RemoteRecord, SyncItemError};
use fleet_sync::{
    ConflictKind, ConflictStrategy, ConflictWinner, KeyValueStore, ManualClock, MemoryStore,
    NativeDbStore, OfflineStore, PendingSyncItem, Position, RemoteSource, StateSnapshot,
    SyncItemKind, SyncOperation, Vehicle, VehicleStatus,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::tempdir;

/// # Offline Queue Sync
///
/// Replays queued changes against a scripted remote and checks ordering,
/// failure handling, every conflict strategy and durable persistence
/// through the native_db backend.

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
}

#[derive(Default)]
struct ScriptedRemote {
    records: Mutex<HashMap<String, RemoteRecord>>,
    failures: Mutex<HashMap<String, SyncItemError>>,
    pushed: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

impl ScriptedRemote {
    fn with_record(self, id: &str, record: RemoteRecord) -> Self {
        self.records.lock().insert(id.to_string(), record);
        self
    }

    fn failing(self, id: &str, error: SyncItemError) -> Self {
        self.failures.lock().insert(id.to_string(), error);
        self
    }

    fn pushed(&self) -> Vec<String> {
        self.pushed.lock().clone()
    }

    fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }
}

#[async_trait]
impl RemoteSource for ScriptedRemote {
    async fn fetch(&self, item: &PendingSyncItem) -> Result<Option<RemoteRecord>, SyncItemError> {
        Ok(item
            .record_id()
            .and_then(|id| self.records.lock().get(id).cloned()))
    }

    async fn push(&self, item: &PendingSyncItem) -> Result<(), SyncItemError> {
        let id = item.record_id().unwrap_or_default().to_string();
        if let Some(error) = self.failures.lock().get(&id).cloned() {
            return Err(error);
        }
        self.pushed.lock().push(id);
        Ok(())
    }

    async fn delete(&self, item: &PendingSyncItem) -> Result<(), SyncItemError> {
        let id = item.record_id().unwrap_or_default().to_string();
        if let Some(error) = self.failures.lock().get(&id).cloned() {
            return Err(error);
        }
        self.records.lock().remove(&id);
        self.deleted.lock().push(id);
        Ok(())
    }
}

fn offline_store(strategy: ConflictStrategy) -> OfflineStore {
    let config = OfflineConfig {
        conflict_strategy: strategy,
        ..Default::default()
    };
    OfflineStore::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(ManualClock::new(ts(0))),
    )
}

fn vehicle_payload(id: &str) -> Value {
    json!({"id": id, "status": "active"})
}

fn remote(payload: Value, updated_at: Option<DateTime<Utc>>, version: Option<u64>) -> RemoteRecord {
    RemoteRecord {
        payload,
        updated_at,
        version,
    }
}

#[tokio::test]
async fn test_recoverable_failure_keeps_item_and_continues() {
    let store = offline_store(ConflictStrategy::Timestamp);
    let first = store.enqueue(SyncItemKind::Vehicle, vehicle_payload("truck-1"));
    store.enqueue(SyncItemKind::Vehicle, vehicle_payload("truck-2"));
    let remote = ScriptedRemote::default().failing(
        "truck-1",
        SyncItemError::Recoverable("validation failed".to_string()),
    );

    let result = store.sync(&remote).await;

    assert_eq!(result.synced_count, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].item_id, first);
    assert!(result.errors[0].recoverable);
    assert!(!result.is_clean());
    assert_eq!(remote.pushed(), vec!["truck-2"]);

    let pending = store.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, first);
    assert_eq!(store.last_sync(), Some(ts(0)));
}

#[tokio::test]
async fn test_unrecoverable_failure_stops_the_pass() {
    let store = offline_store(ConflictStrategy::Timestamp);
    for id in ["truck-1", "truck-2", "truck-3"] {
        store.enqueue(SyncItemKind::Vehicle, vehicle_payload(id));
    }
    let remote = ScriptedRemote::default().failing(
        "truck-2",
        SyncItemError::Unrecoverable("remote returned 503".to_string()),
    );

    let result = store.sync(&remote).await;

    assert_eq!(result.synced_count, 1);
    assert_eq!(result.errors.len(), 1);
    assert!(!result.errors[0].recoverable);
    assert_eq!(remote.pushed(), vec!["truck-1"]);
    let remaining: Vec<_> = store
        .pending()
        .iter()
        .map(|p| p.record_id().unwrap().to_string())
        .collect();
    assert_eq!(remaining, vec!["truck-2", "truck-3"]);
}

#[tokio::test]
async fn test_items_replay_in_enqueue_order() {
    let store = offline_store(ConflictStrategy::Timestamp);
    store.enqueue(SyncItemKind::Alert, json!({"id": "alert-9"}));
    store.enqueue(SyncItemKind::Vehicle, vehicle_payload("truck-1"));
    store.enqueue(SyncItemKind::Route, json!({"id": "route-3"}));
    let remote = ScriptedRemote::default();

    let result = store.sync(&remote).await;

    assert!(result.is_clean());
    assert_eq!(result.synced_count, 3);
    assert_eq!(remote.pushed(), vec!["alert-9", "truck-1", "route-3"]);
    assert_eq!(store.pending_len(), 0);
}

#[tokio::test]
async fn test_offline_removals_replay_as_deletes() {
    let store = offline_store(ConflictStrategy::Server);
    store.enqueue(SyncItemKind::Alert, json!({"id": "alert-1", "read": true}));
    store.record_removal(SyncItemKind::Alert, "alert-2");
    store.record_removal(SyncItemKind::Vehicle, "truck-9");
    // A delete never goes through conflict detection, even when the remote
    // still holds a newer copy.
    let remote = ScriptedRemote::default()
        .with_record("truck-9", remote(vehicle_payload("truck-9"), Some(ts(60)), None))
        .failing(
            "alert-2",
            SyncItemError::Recoverable("remote returned 409".to_string()),
        );

    let result = store.sync(&remote).await;

    assert_eq!(result.synced_count, 2);
    assert!(result.conflicts.is_empty());
    assert_eq!(result.errors.len(), 1);
    assert_eq!(remote.pushed(), vec!["alert-1"]);
    assert_eq!(remote.deleted(), vec!["truck-9"]);
    let pending = store.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, SyncOperation::Delete);
    assert_eq!(pending[0].record_id(), Some("alert-2"));
}

#[tokio::test]
async fn test_empty_queue_is_a_noop() {
    let store = offline_store(ConflictStrategy::Server);
    let result = store.sync(&ScriptedRemote::default()).await;
    assert_eq!(result.synced_count, 0);
    assert!(result.conflicts.is_empty());
    assert!(store.last_sync().is_none());
}

#[tokio::test]
async fn test_identical_remote_counts_as_synced() {
    let store = offline_store(ConflictStrategy::Client);
    store.enqueue(SyncItemKind::Vehicle, vehicle_payload("truck-1"));
    let remote = ScriptedRemote::default().with_record(
        "truck-1",
        remote(vehicle_payload("truck-1"), Some(ts(60)), None),
    );

    let result = store.sync(&remote).await;

    assert_eq!(result.synced_count, 1);
    assert!(result.conflicts.is_empty());
    assert!(remote.pushed().is_empty());
    assert_eq!(store.pending_len(), 0);
}

#[tokio::test]
async fn test_server_strategy_lets_remote_win() {
    let store = offline_store(ConflictStrategy::Server);
    store.enqueue(SyncItemKind::Vehicle, vehicle_payload("truck-1"));
    let theirs = json!({"id": "truck-1", "status": "maintenance"});
    let remote = ScriptedRemote::default()
        .with_record("truck-1", remote(theirs.clone(), Some(ts(60)), None));

    let result = store.sync(&remote).await;

    assert_eq!(result.synced_count, 0);
    assert_eq!(result.conflicts.len(), 1);
    let conflict = &result.conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::Timestamp);
    assert_eq!(conflict.winner, ConflictWinner::Remote);
    assert_eq!(conflict.item_kind, SyncItemKind::Vehicle);
    assert_eq!(conflict.remote, theirs);
    assert!(remote.pushed().is_empty());
    assert_eq!(store.pending_len(), 0);
}

#[tokio::test]
async fn test_client_strategy_pushes_local() {
    let store = offline_store(ConflictStrategy::Client);
    store.enqueue(SyncItemKind::Vehicle, vehicle_payload("truck-1"));
    let remote = ScriptedRemote::default().with_record(
        "truck-1",
        remote(json!({"id": "truck-1", "status": "offline"}), Some(ts(60)), None),
    );

    let result = store.sync(&remote).await;

    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].winner, ConflictWinner::Local);
    assert_eq!(result.synced_count, 1);
    assert_eq!(remote.pushed(), vec!["truck-1"]);
}

#[tokio::test]
async fn test_timestamp_strategy_uses_the_later_side() {
    let store = offline_store(ConflictStrategy::Timestamp);
    store.enqueue(SyncItemKind::Vehicle, vehicle_payload("newer-remote"));
    store.enqueue(SyncItemKind::Vehicle, vehicle_payload("older-remote"));
    let remote = ScriptedRemote::default()
        .with_record(
            "newer-remote",
            remote(json!({"id": "newer-remote", "status": "offline"}), Some(ts(30)), None),
        )
        .with_record(
            "older-remote",
            remote(json!({"id": "older-remote", "status": "offline"}), Some(ts(-30)), None),
        );

    let result = store.sync(&remote).await;

    // The remote record last touched before the change was queued is simply
    // overwritten; only the newer one is a conflict.
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].winner, ConflictWinner::Remote);
    assert_eq!(result.synced_count, 1);
    assert_eq!(remote.pushed(), vec!["older-remote"]);
    assert_eq!(store.pending_len(), 0);
}

#[tokio::test]
async fn test_version_mismatch_is_a_version_conflict() {
    let store = offline_store(ConflictStrategy::Client);
    store.enqueue(
        SyncItemKind::Route,
        json!({"id": "route-1", "version": 3, "waypoints": []}),
    );
    let remote = ScriptedRemote::default().with_record(
        "route-1",
        remote(json!({"id": "route-1", "version": 4}), None, Some(4)),
    );

    let result = store.sync(&remote).await;

    assert_eq!(result.conflicts[0].kind, ConflictKind::Version);
    assert_eq!(result.conflicts[0].winner, ConflictWinner::Local);
    assert_eq!(remote.pushed(), vec!["route-1"]);
}

#[tokio::test]
async fn test_queue_and_snapshot_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fleet.db");
    let clock = Arc::new(ManualClock::new(ts(0)));
    let vehicle = Vehicle::new(
        "truck-1",
        Position::new(40.7128, -74.0060, ts(0)),
        VehicleStatus::Active,
    );

    {
        let kv: Arc<dyn KeyValueStore> = Arc::new(NativeDbStore::open(&path).unwrap());
        let store = OfflineStore::new(OfflineConfig::default(), kv, clock.clone());
        store.enqueue(SyncItemKind::Vehicle, vehicle_payload("truck-1"));
        store.enqueue(SyncItemKind::Vehicle, vehicle_payload("truck-2"));
        let snapshot = StateSnapshot {
            vehicles: vec![vehicle.clone()],
            ..Default::default()
        };
        store.persist(&snapshot).unwrap();
        assert!(!store.is_dirty());
    }

    let kv: Arc<dyn KeyValueStore> = Arc::new(NativeDbStore::open(&path).unwrap());
    let store = OfflineStore::new(OfflineConfig::default(), kv, clock);
    let snapshot = store.load().unwrap().expect("state was persisted");

    assert_eq!(snapshot.vehicles, vec![vehicle]);
    let pending = store.pending();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, 1);
    assert_eq!(pending[1].record_id(), Some("truck-2"));
    // Sequence numbers continue after a restart.
    assert_eq!(store.enqueue(SyncItemKind::Alert, json!({"id": "a"})), 3);
}
