//! Durable last-known state and the pending-change queue.
//!
//! State is written as one versioned JSON document under a single key of a
//! [`KeyValueStore`]. While offline every cache mutation is also queued, and
//! the queue is replayed against a [`RemoteSource`] once connectivity returns.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::OfflineConfig;
use crate::error::FleetError;
use crate::models::{
    Alert, CacheRecord, ConflictItem, ConflictKind, ConflictStrategy, ConflictWinner,
    PendingSyncItem, Route, SyncFailure, SyncItemKind, SyncOperation, SyncResult, Vehicle,
    Violation,
};
use crate::processor::CacheChange;

pub const STATE_FORMAT_VERSION: u32 = 1;

// ===== COLLABORATORS =====

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// Remote view of a record, as seen at sync time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub payload: Value,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: Option<u64>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncItemError {
    /// The item was refused; retry on a later pass.
    #[error("Recoverable sync failure: {0}")]
    Recoverable(String),

    /// The remote is unusable; stop the pass.
    #[error("Unrecoverable sync failure: {0}")]
    Unrecoverable(String),
}

#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch(&self, item: &PendingSyncItem) -> Result<Option<RemoteRecord>, SyncItemError>;
    async fn push(&self, item: &PendingSyncItem) -> Result<(), SyncItemError>;
    /// Removes the record. A record the remote never had counts as removed.
    async fn delete(&self, item: &PendingSyncItem) -> Result<(), SyncItemError>;
}

// ===== PERSISTED FORMAT =====

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub vehicles: Vec<Vehicle>,
    pub alerts: Vec<Alert>,
    pub violations: Vec<Violation>,
    pub routes: Vec<Route>,
}

impl StateSnapshot {
    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
            && self.alerts.is_empty()
            && self.violations.is_empty()
            && self.routes.is_empty()
    }

    fn capped(&self, config: &OfflineConfig) -> Self {
        Self {
            vehicles: newest(&self.vehicles, config.max_vehicles),
            alerts: newest(&self.alerts, config.max_alerts),
            violations: newest(&self.violations, config.max_violations),
            routes: newest(&self.routes, config.max_routes),
        }
    }

    fn halved(&self) -> Self {
        Self {
            vehicles: newest(&self.vehicles, self.vehicles.len() / 2),
            alerts: newest(&self.alerts, self.alerts.len() / 2),
            violations: newest(&self.violations, self.violations.len() / 2),
            routes: newest(&self.routes, self.routes.len() / 2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub format_version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(flatten)]
    pub snapshot: StateSnapshot,
    pub pending: Vec<PendingSyncItem>,
    pub last_sync: Option<DateTime<Utc>>,
    pub next_item_id: u64,
}

/// Keeps the `cap` records with the latest timestamps, newest first.
fn newest<T: CacheRecord + Clone>(items: &[T], cap: usize) -> Vec<T> {
    let mut sorted = items.to_vec();
    sorted.sort_by(|a, b| b.record_timestamp().cmp(&a.record_timestamp()));
    sorted.truncate(cap);
    sorted
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Written { bytes: usize },
    /// Written after dropping the older half of every record list.
    Truncated { bytes: usize },
    /// Still over budget after truncation; nothing was written.
    Skipped { bytes: usize },
}

// ===== OFFLINE STORE =====

struct OfflineInner {
    online: bool,
    dirty: bool,
    pending: VecDeque<PendingSyncItem>,
    next_item_id: u64,
    last_sync: Option<DateTime<Utc>>,
}

pub struct OfflineStore {
    config: OfflineConfig,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    inner: Mutex<OfflineInner>,
    sync_guard: tokio::sync::Mutex<()>,
}

impl OfflineStore {
    pub fn new(config: OfflineConfig, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
            inner: Mutex::new(OfflineInner {
                online: false,
                dirty: false,
                pending: VecDeque::new(),
                next_item_id: 1,
                last_sync: None,
            }),
            sync_guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Restores the pending queue and returns the cached records last written.
    /// An absent or unreadable-version document yields `None`.
    pub fn load(&self) -> Result<Option<StateSnapshot>> {
        let Some(bytes) = self.store.get(&self.config.storage_key)? else {
            return Ok(None);
        };
        let raw: Value =
            serde_json::from_slice(&bytes).context("Persisted fleet state is not valid JSON")?;
        let version = raw.get("formatVersion").and_then(Value::as_u64);
        if version != Some(u64::from(STATE_FORMAT_VERSION)) {
            warn!(
                found = ?version,
                expected = STATE_FORMAT_VERSION,
                "Ignoring persisted state with unknown format version"
            );
            return Ok(None);
        }
        let state: PersistedState =
            serde_json::from_value(raw).context("Failed to decode persisted fleet state")?;

        let mut inner = self.inner.lock();
        let max_seen = state.pending.iter().map(|p| p.id).max().unwrap_or(0);
        inner.next_item_id = state.next_item_id.max(max_seen + 1);
        inner.pending = state.pending.into_iter().collect();
        inner.last_sync = state.last_sync;
        info!(
            pending = inner.pending.len(),
            vehicles = state.snapshot.vehicles.len(),
            "Restored offline state"
        );
        Ok(Some(state.snapshot))
    }

    /// Returns true when this call moved the store from offline to online.
    pub fn record_online(&self, online: bool) -> bool {
        let mut inner = self.inner.lock();
        let came_online = online && !inner.online;
        inner.online = online;
        came_online
    }

    pub fn is_online(&self) -> bool {
        self.inner.lock().online
    }

    pub fn enqueue(&self, kind: SyncItemKind, payload: Value) -> u64 {
        self.push_item(kind, SyncOperation::Upsert, payload)
    }

    fn push_item(&self, kind: SyncItemKind, operation: SyncOperation, payload: Value) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_item_id;
        inner.next_item_id += 1;
        inner.pending.push_back(PendingSyncItem {
            id,
            kind,
            operation,
            payload,
            enqueued_at: self.clock.now(),
        });
        inner.dirty = true;
        debug!(item_id = id, kind = ?kind, operation = ?operation, "Queued change for sync");
        id
    }

    /// Marks state dirty and, while offline, queues a removal of the record.
    pub fn record_removal(&self, kind: SyncItemKind, record_id: &str) {
        let online = {
            let mut inner = self.inner.lock();
            inner.dirty = true;
            inner.online
        };
        if !online {
            self.push_item(kind, SyncOperation::Delete, serde_json::json!({ "id": record_id }));
        }
    }

    /// Marks state dirty and, while offline, queues the change for sync.
    pub fn record_change(&self, change: &CacheChange) {
        let item = match change {
            CacheChange::VehicleUpdated { vehicle, .. } => {
                Some((SyncItemKind::Vehicle, serde_json::to_value(vehicle)))
            }
            CacheChange::AlertCached(alert) => Some((SyncItemKind::Alert, serde_json::to_value(alert))),
            CacheChange::ViolationCached(violation) => {
                Some((SyncItemKind::Violation, serde_json::to_value(violation)))
            }
            CacheChange::RouteCached(route) => Some((SyncItemKind::Route, serde_json::to_value(route))),
            CacheChange::VehicleEvicted(_) => None,
        };

        let online = {
            let mut inner = self.inner.lock();
            inner.dirty = true;
            inner.online
        };
        if online {
            return;
        }
        match item {
            Some((kind, Ok(payload))) => {
                self.enqueue(kind, payload);
            }
            Some((kind, Err(e))) => warn!(kind = ?kind, error = %e, "Could not queue change"),
            None => {}
        }
    }

    pub fn pending(&self) -> Vec<PendingSyncItem> {
        self.inner.lock().pending.iter().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_sync
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    fn acknowledge(&self, item_id: u64) {
        let mut inner = self.inner.lock();
        inner.pending.retain(|p| p.id != item_id);
        inner.dirty = true;
    }

    // ===== SYNC =====

    /// Replays the queue against the remote in enqueue order.
    ///
    /// An item leaves the queue only once the remote acknowledged it or a
    /// conflict was resolved in the remote's favour. Recoverable failures keep
    /// the item and move on; an unrecoverable one ends the pass. Conflicts won
    /// by the remote carry the remote payload for the caller to re-apply.
    pub async fn sync(&self, remote: &dyn RemoteSource) -> SyncResult {
        let _guard = self.sync_guard.lock().await;
        let queue = self.pending();
        let mut result = SyncResult::default();
        if queue.is_empty() {
            return result;
        }
        info!(pending = queue.len(), "Starting offline queue sync");

        for item in queue {
            if item.operation == SyncOperation::Delete {
                let outcome = remote.delete(&item).await;
                if !self.settle(&item, outcome, &mut result) {
                    break;
                }
                continue;
            }

            let remote_state = match remote.fetch(&item).await {
                Ok(state) => state,
                Err(e) => {
                    let fatal = matches!(e, SyncItemError::Unrecoverable(_));
                    result.errors.push(failure(&item, &e));
                    if fatal {
                        warn!(item_id = item.id, error = %e, "Stopping sync");
                        break;
                    }
                    continue;
                }
            };

            if let Some(remote_state) = remote_state {
                if remote_state.payload == item.payload {
                    self.acknowledge(item.id);
                    result.synced_count += 1;
                    continue;
                }
                if let Some(kind) = detect_conflict(&item, &remote_state) {
                    let winner = resolve_conflict(self.config.conflict_strategy, &item, &remote_state);
                    let conflict = FleetError::SyncConflict {
                        item_id: item.id,
                        kind,
                    };
                    info!(error = %conflict, winner = ?winner, "Resolved sync conflict");
                    result.conflicts.push(ConflictItem {
                        item_id: item.id,
                        item_kind: item.kind,
                        kind,
                        local: item.payload.clone(),
                        remote: remote_state.payload.clone(),
                        winner,
                    });
                    if winner == ConflictWinner::Remote {
                        self.acknowledge(item.id);
                        continue;
                    }
                }
            }

            let outcome = remote.push(&item).await;
            if !self.settle(&item, outcome, &mut result) {
                break;
            }
        }

        {
            let mut inner = self.inner.lock();
            inner.last_sync = Some(self.clock.now());
            inner.dirty = true;
        }
        info!(
            synced = result.synced_count,
            conflicts = result.conflicts.len(),
            errors = result.errors.len(),
            remaining = self.pending_len(),
            "Offline queue sync finished"
        );
        result
    }

    /// Records the outcome of a push or delete. Returns false when the pass
    /// has to stop.
    fn settle(
        &self,
        item: &PendingSyncItem,
        outcome: Result<(), SyncItemError>,
        result: &mut SyncResult,
    ) -> bool {
        match outcome {
            Ok(()) => {
                self.acknowledge(item.id);
                result.synced_count += 1;
                true
            }
            Err(e) => {
                warn!(item_id = item.id, error = %e, "Sync item failed");
                result.errors.push(failure(item, &e));
                !matches!(e, SyncItemError::Unrecoverable(_))
            }
        }
    }

    // ===== PERSISTENCE =====

    /// Writes the capped snapshot and the pending queue. Over budget, the
    /// older half of every record list is dropped and the write retried once.
    /// The pending queue is never truncated.
    pub fn persist(&self, snapshot: &StateSnapshot) -> Result<PersistOutcome> {
        let budget = self.config.max_storage_bytes;
        let capped = snapshot.capped(&self.config);

        let bytes = self.encode(capped.clone())?;
        if bytes.len() <= budget {
            self.write(&bytes)?;
            return Ok(PersistOutcome::Written { bytes: bytes.len() });
        }

        let over = FleetError::StorageQuota {
            size: bytes.len(),
            budget,
        };
        warn!(error = %over, "Truncating persisted state");
        let truncated = self.encode(capped.halved())?;
        if truncated.len() <= budget {
            self.write(&truncated)?;
            return Ok(PersistOutcome::Truncated {
                bytes: truncated.len(),
            });
        }

        let over = FleetError::StorageQuota {
            size: truncated.len(),
            budget,
        };
        warn!(error = %over, "Skipping state write");
        Ok(PersistOutcome::Skipped {
            bytes: truncated.len(),
        })
    }

    pub fn persist_if_dirty(&self, snapshot: &StateSnapshot) -> Result<Option<PersistOutcome>> {
        if !self.is_dirty() {
            return Ok(None);
        }
        self.persist(snapshot).map(Some)
    }

    /// Marks state as changed outside of [`record_change`](Self::record_change).
    pub fn mark_dirty(&self) {
        self.inner.lock().dirty = true;
    }

    fn encode(&self, snapshot: StateSnapshot) -> Result<Vec<u8>> {
        let state = {
            let inner = self.inner.lock();
            PersistedState {
                format_version: STATE_FORMAT_VERSION,
                saved_at: self.clock.now(),
                snapshot,
                pending: inner.pending.iter().cloned().collect(),
                last_sync: inner.last_sync,
                next_item_id: inner.next_item_id,
            }
        };
        serde_json::to_vec(&state).context("Failed to encode fleet state")
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        self.store.set(&self.config.storage_key, bytes)?;
        self.inner.lock().dirty = false;
        debug!(bytes = bytes.len(), "Persisted fleet state");
        Ok(())
    }
}

fn failure(item: &PendingSyncItem, error: &SyncItemError) -> SyncFailure {
    SyncFailure {
        item_id: item.id,
        message: error.to_string(),
        recoverable: matches!(error, SyncItemError::Recoverable(_)),
    }
}

/// Classifies how the remote diverged from the state the change was based on.
/// `None` means the remote has not moved since and the change can be pushed.
pub fn detect_conflict(item: &PendingSyncItem, remote: &RemoteRecord) -> Option<ConflictKind> {
    if let (Some(local), Some(theirs)) = (item.version(), remote.version) {
        return (local != theirs).then_some(ConflictKind::Version);
    }
    match remote.updated_at {
        Some(updated) if updated > item.enqueued_at => Some(ConflictKind::Timestamp),
        Some(_) => None,
        None => Some(ConflictKind::Data),
    }
}

pub fn resolve_conflict(
    strategy: ConflictStrategy,
    item: &PendingSyncItem,
    remote: &RemoteRecord,
) -> ConflictWinner {
    match strategy {
        ConflictStrategy::Server => ConflictWinner::Remote,
        ConflictStrategy::Client => ConflictWinner::Local,
        ConflictStrategy::Timestamp => match remote.updated_at {
            Some(updated) if updated > item.enqueued_at => ConflictWinner::Remote,
            _ => ConflictWinner::Local,
        },
    }
}
