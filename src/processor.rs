//! Validation, prioritization, throttling and batching of inbound telemetry.
//!
//! The processor is synchronous and single-owner: the orchestrator holds it
//! behind one lock and drives it from the transport event loop and the tick
//! timer. Every mutation it makes is reported back as a [`CacheChange`] so the
//! caller can fan out to the geofence engine, alerting and the offline queue.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::BoundedCache;
use crate::config::ProcessorConfig;
use crate::error::{FleetError, FleetResult};
use crate::geofence::haversine_distance;
use crate::models::{Alert, Route, Vehicle, VehicleStatus, VehicleUpdate, Violation};
use crate::protocol::{InboundFrame, MessageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorStats {
    pub received: u64,
    pub rejected: u64,
    pub throttled: u64,
    pub stale: u64,
    pub duplicates: u64,
    pub applied: u64,
    pub evicted: u64,
    pub batches: u64,
}

/// A mutation of one of the processor's caches.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheChange {
    VehicleUpdated {
        vehicle: Vehicle,
        previous_status: Option<VehicleStatus>,
    },
    VehicleEvicted(String),
    AlertCached(Alert),
    ViolationCached(Violation),
    RouteCached(Route),
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    vehicle: Vehicle,
    priority: UpdatePriority,
}

pub struct MessageProcessor {
    config: ProcessorConfig,
    vehicles: BoundedCache<Vehicle>,
    alerts: BoundedCache<Alert>,
    violations: BoundedCache<Violation>,
    routes: BoundedCache<Route>,
    queue: Vec<QueuedUpdate>,
    buffer: Vec<InboundFrame>,
    stats: ProcessorStats,
}

impl MessageProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            vehicles: BoundedCache::new(config.max_vehicles),
            alerts: BoundedCache::new(config.max_alerts),
            violations: BoundedCache::new(config.max_violations),
            routes: BoundedCache::new(config.max_routes),
            queue: Vec::new(),
            buffer: Vec::new(),
            stats: ProcessorStats::default(),
            config,
        }
    }

    // ===== INGEST =====

    /// Validates a single typed event and either applies it, queues it for the
    /// next tick, or drops it. Rejections are counted and returned as errors.
    pub fn ingest(&mut self, frame: InboundFrame) -> FleetResult<Vec<CacheChange>> {
        self.stats.received += 1;
        let result = self.ingest_inner(frame);
        if result.is_err() {
            self.stats.rejected += 1;
        }
        result
    }

    /// Splits batches and ingests every sub-event. Rejections are logged and
    /// counted; they never abort the rest of the batch.
    pub fn ingest_frame(&mut self, frame: InboundFrame) -> Vec<CacheChange> {
        let mut changes = Vec::new();
        for part in frame.split() {
            let outcome = match part {
                Ok(event) => self.ingest(event),
                Err(e) => {
                    self.stats.received += 1;
                    self.stats.rejected += 1;
                    Err(e)
                }
            };
            match outcome {
                Ok(mut applied) => changes.append(&mut applied),
                Err(e) => warn!(error = %e, "Rejected telemetry event"),
            }
        }
        changes
    }

    fn ingest_inner(&mut self, frame: InboundFrame) -> FleetResult<Vec<CacheChange>> {
        match frame.kind {
            MessageKind::VehicleUpdate => {
                let update: VehicleUpdate = serde_json::from_value(frame.data)?;
                let vehicle = update.into_vehicle()?;
                Ok(self.accept_vehicle(vehicle).unwrap_or_default())
            }
            MessageKind::Alert => {
                let alert: Alert = serde_json::from_value(frame.data)?;
                alert.validate()?;
                Ok(self.cache_alert(alert).into_iter().collect())
            }
            MessageKind::GeofenceViolation => {
                let violation: Violation = serde_json::from_value(frame.data)?;
                violation.validate()?;
                Ok(self.cache_violation(violation).into_iter().collect())
            }
            MessageKind::RouteUpdate => {
                let route: Route = serde_json::from_value(frame.data)?;
                route.validate()?;
                Ok(self.cache_route(route).into_iter().collect())
            }
            other => Err(FleetError::Validation(format!(
                "unsupported telemetry type '{}'",
                other.as_str()
            ))),
        }
    }

    fn accept_vehicle(&mut self, vehicle: Vehicle) -> Option<Vec<CacheChange>> {
        let cached = self.vehicles.get(&vehicle.id);

        if let Some(existing) = cached {
            if vehicle.last_update < existing.last_update {
                self.stats.stale += 1;
                debug!(vehicle_id = %vehicle.id, "Dropping stale vehicle update");
                return None;
            }
            if *existing == vehicle {
                self.stats.duplicates += 1;
                return None;
            }
            if self.is_throttled(existing, &vehicle) {
                self.stats.throttled += 1;
                return None;
            }
        }

        let priority = self.priority_for(&vehicle);
        if priority == UpdatePriority::High && self.config.immediate_high_priority {
            return Some(self.apply(vehicle));
        }
        self.queue.push(QueuedUpdate { vehicle, priority });
        None
    }

    fn is_throttled(&self, existing: &Vehicle, incoming: &Vehicle) -> bool {
        if existing.status != incoming.status {
            return false;
        }
        let window = chrono::Duration::from_std(self.config.throttle_window)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let elapsed = incoming.last_update - existing.last_update;
        if elapsed >= window {
            return false;
        }
        let moved = haversine_distance(
            &existing.position.coordinate(),
            &incoming.position.coordinate(),
        );
        moved < self.config.min_distance_meters
    }

    pub fn priority_for(&self, vehicle: &Vehicle) -> UpdatePriority {
        let status_changed = self
            .vehicles
            .get(&vehicle.id)
            .map(|cached| cached.status != vehicle.status)
            .unwrap_or(true);
        if status_changed || vehicle.position.speed > self.config.fast_speed_threshold {
            UpdatePriority::High
        } else if vehicle.is_moving() {
            UpdatePriority::Medium
        } else {
            UpdatePriority::Low
        }
    }

    // ===== BATCHING =====

    /// Buffers a raw frame. Returns true once the buffer reached `batch_size`
    /// and should be flushed without waiting for the batch timer.
    pub fn buffer(&mut self, frame: InboundFrame) -> bool {
        self.buffer.push(frame);
        self.buffer.len() >= self.config.batch_size.max(1)
    }

    pub fn flush_buffer(&mut self) -> Vec<CacheChange> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        self.stats.batches += 1;
        let frames = std::mem::take(&mut self.buffer);
        let mut changes = Vec::new();
        for frame in frames {
            changes.extend(self.ingest_frame(frame));
        }
        changes
    }

    /// Applies up to `max_updates_per_tick` queued updates, highest priority
    /// first and newest first within a priority.
    pub fn tick(&mut self) -> Vec<CacheChange> {
        if self.queue.is_empty() {
            return Vec::new();
        }
        self.queue.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.vehicle.last_update.cmp(&a.vehicle.last_update))
        });
        let take = self.config.max_updates_per_tick.max(1).min(self.queue.len());
        let due: Vec<QueuedUpdate> = self.queue.drain(..take).collect();

        let mut changes = Vec::new();
        for update in due {
            changes.extend(self.apply(update.vehicle));
        }
        changes
    }

    // ===== CACHE WRITES =====

    /// Writes a validated vehicle. Staleness is checked again here since the
    /// cache may have moved on while the update sat in the queue.
    pub fn apply(&mut self, vehicle: Vehicle) -> Vec<CacheChange> {
        let previous_status = match self.vehicles.get(&vehicle.id) {
            Some(existing) if vehicle.last_update < existing.last_update => {
                self.stats.stale += 1;
                return Vec::new();
            }
            Some(existing) => Some(existing.status),
            None => None,
        };

        let evicted = self.vehicles.insert(vehicle.clone());
        let mut changes = Vec::with_capacity(1 + evicted.len());
        // A full cache can push out the record that was just written.
        if evicted.iter().any(|gone| gone.id == vehicle.id) {
            debug!(vehicle_id = %vehicle.id, "Update older than every cached vehicle; not kept");
        } else {
            self.stats.applied += 1;
            changes.push(CacheChange::VehicleUpdated {
                vehicle,
                previous_status,
            });
        }
        for gone in evicted {
            self.stats.evicted += 1;
            debug!(vehicle_id = %gone.id, "Evicted least recently updated vehicle");
            changes.push(CacheChange::VehicleEvicted(gone.id));
        }
        changes
    }

    fn cache_alert(&mut self, alert: Alert) -> Option<CacheChange> {
        if self.alerts.get(&alert.id) == Some(&alert) {
            self.stats.duplicates += 1;
            return None;
        }
        self.stats.evicted += self.alerts.insert(alert.clone()).len() as u64;
        self.stats.applied += 1;
        Some(CacheChange::AlertCached(alert))
    }

    fn cache_violation(&mut self, violation: Violation) -> Option<CacheChange> {
        if self.violations.get(&violation.id) == Some(&violation) {
            self.stats.duplicates += 1;
            return None;
        }
        self.stats.evicted += self.violations.insert(violation.clone()).len() as u64;
        self.stats.applied += 1;
        Some(CacheChange::ViolationCached(violation))
    }

    fn cache_route(&mut self, route: Route) -> Option<CacheChange> {
        if let Some(existing) = self.routes.get(&route.id) {
            if route.updated_at < existing.updated_at {
                self.stats.stale += 1;
                return None;
            }
            if *existing == route {
                self.stats.duplicates += 1;
                return None;
            }
        }
        self.stats.evicted += self.routes.insert(route.clone()).len() as u64;
        self.stats.applied += 1;
        Some(CacheChange::RouteCached(route))
    }

    /// Caches a violation raised locally by the geofence engine.
    pub fn record_violation(&mut self, violation: Violation) -> Option<CacheChange> {
        self.cache_violation(violation)
    }

    pub fn resolve_violation(&mut self, id: &str, at: DateTime<Utc>) -> Option<CacheChange> {
        let violation = self.violations.get_mut(id)?;
        if violation.resolved {
            return None;
        }
        violation.resolve(at);
        Some(CacheChange::ViolationCached(violation.clone()))
    }

    pub fn remove_vehicle(&mut self, id: &str) -> Option<Vehicle> {
        self.queue.retain(|q| q.vehicle.id != id);
        self.vehicles.remove(id)
    }

    /// Seeds the caches from persisted state. Nothing is counted or reported.
    pub fn restore(
        &mut self,
        vehicles: Vec<Vehicle>,
        alerts: Vec<Alert>,
        violations: Vec<Violation>,
        routes: Vec<Route>,
    ) {
        for vehicle in vehicles {
            self.vehicles.insert(vehicle);
        }
        for alert in alerts {
            self.alerts.insert(alert);
        }
        for violation in violations {
            self.violations.insert(violation);
        }
        for route in routes {
            self.routes.insert(route);
        }
    }

    // ===== SNAPSHOTS =====

    pub fn vehicle(&self, id: &str) -> Option<Vehicle> {
        self.vehicles.get(id).cloned()
    }

    pub fn vehicles(&self) -> Vec<Vehicle> {
        self.vehicles.snapshot()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.snapshot()
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.violations.snapshot()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes.snapshot()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Position;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn update(id: &str, lat: f64, lon: f64, speed: f64, status: &str, secs: i64) -> InboundFrame {
        InboundFrame::new(
            MessageKind::VehicleUpdate,
            json!({
                "id": id,
                "status": status,
                "position": {
                    "latitude": lat,
                    "longitude": lon,
                    "speed": speed,
                    "timestamp": ts(secs).to_rfc3339(),
                }
            }),
        )
    }

    fn processor() -> MessageProcessor {
        MessageProcessor::new(ProcessorConfig::default())
    }

    #[test]
    fn test_newer_update_wins_in_either_order() {
        let a = update("truck-1", 40.0, -74.0, 10.0, "active", 0);
        let b = update("truck-1", 40.1, -74.0, 10.0, "active", 30);

        let mut forward = processor();
        forward.ingest(a.clone()).unwrap();
        forward.ingest(b.clone()).unwrap();
        forward.tick();

        let mut reverse = processor();
        reverse.ingest(b).unwrap();
        reverse.ingest(a).unwrap();
        reverse.tick();

        for p in [&forward, &reverse] {
            let vehicle = p.vehicle("truck-1").unwrap();
            assert_eq!(vehicle.last_update, ts(30));
            assert_eq!(vehicle.position.latitude, 40.1);
        }
        assert_eq!(reverse.stats().stale, 1);
    }

    #[test]
    fn test_rejects_invalid_events() {
        let mut p = processor();
        assert!(p.ingest(update("truck-1", 91.0, 0.0, 0.0, "active", 0)).is_err());
        assert!(p.ingest(update("truck-1", 0.0, 0.0, 0.0, "parked", 0)).is_err());
        assert!(p
            .ingest(InboundFrame::new(MessageKind::VehicleUpdate, json!({"id": "x"})))
            .is_err());
        assert!(p
            .ingest(InboundFrame::new(MessageKind::Other("chat".into()), json!({})))
            .is_err());
        assert_eq!(p.stats().rejected, 4);
        assert!(p.vehicles().is_empty());
    }

    #[test]
    fn test_first_sighting_is_high_priority_and_applies_immediately() {
        let mut p = processor();
        let changes = p.ingest(update("truck-1", 40.0, -74.0, 0.0, "active", 0)).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(matches!(
            &changes[0],
            CacheChange::VehicleUpdated { previous_status: None, .. }
        ));
        assert_eq!(p.queued_len(), 0);
    }

    #[test]
    fn test_priority_classification() {
        let mut p = processor();
        p.ingest(update("truck-1", 40.0, -74.0, 0.0, "active", 0)).unwrap();

        let cached_status = |status: VehicleStatus, speed: f64| {
            Vehicle::new(
                "truck-1",
                Position::new(40.0, -74.0, ts(10)).with_speed(speed),
                status,
            )
        };
        assert_eq!(
            p.priority_for(&cached_status(VehicleStatus::Maintenance, 0.0)),
            UpdatePriority::High
        );
        assert_eq!(
            p.priority_for(&cached_status(VehicleStatus::Active, 120.0)),
            UpdatePriority::High
        );
        assert_eq!(
            p.priority_for(&cached_status(VehicleStatus::Active, 30.0)),
            UpdatePriority::Medium
        );
        assert_eq!(
            p.priority_for(&cached_status(VehicleStatus::Active, 0.0)),
            UpdatePriority::Low
        );
    }

    #[test]
    fn test_status_change_bypasses_queue() {
        let mut p = processor();
        p.ingest(update("truck-1", 40.0, -74.0, 0.0, "active", 0)).unwrap();
        let changes = p
            .ingest(update("truck-1", 40.0, -74.0, 0.0, "offline", 5))
            .unwrap();
        assert!(matches!(
            &changes[0],
            CacheChange::VehicleUpdated { previous_status: Some(VehicleStatus::Active), vehicle }
                if vehicle.status == VehicleStatus::Offline
        ));
    }

    #[test]
    fn test_throttles_small_quick_moves() {
        let mut p = processor();
        p.ingest(update("truck-1", 40.0, -74.0, 10.0, "active", 0)).unwrap();
        // Same spot, same second.
        let quick = InboundFrame::new(
            MessageKind::VehicleUpdate,
            json!({
                "id": "truck-1",
                "status": "active",
                "position": {
                    "latitude": 40.00001,
                    "longitude": -74.0,
                    "speed": 10.0,
                    "timestamp": (ts(0) + Duration::milliseconds(200)).to_rfc3339(),
                }
            }),
        );
        assert!(p.ingest(quick).unwrap().is_empty());
        assert_eq!(p.stats().throttled, 1);
        assert_eq!(p.queued_len(), 0);

        // Far enough away, so it queues even inside the window.
        p.ingest(update("truck-1", 40.01, -74.0, 10.0, "active", 0)).unwrap();
        assert_eq!(p.queued_len(), 1);
    }

    #[test]
    fn test_tick_caps_and_orders() {
        let config = ProcessorConfig {
            max_updates_per_tick: 2,
            ..Default::default()
        };
        let mut p = MessageProcessor::new(config);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            p.ingest(update(id, 10.0, 10.0, 0.0, "active", i as i64)).unwrap();
        }
        // Moving (medium) beats stationary (low); newest first within a tier.
        p.ingest(update("a", 10.5, 10.0, 0.0, "active", 100)).unwrap();
        p.ingest(update("b", 10.5, 10.0, 20.0, "active", 50)).unwrap();
        p.ingest(update("c", 10.5, 10.0, 20.0, "active", 60)).unwrap();
        assert_eq!(p.queued_len(), 3);

        let first: Vec<String> = p
            .tick()
            .into_iter()
            .filter_map(|c| match c {
                CacheChange::VehicleUpdated { vehicle, .. } => Some(vehicle.id),
                _ => None,
            })
            .collect();
        assert_eq!(first, vec!["c", "b"]);
        assert_eq!(p.queued_len(), 1);
        assert_eq!(p.tick().len(), 1);
        assert_eq!(p.queued_len(), 0);
    }

    #[test]
    fn test_vehicle_cache_evicts_oldest_update() {
        let config = ProcessorConfig {
            max_vehicles: 3,
            ..Default::default()
        };
        let mut p = MessageProcessor::new(config);
        let mut evicted = Vec::new();
        for (id, secs) in [("v1", 40), ("v2", 10), ("v3", 30), ("v4", 50), ("v5", 20)] {
            for change in p.ingest(update(id, 1.0, 1.0, 0.0, "active", secs)).unwrap() {
                if let CacheChange::VehicleEvicted(gone) = change {
                    evicted.push(gone);
                }
            }
        }
        let mut ids: Vec<String> = p.vehicles().into_iter().map(|v| v.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["v1", "v3", "v4"]);
        evicted.sort();
        assert_eq!(evicted, vec!["v2", "v5"]);
        assert_eq!(p.stats().evicted, 2);
    }

    #[test]
    fn test_vehicle_evicted_on_arrival_is_not_announced() {
        let config = ProcessorConfig {
            max_vehicles: 2,
            ..Default::default()
        };
        let mut p = MessageProcessor::new(config);
        p.ingest(update("v1", 1.0, 1.0, 0.0, "active", 40)).unwrap();
        p.ingest(update("v2", 1.0, 1.0, 0.0, "active", 30)).unwrap();

        let changes = p.ingest(update("v3", 1.0, 1.0, 0.0, "active", 10)).unwrap();

        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes[0], CacheChange::VehicleEvicted(id) if id == "v3"));
        assert!(p.vehicle("v3").is_none());
        assert_eq!(p.stats().applied, 2);
        assert_eq!(p.stats().evicted, 1);
    }

    #[test]
    fn test_batch_buffer_and_split() {
        let config = ProcessorConfig {
            batch_size: 2,
            ..Default::default()
        };
        let mut p = MessageProcessor::new(config);
        let batch = InboundFrame::new(
            MessageKind::Batch,
            json!([
                {"type": "alert", "data": {"id": "a1", "severity": "high", "message": "Door open", "createdAt": ts(0).to_rfc3339()}},
                {"type": "alert", "data": {"id": "a2", "severity": "bogus", "message": "x", "createdAt": ts(0).to_rfc3339()}},
                {"type": "route_update", "data": {"id": "r1", "vehicleId": "truck-1", "updatedAt": ts(0).to_rfc3339()}}
            ]),
        );
        assert!(!p.buffer(batch));
        assert!(p.buffer(update("truck-1", 1.0, 1.0, 0.0, "active", 0)));

        let changes = p.flush_buffer();
        assert_eq!(changes.len(), 3);
        assert_eq!(p.buffered_len(), 0);
        let stats = p.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(p.alerts().len(), 1);
        assert_eq!(p.routes().len(), 1);
    }

    #[test]
    fn test_duplicate_alert_is_ignored() {
        let mut p = processor();
        let alert = InboundFrame::new(
            MessageKind::Alert,
            json!({"id": "a1", "severity": "low", "message": "Tire pressure", "timestamp": ts(0).to_rfc3339()}),
        );
        assert_eq!(p.ingest(alert.clone()).unwrap().len(), 1);
        assert!(p.ingest(alert).unwrap().is_empty());
        assert_eq!(p.stats().duplicates, 1);
    }

    #[test]
    fn test_resolve_violation_once() {
        let mut p = processor();
        let violation = Violation {
            id: "v1".to_string(),
            vehicle_id: "truck-1".to_string(),
            geofence_id: "g1".to_string(),
            kind: crate::models::ViolationKind::Entry,
            timestamp: ts(0),
            position: Position::new(1.0, 1.0, ts(0)),
            distance_to_boundary: 5.0,
            severity: crate::models::Severity::High,
            resolved: false,
            resolved_at: None,
        };
        assert!(p.record_violation(violation).is_some());
        assert!(p.resolve_violation("v1", ts(5)).is_some());
        assert!(p.resolve_violation("v1", ts(6)).is_none());
        assert_eq!(p.violations()[0].resolved_at, Some(ts(5)));
        assert!(p.resolve_violation("missing", ts(6)).is_none());
    }
}
