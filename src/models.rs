use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FleetError, FleetResult};

// ===== TRAITS =====

/// A record that lives in one of the bounded caches.
///
/// The timestamp is what eviction and staleness checks compare; the id is the
/// cache key.
pub trait CacheRecord {
    fn record_id(&self) -> &str;
    fn record_timestamp(&self) -> DateTime<Utc>;
}

// ===== ENUMS =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleStatus {
    Active,
    Inactive,
    Maintenance,
    Offline,
}

impl VehicleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleStatus::Active => "active",
            VehicleStatus::Inactive => "inactive",
            VehicleStatus::Maintenance => "maintenance",
            VehicleStatus::Offline => "offline",
        }
    }
}

impl TryFrom<&str> for VehicleStatus {
    type Error = FleetError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "active" => Ok(VehicleStatus::Active),
            "inactive" => Ok(VehicleStatus::Inactive),
            "maintenance" => Ok(VehicleStatus::Maintenance),
            "offline" => Ok(VehicleStatus::Offline),
            other => Err(FleetError::Validation(format!(
                "unknown vehicle status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeofenceKind {
    /// Vehicles are required to stay inside; leaving is a violation.
    Inclusion,
    /// Vehicles are restricted from entering; entering is a violation.
    Exclusion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationKind {
    Entry,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncItemKind {
    Vehicle,
    Alert,
    Violation,
    Route,
}

impl SyncItemKind {
    /// REST collection name for this kind of record.
    pub fn collection(&self) -> &'static str {
        match self {
            SyncItemKind::Vehicle => "vehicles",
            SyncItemKind::Alert => "alerts",
            SyncItemKind::Violation => "violations",
            SyncItemKind::Route => "routes",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    Timestamp,
    Version,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Remote state wins.
    Server,
    /// Local state wins.
    Client,
    /// Whichever side carries the later timestamp wins.
    Timestamp,
}

impl TryFrom<&str> for ConflictStrategy {
    type Error = FleetError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "server" => Ok(ConflictStrategy::Server),
            "client" => Ok(ConflictStrategy::Client),
            "timestamp" => Ok(ConflictStrategy::Timestamp),
            other => Err(FleetError::Validation(format!(
                "unknown conflict strategy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictWinner {
    Local,
    Remote,
}

// ===== GEOMETRY =====

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn validate(&self) -> FleetResult<()> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(FleetError::Validation(format!(
                "latitude {} outside [-90, 90]",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(FleetError::Validation(format!(
                "longitude {} outside [-180, 180]",
                self.longitude
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GeofenceGeometry {
    /// Vertex ring, ordered; the closing vertex may be omitted.
    Polygon { coordinates: Vec<Coordinate> },
    /// Radius in meters.
    Circle { center: Coordinate, radius: f64 },
}

// ===== DATA STRUCTURES =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default)]
    pub heading: f64,
    #[serde(default)]
    pub speed: f64,
    pub timestamp: DateTime<Utc>,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: 0.0,
            heading: 0.0,
            speed: 0.0,
            timestamp,
        }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    pub fn validate(&self) -> FleetResult<()> {
        self.coordinate().validate()?;
        if !self.speed.is_finite() || self.speed < 0.0 {
            return Err(FleetError::Validation(format!(
                "speed {} must be a non-negative number",
                self.speed
            )));
        }
        if !self.accuracy.is_finite() || self.accuracy < 0.0 {
            return Err(FleetError::Validation(format!(
                "accuracy {} must be a non-negative number",
                self.accuracy
            )));
        }
        if !self.heading.is_finite() {
            return Err(FleetError::Validation("heading must be finite".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    pub position: Position,
    pub status: VehicleStatus,
    pub last_update: DateTime<Utc>,
}

impl Vehicle {
    pub fn new(id: impl Into<String>, position: Position, status: VehicleStatus) -> Self {
        let last_update = position.timestamp;
        Self {
            id: id.into(),
            name: None,
            driver_id: None,
            position,
            status,
            last_update,
        }
    }

    pub fn is_moving(&self) -> bool {
        self.position.speed > 0.0
    }
}

impl CacheRecord for Vehicle {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn record_timestamp(&self) -> DateTime<Utc> {
        self.last_update
    }
}

/// Wire shape of a `vehicle_update` event. `lastUpdate` is optional on the wire
/// and falls back to the position timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleUpdate {
    #[serde(alias = "vehicleId")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub driver_id: Option<String>,
    pub position: Position,
    pub status: VehicleStatus,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
}

impl VehicleUpdate {
    pub fn into_vehicle(self) -> FleetResult<Vehicle> {
        if self.id.trim().is_empty() {
            return Err(FleetError::Validation("vehicle id is empty".to_string()));
        }
        self.position.validate()?;
        let last_update = self.last_update.unwrap_or(self.position.timestamp);
        Ok(Vehicle {
            id: self.id,
            name: self.name,
            driver_id: self.driver_id,
            position: self.position,
            status: self.status,
            last_update,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geofence {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub geometry: GeofenceGeometry,
    #[serde(rename = "type")]
    pub kind: GeofenceKind,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl Geofence {
    pub fn circle(
        id: impl Into<String>,
        kind: GeofenceKind,
        center: Coordinate,
        radius: f64,
    ) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            geometry: GeofenceGeometry::Circle { center, radius },
            kind,
            active: true,
        }
    }

    pub fn polygon(id: impl Into<String>, kind: GeofenceKind, coordinates: Vec<Coordinate>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            geometry: GeofenceGeometry::Polygon { coordinates },
            kind,
            active: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn validate(&self) -> FleetResult<()> {
        if self.id.trim().is_empty() {
            return Err(FleetError::Validation("geofence id is empty".to_string()));
        }
        match &self.geometry {
            GeofenceGeometry::Circle { center, radius } => {
                center.validate()?;
                if !radius.is_finite() || *radius <= 0.0 {
                    return Err(FleetError::Validation(format!(
                        "geofence {} has invalid radius {}",
                        self.id, radius
                    )));
                }
            }
            GeofenceGeometry::Polygon { coordinates } => {
                if coordinates.len() < 3 {
                    return Err(FleetError::Validation(format!(
                        "geofence {} polygon needs at least 3 vertices, got {}",
                        self.id,
                        coordinates.len()
                    )));
                }
                for vertex in coordinates {
                    vertex.validate()?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub id: String,
    pub vehicle_id: String,
    pub geofence_id: String,
    #[serde(rename = "type")]
    pub kind: ViolationKind,
    pub timestamp: DateTime<Utc>,
    pub position: Position,
    pub distance_to_boundary: f64,
    pub severity: Severity,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Violation {
    pub fn resolve(&mut self, at: DateTime<Utc>) {
        if !self.resolved {
            self.resolved = true;
            self.resolved_at = Some(at);
        }
    }

    pub fn validate(&self) -> FleetResult<()> {
        if self.id.is_empty() || self.vehicle_id.is_empty() || self.geofence_id.is_empty() {
            return Err(FleetError::Validation(
                "violation requires id, vehicleId and geofenceId".to_string(),
            ));
        }
        self.position.validate()
    }
}

impl CacheRecord for Violation {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn record_timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertSource {
    Violation {
        violation_id: String,
    },
    StatusChange {
        vehicle_id: String,
        from: VehicleStatus,
        to: VehicleStatus,
    },
    /// Raised upstream and delivered over the stream.
    #[default]
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    #[serde(default)]
    pub source: AlertSource,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub read: bool,
    #[serde(alias = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        id: impl Into<String>,
        source: AlertSource,
        severity: Severity,
        message: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            vehicle_id: None,
            source,
            severity,
            message: message.into(),
            read: false,
            created_at,
        }
    }

    pub fn with_vehicle(mut self, vehicle_id: impl Into<String>) -> Self {
        self.vehicle_id = Some(vehicle_id.into());
        self
    }

    pub fn validate(&self) -> FleetResult<()> {
        if self.id.trim().is_empty() {
            return Err(FleetError::Validation("alert id is empty".to_string()));
        }
        if self.message.trim().is_empty() {
            return Err(FleetError::Validation(format!(
                "alert {} has an empty message",
                self.id
            )));
        }
        Ok(())
    }
}

impl CacheRecord for Alert {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn record_timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: String,
    pub vehicle_id: String,
    #[serde(default)]
    pub waypoints: Vec<Coordinate>,
    #[serde(alias = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl Route {
    pub fn validate(&self) -> FleetResult<()> {
        if self.id.trim().is_empty() || self.vehicle_id.trim().is_empty() {
            return Err(FleetError::Validation(
                "route requires id and vehicleId".to_string(),
            ));
        }
        for waypoint in &self.waypoints {
            waypoint.validate()?;
        }
        Ok(())
    }
}

impl CacheRecord for Route {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn record_timestamp(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub since: DateTime<Utc>,
}

impl ConnectionStatus {
    pub fn new(state: ConnectionState, since: DateTime<Utc>) -> Self {
        Self { state, since }
    }
}

// ===== SYNC TYPES =====

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    #[default]
    Upsert,
    /// The record was removed locally; the payload only carries its id.
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSyncItem {
    /// Monotonic sequence number assigned at enqueue time.
    pub id: u64,
    pub kind: SyncItemKind,
    #[serde(default)]
    pub operation: SyncOperation,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingSyncItem {
    /// Id of the record carried in the payload, if any.
    pub fn record_id(&self) -> Option<&str> {
        self.payload.get("id").and_then(Value::as_str)
    }

    /// Optimistic-concurrency version carried in the payload, if any.
    pub fn version(&self) -> Option<u64> {
        self.payload.get("version").and_then(Value::as_u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictItem {
    pub item_id: u64,
    pub item_kind: SyncItemKind,
    pub kind: ConflictKind,
    pub local: Value,
    pub remote: Value,
    pub winner: ConflictWinner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub item_id: u64,
    pub message: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub synced_count: usize,
    pub conflicts: Vec<ConflictItem>,
    pub errors: Vec<SyncFailure>,
}

impl SyncResult {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}
