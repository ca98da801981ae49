//! Geofence containment and crossing detection.
//!
//! Containment is evaluated per (vehicle, geofence) pair and compared against
//! the pair's previous sample. Only a change between two consecutive samples
//! can produce a violation; the first sample of a pair is a baseline.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::config::GeofenceConfig;
use crate::models::{
    Coordinate, Geofence, GeofenceGeometry, GeofenceKind, Severity, Vehicle, Violation,
    ViolationKind,
};

pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Great-circle distance in meters (haversine, spherical earth).
pub fn haversine_distance(a: &Coordinate, b: &Coordinate) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_METERS * c
}

/// Even-odd ray casting over a (longitude, latitude) ring.
pub fn point_in_polygon(point: &Coordinate, ring: &[Coordinate]) -> bool {
    if ring.len() < 3 {
        return false;
    }
    let (x, y) = (point.longitude, point.latitude);
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (xi, yi) = (ring[i].longitude, ring[i].latitude);
        let (xj, yj) = (ring[j].longitude, ring[j].latitude);
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

pub fn contains(geometry: &GeofenceGeometry, point: &Coordinate) -> bool {
    match geometry {
        GeofenceGeometry::Circle { center, radius } => haversine_distance(point, center) <= *radius,
        GeofenceGeometry::Polygon { coordinates } => point_in_polygon(point, coordinates),
    }
}

/// Distance in meters from `point` to the nearest point of the geometry's boundary.
pub fn distance_to_boundary(geometry: &GeofenceGeometry, point: &Coordinate) -> f64 {
    match geometry {
        GeofenceGeometry::Circle { center, radius } => {
            (haversine_distance(point, center) - radius).abs()
        }
        GeofenceGeometry::Polygon { coordinates } => {
            if coordinates.is_empty() {
                return f64::INFINITY;
            }
            let projected: Vec<(f64, f64)> =
                coordinates.iter().map(|v| project(point, v)).collect();
            let mut best = f64::INFINITY;
            for i in 0..projected.len() {
                let a = projected[i];
                let b = projected[(i + 1) % projected.len()];
                best = best.min(origin_to_segment(a, b));
            }
            best
        }
    }
}

// Equirectangular projection in meters, centered on `origin`.
fn project(origin: &Coordinate, p: &Coordinate) -> (f64, f64) {
    let x = (p.longitude - origin.longitude).to_radians()
        * origin.latitude.to_radians().cos()
        * EARTH_RADIUS_METERS;
    let y = (p.latitude - origin.latitude).to_radians() * EARTH_RADIUS_METERS;
    (x, y)
}

fn origin_to_segment(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len_sq = dx * dx + dy * dy;
    if len_sq == 0.0 {
        return a.0.hypot(a.1);
    }
    let t = (-(a.0 * dx + a.1 * dy) / len_sq).clamp(0.0, 1.0);
    (a.0 + t * dx).hypot(a.1 + t * dy)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainmentSample {
    pub inside: bool,
    pub timestamp: DateTime<Utc>,
}

/// Bounded history of containment samples for one (vehicle, geofence) pair.
#[derive(Debug, Clone, Default)]
pub struct ContainmentState {
    samples: VecDeque<ContainmentSample>,
}

impl ContainmentState {
    pub fn last(&self) -> Option<&ContainmentSample> {
        self.samples.back()
    }

    pub fn push(&mut self, sample: ContainmentSample, capacity: usize) {
        self.samples.push_back(sample);
        while self.samples.len() > capacity.max(1) {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> Vec<ContainmentSample> {
        self.samples.iter().copied().collect()
    }
}

type PairKey = (String, String);

pub struct GeofenceEngine {
    config: GeofenceConfig,
    history: HashMap<PairKey, ContainmentState>,
}

impl GeofenceEngine {
    pub fn new(config: GeofenceConfig) -> Self {
        Self {
            config,
            history: HashMap::new(),
        }
    }

    pub fn evaluate(&self, vehicle: &Vehicle, geofence: &Geofence) -> bool {
        contains(&geofence.geometry, &vehicle.position.coordinate())
    }

    /// Evaluates every (vehicle, active geofence) pair and returns the
    /// violations raised by this pass.
    pub fn check_violations(&mut self, vehicles: &[Vehicle], geofences: &[Geofence]) -> Vec<Violation> {
        let mut violations = Vec::new();
        for vehicle in vehicles {
            for geofence in geofences.iter().filter(|g| g.active) {
                if let Some(violation) = self.observe(vehicle, geofence) {
                    violations.push(violation);
                }
            }
        }
        violations
    }

    /// Records one containment observation for the pair and classifies the
    /// transition from the previous one.
    pub fn observe(&mut self, vehicle: &Vehicle, geofence: &Geofence) -> Option<Violation> {
        let point = vehicle.position.coordinate();
        let inside = contains(&geofence.geometry, &point);
        let capacity = self.config.history_size;

        let state = self
            .history
            .entry((vehicle.id.clone(), geofence.id.clone()))
            .or_default();
        let previous = state.last().map(|s| s.inside);
        state.push(
            ContainmentSample {
                inside,
                timestamp: vehicle.position.timestamp,
            },
            capacity,
        );

        let kind = match (previous, inside, geofence.kind) {
            (Some(true), false, GeofenceKind::Inclusion) => ViolationKind::Exit,
            (Some(false), true, GeofenceKind::Exclusion) => ViolationKind::Entry,
            _ => return None,
        };

        let distance = distance_to_boundary(&geofence.geometry, &point);
        let severity = if distance <= self.config.violation_threshold_meters {
            Severity::High
        } else {
            Severity::Medium
        };

        debug!(
            vehicle_id = %vehicle.id,
            geofence_id = %geofence.id,
            kind = ?kind,
            distance_m = distance,
            "Geofence violation detected"
        );

        Some(Violation {
            id: uuid::Uuid::new_v4().to_string(),
            vehicle_id: vehicle.id.clone(),
            geofence_id: geofence.id.clone(),
            kind,
            timestamp: vehicle.position.timestamp,
            position: vehicle.position.clone(),
            distance_to_boundary: distance,
            severity,
            resolved: false,
            resolved_at: None,
        })
    }

    pub fn history(&self, vehicle_id: &str, geofence_id: &str) -> Option<&ContainmentState> {
        self.history
            .get(&(vehicle_id.to_string(), geofence_id.to_string()))
    }

    pub fn tracked_pairs(&self) -> usize {
        self.history.len()
    }

    pub fn remove_vehicle(&mut self, vehicle_id: &str) {
        self.history.retain(|(v, _), _| v != vehicle_id);
    }

    pub fn remove_geofence(&mut self, geofence_id: &str) {
        self.history.retain(|(_, g), _| g != geofence_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Position, VehicleStatus};
    use chrono::{Duration, TimeZone};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn vehicle_at(lat: f64, lon: f64, secs: i64) -> Vehicle {
        Vehicle::new(
            "truck-1",
            Position::new(lat, lon, ts(secs)),
            VehicleStatus::Active,
        )
    }

    fn unit_square() -> Vec<Coordinate> {
        vec![
            Coordinate::new(0.0, 0.0),
            Coordinate::new(0.0, 1.0),
            Coordinate::new(1.0, 1.0),
            Coordinate::new(1.0, 0.0),
        ]
    }

    #[test]
    fn test_haversine_known_distance() {
        // New York to London.
        let nyc = Coordinate::new(40.7128, -74.0060);
        let london = Coordinate::new(51.5074, -0.1278);
        let d = haversine_distance(&nyc, &london);
        assert!((d - 5_570_222.0).abs() < 1_000.0, "got {}", d);
    }

    #[test]
    fn test_haversine_one_degree_of_latitude() {
        let d = haversine_distance(&Coordinate::new(0.0, 0.0), &Coordinate::new(1.0, 0.0));
        let expected = EARTH_RADIUS_METERS * 1.0_f64.to_radians();
        assert!((d - expected).abs() < 1e-6);
    }

    #[test]
    fn test_haversine_zero_and_symmetric() {
        let a = Coordinate::new(12.5, 45.25);
        let b = Coordinate::new(-3.0, 100.0);
        assert_eq!(haversine_distance(&a, &a), 0.0);
        assert!((haversine_distance(&a, &b) - haversine_distance(&b, &a)).abs() < 1e-9);
    }

    #[test]
    fn test_point_in_polygon() {
        let square = unit_square();
        assert!(point_in_polygon(&Coordinate::new(0.5, 0.5), &square));
        assert!(!point_in_polygon(&Coordinate::new(1.5, 0.5), &square));
        assert!(!point_in_polygon(&Coordinate::new(0.5, -0.1), &square));
        assert!(!point_in_polygon(&Coordinate::new(0.5, 0.5), &square[..2]));
    }

    #[test]
    fn test_point_in_concave_polygon() {
        // U shape opening north.
        let ring = vec![
            Coordinate::new(0.0, 0.0),
            Coordinate::new(0.0, 3.0),
            Coordinate::new(3.0, 3.0),
            Coordinate::new(3.0, 2.0),
            Coordinate::new(1.0, 2.0),
            Coordinate::new(1.0, 1.0),
            Coordinate::new(3.0, 1.0),
            Coordinate::new(3.0, 0.0),
        ];
        assert!(point_in_polygon(&Coordinate::new(2.0, 0.5), &ring));
        assert!(!point_in_polygon(&Coordinate::new(2.0, 1.5), &ring));
        assert!(point_in_polygon(&Coordinate::new(2.0, 2.5), &ring));
    }

    #[test]
    fn test_distance_to_circle_boundary() {
        let center = Coordinate::new(40.7128, -74.0060);
        let geometry = GeofenceGeometry::Circle {
            center,
            radius: 1000.0,
        };
        assert!((distance_to_boundary(&geometry, &center) - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_distance_to_polygon_edge() {
        let geometry = GeofenceGeometry::Polygon {
            coordinates: unit_square(),
        };
        let d = distance_to_boundary(&geometry, &Coordinate::new(0.5, 0.001));
        // ~111 m from the western edge.
        assert!((d - 111.0).abs() < 2.0, "got {}", d);
    }

    #[test]
    fn test_first_observation_is_baseline() {
        let mut engine = GeofenceEngine::new(GeofenceConfig::default());
        let fence = Geofence::polygon("yard", GeofenceKind::Exclusion, unit_square());
        assert!(engine.observe(&vehicle_at(0.5, 0.5, 0), &fence).is_none());
        assert_eq!(engine.history("truck-1", "yard").unwrap().len(), 1);
    }

    #[test]
    fn test_inclusion_exit_raises_violation() {
        let mut engine = GeofenceEngine::new(GeofenceConfig::default());
        let fence = Geofence::polygon("depot", GeofenceKind::Inclusion, unit_square());
        assert!(engine.observe(&vehicle_at(0.5, 0.5, 0), &fence).is_none());
        let violation = engine.observe(&vehicle_at(0.5, 1.0005, 10), &fence).unwrap();
        assert_eq!(violation.kind, ViolationKind::Exit);
        assert_eq!(violation.severity, Severity::High);
        assert_eq!(violation.timestamp, ts(10));
        // Re-entering an inclusion zone is not a violation.
        assert!(engine.observe(&vehicle_at(0.5, 0.5, 20), &fence).is_none());
    }

    #[test]
    fn test_far_crossing_is_medium_severity() {
        let mut engine = GeofenceEngine::new(GeofenceConfig::default());
        let fence = Geofence::polygon("depot", GeofenceKind::Inclusion, unit_square());
        engine.observe(&vehicle_at(0.5, 0.5, 0), &fence);
        let violation = engine.observe(&vehicle_at(0.5, 2.0, 10), &fence).unwrap();
        assert_eq!(violation.severity, Severity::Medium);
        assert!(violation.distance_to_boundary > 100_000.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let config = GeofenceConfig {
            history_size: 3,
            ..Default::default()
        };
        let mut engine = GeofenceEngine::new(config);
        let fence = Geofence::polygon("depot", GeofenceKind::Inclusion, unit_square());
        for i in 0..10 {
            engine.observe(&vehicle_at(0.5, 0.5, i), &fence);
        }
        let history = engine.history("truck-1", "depot").unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history.samples()[0].timestamp, ts(7));
    }

    #[test]
    fn test_inactive_geofences_are_skipped() {
        let mut engine = GeofenceEngine::new(GeofenceConfig::default());
        let mut fence = Geofence::polygon("depot", GeofenceKind::Inclusion, unit_square());
        fence.active = false;
        let violations = engine.check_violations(&[vehicle_at(0.5, 0.5, 0)], &[fence]);
        assert!(violations.is_empty());
        assert_eq!(engine.tracked_pairs(), 0);
    }

    #[test]
    fn test_removal_purges_history() {
        let mut engine = GeofenceEngine::new(GeofenceConfig::default());
        let a = Geofence::polygon("a", GeofenceKind::Inclusion, unit_square());
        let b = Geofence::polygon("b", GeofenceKind::Exclusion, unit_square());
        engine.check_violations(&[vehicle_at(0.5, 0.5, 0)], &[a, b]);
        assert_eq!(engine.tracked_pairs(), 2);
        engine.remove_geofence("a");
        assert_eq!(engine.tracked_pairs(), 1);
        engine.remove_vehicle("truck-1");
        assert_eq!(engine.tracked_pairs(), 0);
    }
}
