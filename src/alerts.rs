use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::AlertConfig;
use crate::models::{Alert, AlertSource, Severity, VehicleStatus, Violation, ViolationKind};

/// Delivery channel for user-facing notifications.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, alert: &Alert);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn deliver(&self, alert: &Alert) {
        match alert.severity {
            Severity::High | Severity::Critical => warn!(
                alert_id = %alert.id,
                severity = ?alert.severity,
                vehicle_id = ?alert.vehicle_id,
                "{}",
                alert.message
            ),
            _ => info!(
                alert_id = %alert.id,
                severity = ?alert.severity,
                vehicle_id = ?alert.vehicle_id,
                "{}",
                alert.message
            ),
        }
    }
}

struct AlertBook {
    order: VecDeque<String>,
    alerts: HashMap<String, Alert>,
    timers: HashMap<String, CancellationToken>,
    last_notified: HashMap<String, Instant>,
    auto_read: mpsc::UnboundedSender<Alert>,
}

impl AlertBook {
    fn cancel_timer(&mut self, id: &str) {
        if let Some(token) = self.timers.remove(id) {
            token.cancel();
        }
    }

    fn cancel_all_timers(&mut self) {
        for (_, token) in self.timers.drain() {
            token.cancel();
        }
    }
}

pub struct AlertManager {
    config: AlertConfig,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    book: Arc<Mutex<AlertBook>>,
    auto_read_events: Mutex<Option<mpsc::UnboundedReceiver<Alert>>>,
}

impl AlertManager {
    pub fn new(config: AlertConfig, sink: Arc<dyn NotificationSink>, clock: Arc<dyn Clock>) -> Self {
        let (auto_read, auto_read_events) = mpsc::unbounded_channel();
        Self {
            config,
            sink,
            clock,
            book: Arc::new(Mutex::new(AlertBook {
                order: VecDeque::new(),
                alerts: HashMap::new(),
                timers: HashMap::new(),
                last_notified: HashMap::new(),
                auto_read,
            })),
            auto_read_events: Mutex::new(Some(auto_read_events)),
        }
    }

    /// Alerts marked read by their auto-read timer, as they change. Can be
    /// taken once.
    pub fn take_auto_read_events(&self) -> Option<mpsc::UnboundedReceiver<Alert>> {
        self.auto_read_events.lock().take()
    }

    /// Stores the alert unless one with the same id exists. Returns whether it
    /// was stored. Notification is rate-limited per source; storage is not.
    pub fn add_alert(&self, alert: Alert) -> bool {
        let notify = {
            let mut book = self.book.lock();
            if book.alerts.contains_key(&alert.id) {
                return false;
            }

            book.order.push_back(alert.id.clone());
            book.alerts.insert(alert.id.clone(), alert.clone());
            while book.order.len() > self.config.max_alerts.max(1) {
                if let Some(oldest) = book.order.pop_front() {
                    book.alerts.remove(&oldest);
                    book.cancel_timer(&oldest);
                    debug!(alert_id = %oldest, "Evicted oldest alert");
                }
            }

            if !alert.read {
                if let Some(delay) = self.config.auto_mark_read_after {
                    self.schedule_auto_read(&mut book, &alert.id, delay);
                }
            }

            let key = source_key(&alert);
            let now = Instant::now();
            let cooldown = self.config.notification_cooldown;
            book.last_notified
                .retain(|_, last| now.duration_since(*last) < cooldown);
            let cooled = book
                .last_notified
                .get(&key)
                .is_none();
            if cooled {
                book.last_notified.insert(key, now);
            }
            cooled
        };

        if notify {
            self.sink.deliver(&alert);
        } else {
            debug!(alert_id = %alert.id, "Notification suppressed by cooldown");
        }
        true
    }

    fn schedule_auto_read(&self, book: &mut AlertBook, id: &str, delay: std::time::Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(alert_id = %id, "No runtime; auto-read timer not scheduled");
            return;
        };
        let token = CancellationToken::new();
        book.timers.insert(id.to_string(), token.clone());

        let weak: Weak<Mutex<AlertBook>> = Arc::downgrade(&self.book);
        let id = id.to_string();
        handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(book) = weak.upgrade() {
                        let mut book = book.lock();
                        book.timers.remove(&id);
                        let changed = match book.alerts.get_mut(&id) {
                            Some(alert) if !alert.read => {
                                alert.read = true;
                                Some(alert.clone())
                            }
                            _ => None,
                        };
                        if let Some(alert) = changed {
                            // Nobody listening is fine.
                            let _ = book.auto_read.send(alert);
                        }
                    }
                }
            }
        });
    }

    pub fn mark_as_read(&self, id: &str) -> bool {
        let mut book = self.book.lock();
        book.cancel_timer(id);
        match book.alerts.get_mut(id) {
            Some(alert) if !alert.read => {
                alert.read = true;
                true
            }
            _ => false,
        }
    }

    /// Returns the alerts that changed, oldest first.
    pub fn mark_all_as_read(&self) -> Vec<Alert> {
        let mut book = self.book.lock();
        book.cancel_all_timers();
        let AlertBook { order, alerts, .. } = &mut *book;
        let mut changed = Vec::new();
        for id in order.iter() {
            if let Some(alert) = alerts.get_mut(id).filter(|a| !a.read) {
                alert.read = true;
                changed.push(alert.clone());
            }
        }
        changed
    }

    pub fn delete_alert(&self, id: &str) -> Option<Alert> {
        let mut book = self.book.lock();
        book.cancel_timer(id);
        book.order.retain(|existing| existing != id);
        book.alerts.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Alert> {
        self.book.lock().alerts.get(id).cloned()
    }

    /// Newest first.
    pub fn alerts(&self) -> Vec<Alert> {
        let book = self.book.lock();
        book.order
            .iter()
            .rev()
            .filter_map(|id| book.alerts.get(id).cloned())
            .collect()
    }

    pub fn unread_count(&self) -> usize {
        self.book.lock().alerts.values().filter(|a| !a.read).count()
    }

    pub fn len(&self) -> usize {
        self.book.lock().alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Restores alerts without notifying.
    pub fn restore(&self, alerts: Vec<Alert>) {
        let mut ordered = alerts;
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let mut book = self.book.lock();
        for alert in ordered {
            if book.alerts.contains_key(&alert.id) {
                continue;
            }
            book.order.push_back(alert.id.clone());
            book.alerts.insert(alert.id.clone(), alert);
        }
        while book.order.len() > self.config.max_alerts.max(1) {
            if let Some(oldest) = book.order.pop_front() {
                book.alerts.remove(&oldest);
            }
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Cancels every pending auto-read timer. Safe to call more than once.
    pub fn shutdown(&self) {
        self.book.lock().cancel_all_timers();
    }
}

impl Drop for AlertManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn source_key(alert: &Alert) -> String {
    let subject = alert.vehicle_id.as_deref().unwrap_or(&alert.id);
    match &alert.source {
        AlertSource::Violation { .. } => format!("violation:{}", subject),
        AlertSource::StatusChange { vehicle_id, .. } => format!("status:{}", vehicle_id),
        AlertSource::Remote => format!("remote:{}", subject),
    }
}

/// The same violation always yields the same alert id.
pub fn alert_from_violation(violation: &Violation, geofence_name: &str) -> Alert {
    let action = match violation.kind {
        ViolationKind::Entry => "entered restricted zone",
        ViolationKind::Exit => "left required zone",
    };
    let zone = if geofence_name.is_empty() {
        violation.geofence_id.as_str()
    } else {
        geofence_name
    };
    Alert::new(
        format!("violation:{}", violation.id),
        AlertSource::Violation {
            violation_id: violation.id.clone(),
        },
        violation.severity,
        format!(
            "Vehicle {} {} {} ({:.0} m from boundary)",
            violation.vehicle_id, action, zone, violation.distance_to_boundary
        ),
        violation.timestamp,
    )
    .with_vehicle(violation.vehicle_id.clone())
}

pub fn alert_from_status_change(
    vehicle_id: &str,
    from: VehicleStatus,
    to: VehicleStatus,
    at: DateTime<Utc>,
) -> Alert {
    let severity = match to {
        VehicleStatus::Offline => Severity::High,
        VehicleStatus::Maintenance => Severity::Medium,
        VehicleStatus::Active | VehicleStatus::Inactive => Severity::Low,
    };
    Alert::new(
        format!("status:{}:{}", vehicle_id, at.timestamp_millis()),
        AlertSource::StatusChange {
            vehicle_id: vehicle_id.to_string(),
            from,
            to,
        },
        severity,
        format!(
            "Vehicle {} changed status from {} to {}",
            vehicle_id,
            from.as_str(),
            to.as_str()
        ),
        at,
    )
    .with_vehicle(vehicle_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::Position;
    use chrono::TimeZone;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<String>>,
    }

    impl NotificationSink for RecordingSink {
        fn deliver(&self, alert: &Alert) {
            self.delivered.lock().push(alert.id.clone());
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn manager(config: AlertConfig) -> (AlertManager, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let clock = Arc::new(ManualClock::new(ts(0)));
        (AlertManager::new(config, sink.clone(), clock), sink)
    }

    fn alert(id: &str, vehicle: &str) -> Alert {
        Alert::new(id, AlertSource::Remote, Severity::Medium, "Harsh braking", ts(0))
            .with_vehicle(vehicle)
    }

    #[test]
    fn test_add_alert_is_idempotent() {
        let (alerts, sink) = manager(AlertConfig::default());
        assert!(alerts.add_alert(alert("a1", "truck-1")));
        assert!(!alerts.add_alert(alert("a1", "truck-1")));
        assert_eq!(alerts.len(), 1);
        assert_eq!(sink.delivered.lock().len(), 1);
    }

    #[test]
    fn test_cap_evicts_oldest_inserted() {
        let config = AlertConfig {
            max_alerts: 2,
            ..Default::default()
        };
        let (alerts, _) = manager(config);
        alerts.add_alert(alert("a1", "truck-1"));
        alerts.add_alert(alert("a2", "truck-2"));
        alerts.add_alert(alert("a3", "truck-3"));
        let ids: Vec<String> = alerts.alerts().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["a3", "a2"]);
    }

    #[test]
    fn test_read_state_transitions() {
        let (alerts, _) = manager(AlertConfig::default());
        alerts.add_alert(alert("a1", "truck-1"));
        alerts.add_alert(alert("a2", "truck-2"));
        alerts.add_alert(alert("a3", "truck-3"));
        assert_eq!(alerts.unread_count(), 3);
        assert!(alerts.mark_as_read("a1"));
        assert!(!alerts.mark_as_read("a1"));
        assert!(!alerts.mark_as_read("missing"));
        assert_eq!(alerts.mark_all_as_read().len(), 2);
        assert_eq!(alerts.unread_count(), 0);
        assert!(alerts.delete_alert("a2").is_some());
        assert!(alerts.delete_alert("a2").is_none());
        assert_eq!(alerts.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_repeat_notifications() {
        let (alerts, sink) = manager(AlertConfig::default());
        alerts.add_alert(alert("a1", "truck-1"));
        alerts.add_alert(alert("a2", "truck-1"));
        alerts.add_alert(alert("a3", "truck-2"));
        tokio::time::advance(Duration::from_secs(61)).await;
        alerts.add_alert(alert("a4", "truck-1"));

        assert_eq!(*sink.delivered.lock(), vec!["a1", "a3", "a4"]);
        // Suppressed notifications are still stored.
        assert_eq!(alerts.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_mark_read_fires_and_cancels() {
        let config = AlertConfig {
            auto_mark_read_after: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let (alerts, _) = manager(config);
        let mut auto_read = alerts.take_auto_read_events().unwrap();
        assert!(alerts.take_auto_read_events().is_none());
        alerts.add_alert(alert("a1", "truck-1"));
        alerts.add_alert(alert("a2", "truck-2"));
        alerts.delete_alert("a2");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!alerts.get("a1").unwrap().read);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(alerts.get("a1").unwrap().read);
        assert!(alerts.get("a2").is_none());

        let changed = auto_read.try_recv().unwrap();
        assert_eq!(changed.id, "a1");
        assert!(changed.read);
        assert!(auto_read.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_cooldowns_are_forgotten() {
        let (alerts, sink) = manager(AlertConfig::default());
        alerts.add_alert(alert("a1", "truck-1"));
        alerts.add_alert(alert("a2", "truck-2"));
        assert_eq!(alerts.book.lock().last_notified.len(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        alerts.add_alert(alert("a3", "truck-3"));
        let keys: Vec<String> = alerts.book.lock().last_notified.keys().cloned().collect();
        assert_eq!(keys, vec!["remote:truck-3"]);
        assert_eq!(sink.delivered.lock().len(), 3);
    }

    #[test]
    fn test_mark_all_returns_changed_alerts_in_order() {
        let (alerts, _) = manager(AlertConfig::default());
        alerts.add_alert(alert("a1", "truck-1"));
        alerts.add_alert(alert("a2", "truck-2"));
        alerts.add_alert(alert("a3", "truck-3"));
        alerts.mark_as_read("a2");
        let ids: Vec<String> = alerts.mark_all_as_read().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["a1", "a3"]);
        assert!(alerts.mark_all_as_read().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_timers() {
        let config = AlertConfig {
            auto_mark_read_after: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let (alerts, _) = manager(config);
        alerts.add_alert(alert("a1", "truck-1"));
        alerts.shutdown();
        alerts.shutdown();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!alerts.get("a1").unwrap().read);
    }

    #[test]
    fn test_derived_alert_ids_are_deterministic() {
        let violation = Violation {
            id: "v-42".to_string(),
            vehicle_id: "truck-1".to_string(),
            geofence_id: "depot".to_string(),
            kind: ViolationKind::Exit,
            timestamp: ts(3),
            position: Position::new(1.0, 1.0, ts(3)),
            distance_to_boundary: 12.4,
            severity: Severity::High,
            resolved: false,
            resolved_at: None,
        };
        let first = alert_from_violation(&violation, "North depot");
        let second = alert_from_violation(&violation, "North depot");
        assert_eq!(first.id, second.id);
        assert_eq!(first.severity, Severity::High);
        assert!(first.message.contains("North depot"));

        let (alerts, _) = manager(AlertConfig::default());
        assert!(alerts.add_alert(first));
        assert!(!alerts.add_alert(second));

        let offline = alert_from_status_change(
            "truck-1",
            VehicleStatus::Active,
            VehicleStatus::Offline,
            ts(9),
        );
        assert_eq!(offline.severity, Severity::High);
        assert_eq!(offline.id, format!("status:truck-1:{}", ts(9).timestamp_millis()));
    }
}
