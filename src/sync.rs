//! Orchestration: wires the connection, processor, geofence engine, alerting
//! and offline store together and runs the timed tasks.

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerts::{alert_from_status_change, alert_from_violation, AlertManager, NotificationSink};
use crate::client::FleetApiClient;
use crate::clock::Clock;
use crate::config::{timer_period, FleetConfig};
use crate::connection::{ConnectionEvent, ConnectionManager, TransportFactory};
use crate::error::{FleetError, FleetResult};
use crate::geofence::GeofenceEngine;
use crate::models::{
    Alert, ConflictWinner, ConnectionState, ConnectionStatus, Geofence, Route, SyncItemKind,
    SyncResult, Vehicle, VehicleStatus, Violation,
};
use crate::offline::{KeyValueStore, OfflineStore, PersistOutcome, RemoteSource, StateSnapshot};
use crate::processor::{CacheChange, MessageProcessor, ProcessorStats};
use crate::protocol::{InboundFrame, MessageKind};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum FleetEvent {
    VehicleUpdated(Vehicle),
    AlertRaised(Alert),
    ViolationRaised(Violation),
    RouteUpdated(Route),
    ConnectionStateChanged(ConnectionStatus),
    ConnectionError(String),
    ReconnectExhausted { attempts: u32 },
    /// Frames of a type the processor does not handle.
    Unhandled(InboundFrame),
    SyncCompleted(SyncResult),
}

/// Collaborators handed to [`FleetSync::new`].
pub struct FleetDependencies {
    pub transport: Arc<dyn TransportFactory>,
    pub store: Arc<dyn KeyValueStore>,
    pub remote: Arc<dyn RemoteSource>,
    pub sink: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillSummary {
    pub vehicles: usize,
    pub geofences: usize,
    pub alerts: usize,
    pub rejected: usize,
}

struct GeoState {
    engine: GeofenceEngine,
    geofences: Vec<Geofence>,
}

struct Core {
    config: FleetConfig,
    clock: Arc<dyn Clock>,
    processor: Mutex<MessageProcessor>,
    geo: Mutex<GeoState>,
    alerts: AlertManager,
    offline: OfflineStore,
    remote: Arc<dyn RemoteSource>,
    events: broadcast::Sender<FleetEvent>,
    sync_requested: Notify,
}

/// Receivers drained by the event loop. Handed back when it stops so the
/// instance can be started again.
struct Inbox {
    connection: mpsc::UnboundedReceiver<ConnectionEvent>,
    auto_read: Option<mpsc::UnboundedReceiver<Alert>>,
}

struct Running {
    cancel: CancellationToken,
    event_loop: JoinHandle<Inbox>,
    timers: Vec<JoinHandle<()>>,
}

pub struct FleetSync {
    core: Arc<Core>,
    connection: ConnectionManager,
    inbox: Mutex<Option<Inbox>>,
    running: Mutex<Option<Running>>,
}

impl FleetSync {
    /// Builds every component and restores the last persisted state. A
    /// corrupt or unreadable state document is logged and skipped.
    pub fn new(config: FleetConfig, deps: FleetDependencies) -> Self {
        let (connection, connection_events) = ConnectionManager::new(
            config.connection.clone(),
            deps.transport,
            deps.clock.clone(),
        );
        let offline = OfflineStore::new(config.offline.clone(), deps.store, deps.clock.clone());
        let alerts = AlertManager::new(config.alerts.clone(), deps.sink, deps.clock.clone());
        let inbox = Inbox {
            connection: connection_events,
            auto_read: alerts.take_auto_read_events(),
        };
        let mut processor = MessageProcessor::new(config.processor.clone());

        match offline.load() {
            Ok(Some(snapshot)) => {
                alerts.restore(snapshot.alerts.clone());
                processor.restore(
                    snapshot.vehicles,
                    snapshot.alerts,
                    snapshot.violations,
                    snapshot.routes,
                );
            }
            Ok(None) => debug!("No persisted fleet state"),
            Err(e) => warn!(error = %e, "Failed to load persisted fleet state; starting empty"),
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let core = Core {
            geo: Mutex::new(GeoState {
                engine: GeofenceEngine::new(config.geofence.clone()),
                geofences: Vec::new(),
            }),
            processor: Mutex::new(processor),
            clock: deps.clock,
            alerts,
            offline,
            remote: deps.remote,
            events,
            sync_requested: Notify::new(),
            config,
        };

        Self {
            core: Arc::new(core),
            connection,
            inbox: Mutex::new(Some(inbox)),
            running: Mutex::new(None),
        }
    }

    // ===== LIFECYCLE =====

    /// Starts the background tasks and opens the connection. Safe to call
    /// again after a failed initial connect.
    pub async fn start(&self) -> FleetResult<()> {
        self.spawn_tasks();
        self.connection.connect().await
    }

    fn spawn_tasks(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }
        let Some(mut inbox) = self.inbox.lock().take() else {
            return;
        };

        let cancel = CancellationToken::new();
        let core = self.core.clone();
        let token = cancel.clone();
        let event_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = inbox.connection.recv() => match event {
                        Some(event) => core.handle_connection_event(event),
                        None => break,
                    },
                    Some(alert) = next_auto_read(&mut inbox.auto_read) => {
                        core.offline.record_change(&CacheChange::AlertCached(alert));
                    }
                }
            }
            inbox
        });

        let mut timers = Vec::new();

        let core = self.core.clone();
        let token = cancel.clone();
        timers.push(tokio::spawn(async move {
            let period = timer_period(core.config.processor.batch_interval);
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let changes = core.processor.lock().flush_buffer();
                        core.handle_changes(changes);
                    }
                }
            }
        }));

        let core = self.core.clone();
        let token = cancel.clone();
        timers.push(tokio::spawn(async move {
            let period = timer_period(core.config.processor.tick_interval);
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let changes = core.processor.lock().tick();
                        core.handle_changes(changes);
                    }
                }
            }
        }));

        let core = self.core.clone();
        let token = cancel.clone();
        timers.push(tokio::spawn(async move {
            let period = core.config.offline.sync_interval.map(timer_period);
            let mut interval = period.map(tokio::time::interval);
            loop {
                let periodic = async {
                    match interval.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = core.sync_requested.notified() => {
                        core.run_sync().await;
                    }
                    _ = periodic => {
                        if core.offline.is_online() && core.offline.pending_len() > 0 {
                            core.run_sync().await;
                        }
                        core.persist_quietly();
                    }
                }
            }
        }));

        *running = Some(Running {
            cancel,
            event_loop,
            timers,
        });
    }

    /// Disconnects, stops every task and writes the current state. Safe to
    /// call more than once; the instance can be started again afterwards.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        self.connection.disconnect().await;

        if let Some(running) = running {
            running.cancel.cancel();
            match running.event_loop.await {
                Ok(inbox) => *self.inbox.lock() = Some(inbox),
                Err(e) => warn!(error = %e, "Event loop ended abnormally"),
            }
            for timer in running.timers {
                if let Err(e) = timer.await {
                    warn!(error = %e, "Timer task ended abnormally");
                }
            }
        }

        self.core.offline.record_online(false);
        self.core.alerts.shutdown();
        self.process_pending();
        self.core.persist_quietly();
        info!("Fleet sync stopped");
    }

    // ===== INPUT =====

    /// Queues an outbound message on the live connection.
    pub fn send(&self, message: impl Into<String>) {
        self.connection.send(message);
    }

    /// Processes a frame immediately, bypassing the transport buffer.
    pub fn ingest(&self, frame: InboundFrame) {
        self.core.handle_frame_now(frame);
    }

    /// Flushes the transport buffer and drains the update queue completely.
    pub fn process_pending(&self) {
        let changes = {
            let mut processor = self.core.processor.lock();
            let mut changes = processor.flush_buffer();
            while processor.queued_len() > 0 {
                changes.extend(processor.tick());
            }
            changes
        };
        self.core.handle_changes(changes);
    }

    pub fn upsert_geofence(&self, geofence: Geofence) -> FleetResult<()> {
        geofence.validate()?;
        let mut geo = self.core.geo.lock();
        let GeoState { engine, geofences } = &mut *geo;
        match geofences.iter_mut().find(|g| g.id == geofence.id) {
            Some(existing) => {
                // Containment history no longer applies to a moved fence.
                if existing.geometry != geofence.geometry || existing.kind != geofence.kind {
                    engine.remove_geofence(&geofence.id);
                }
                *existing = geofence;
            }
            None => geofences.push(geofence),
        }
        Ok(())
    }

    pub fn remove_geofence(&self, id: &str) -> bool {
        let mut geo = self.core.geo.lock();
        let before = geo.geofences.len();
        geo.geofences.retain(|g| g.id != id);
        geo.engine.remove_geofence(id);
        geo.geofences.len() != before
    }

    pub fn remove_vehicle(&self, id: &str) -> Option<Vehicle> {
        let removed = self.core.processor.lock().remove_vehicle(id);
        self.core.geo.lock().engine.remove_vehicle(id);
        if removed.is_some() {
            self.core.offline.record_removal(SyncItemKind::Vehicle, id);
        }
        removed
    }

    pub fn resolve_violation(&self, id: &str) -> bool {
        let change = self
            .core
            .processor
            .lock()
            .resolve_violation(id, self.core.clock.now());
        match change {
            Some(change) => {
                self.core.handle_changes(vec![change]);
                true
            }
            None => false,
        }
    }

    pub fn mark_alert_read(&self, id: &str) -> bool {
        let changed = self.core.alerts.mark_as_read(id);
        if changed {
            if let Some(alert) = self.core.alerts.get(id) {
                self.core.offline.record_change(&CacheChange::AlertCached(alert));
            }
        }
        changed
    }

    pub fn mark_all_alerts_read(&self) -> usize {
        let changed = self.core.alerts.mark_all_as_read();
        for alert in &changed {
            self.core
                .offline
                .record_change(&CacheChange::AlertCached(alert.clone()));
        }
        changed.len()
    }

    pub fn delete_alert(&self, id: &str) -> Option<Alert> {
        let removed = self.core.alerts.delete_alert(id);
        if removed.is_some() {
            self.core.offline.record_removal(SyncItemKind::Alert, id);
        }
        removed
    }

    /// Loads vehicles, geofences and alerts from the REST collaborator. Every
    /// item goes through the same validation as streamed events.
    pub async fn backfill(&self, client: &FleetApiClient) -> Result<BackfillSummary> {
        let vehicles = client.get_vehicles().await?;
        let geofences = client.get_geofences().await?;
        let alerts = client.get_alerts().await?;
        Ok(self.apply_backfill(vehicles, geofences, alerts))
    }

    pub fn apply_backfill(
        &self,
        vehicles: Vec<Value>,
        geofences: Vec<Value>,
        alerts: Vec<Value>,
    ) -> BackfillSummary {
        let mut summary = BackfillSummary::default();

        for raw in geofences {
            let parsed = serde_json::from_value::<Geofence>(raw)
                .map_err(FleetError::from)
                .and_then(|g| self.upsert_geofence(g));
            match parsed {
                Ok(()) => summary.geofences += 1,
                Err(e) => {
                    warn!(error = %e, "Rejected backfilled geofence");
                    summary.rejected += 1;
                }
            }
        }

        let mut changes = Vec::new();
        {
            let mut processor = self.core.processor.lock();
            for (kind, items) in [(MessageKind::VehicleUpdate, vehicles), (MessageKind::Alert, alerts)] {
                for raw in items {
                    match processor.ingest(InboundFrame::new(kind.clone(), raw)) {
                        Ok(applied) => {
                            if kind == MessageKind::VehicleUpdate {
                                summary.vehicles += 1;
                            } else {
                                summary.alerts += 1;
                            }
                            changes.extend(applied);
                        }
                        Err(e) => {
                            warn!(error = %e, kind = kind.as_str(), "Rejected backfilled item");
                            summary.rejected += 1;
                        }
                    }
                }
            }
            while processor.queued_len() > 0 {
                changes.extend(processor.tick());
            }
        }
        // Backfilled records already live on the server.
        self.core.dispatch_changes(changes, false);
        info!(
            vehicles = summary.vehicles,
            geofences = summary.geofences,
            alerts = summary.alerts,
            rejected = summary.rejected,
            "Backfill applied"
        );
        summary
    }

    /// Drains the offline queue against the remote right away.
    pub async fn sync_now(&self) -> SyncResult {
        self.core.run_sync().await
    }

    pub fn persist(&self) -> Result<PersistOutcome> {
        self.core.offline.persist(&self.core.snapshot())
    }

    // ===== SNAPSHOTS =====

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.core.events.subscribe()
    }

    pub fn vehicles(&self) -> Vec<Vehicle> {
        self.core.processor.lock().vehicles()
    }

    pub fn vehicle(&self, id: &str) -> Option<Vehicle> {
        self.core.processor.lock().vehicle(id)
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.core.alerts.alerts()
    }

    pub fn unread_alert_count(&self) -> usize {
        self.core.alerts.unread_count()
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.core.processor.lock().violations()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.core.processor.lock().routes()
    }

    pub fn geofences(&self) -> Vec<Geofence> {
        self.core.geo.lock().geofences.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn stats(&self) -> ProcessorStats {
        self.core.processor.lock().stats()
    }

    pub fn pending_sync_count(&self) -> usize {
        self.core.offline.pending_len()
    }

    pub fn outbound_queue_len(&self) -> usize {
        self.connection.queued_len()
    }
}

impl Drop for FleetSync {
    fn drop(&mut self) {
        if let Some(running) = self.running.lock().take() {
            running.cancel.cancel();
        }
    }
}

async fn next_auto_read(events: &mut Option<mpsc::UnboundedReceiver<Alert>>) -> Option<Alert> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

fn message_kind_for(kind: SyncItemKind) -> MessageKind {
    match kind {
        SyncItemKind::Vehicle => MessageKind::VehicleUpdate,
        SyncItemKind::Alert => MessageKind::Alert,
        SyncItemKind::Violation => MessageKind::GeofenceViolation,
        SyncItemKind::Route => MessageKind::RouteUpdate,
    }
}

impl Core {
    fn publish(&self, event: FleetEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn snapshot(&self) -> StateSnapshot {
        let (vehicles, violations, routes) = {
            let processor = self.processor.lock();
            (processor.vehicles(), processor.violations(), processor.routes())
        };
        StateSnapshot {
            vehicles,
            alerts: self.alerts.alerts(),
            violations,
            routes,
        }
    }

    fn persist_quietly(&self) {
        match self.offline.persist_if_dirty(&self.snapshot()) {
            Ok(Some(PersistOutcome::Skipped { bytes })) => {
                warn!(bytes, "Fleet state not persisted; over storage budget")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to persist fleet state"),
        }
    }

    fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(status) => {
                let state = status.state;
                self.publish(FleetEvent::ConnectionStateChanged(status));
                if state == ConnectionState::Connected {
                    if self.offline.record_online(true) && self.offline.pending_len() > 0 {
                        self.sync_requested.notify_one();
                    }
                } else if self.offline.is_online() {
                    self.offline.record_online(false);
                    self.persist_quietly();
                }
            }
            ConnectionEvent::Message(frame) => self.handle_frame(frame),
            ConnectionEvent::Error(e) => {
                warn!(error = %e, code = e.error_code(), "Connection error");
                self.publish(FleetEvent::ConnectionError(e.to_string()));
            }
            ConnectionEvent::ReconnectExhausted { attempts } => {
                let failure = FleetError::ReconnectExhausted { attempts };
                error!(error = %failure, "Telemetry connection lost for good");
                self.offline.record_online(false);
                self.persist_quietly();
                self.publish(FleetEvent::ReconnectExhausted { attempts });
            }
        }
    }

    /// Telemetry is buffered for the batch timer; everything else goes
    /// straight to subscribers.
    fn handle_frame(&self, frame: InboundFrame) {
        if !frame.kind.is_telemetry() && frame.kind != MessageKind::Batch {
            match frame.kind {
                MessageKind::Ping | MessageKind::Pong => debug!(kind = frame.kind.as_str(), "Control frame"),
                _ => self.publish(FleetEvent::Unhandled(frame)),
            }
            return;
        }
        let changes = {
            let mut processor = self.processor.lock();
            if processor.buffer(frame) {
                processor.flush_buffer()
            } else {
                Vec::new()
            }
        };
        self.handle_changes(changes);
    }

    fn handle_frame_now(&self, frame: InboundFrame) {
        if !frame.kind.is_telemetry() && frame.kind != MessageKind::Batch {
            self.publish(FleetEvent::Unhandled(frame));
            return;
        }
        let changes = self.processor.lock().ingest_frame(frame);
        self.handle_changes(changes);
    }

    fn handle_changes(&self, changes: Vec<CacheChange>) {
        self.dispatch_changes(changes, true);
    }

    /// Fans cache changes out to geofencing, alerting and subscribers. With
    /// `queue_offline` unset the changes are not queued for sync, only
    /// persisted; remote state applied after a conflict takes that path.
    fn dispatch_changes(&self, changes: Vec<CacheChange>, queue_offline: bool) {
        for change in changes {
            if queue_offline {
                self.offline.record_change(&change);
            } else {
                self.offline.mark_dirty();
            }
            match change {
                CacheChange::VehicleUpdated {
                    vehicle,
                    previous_status,
                } => self.on_vehicle_updated(vehicle, previous_status),
                CacheChange::VehicleEvicted(id) => self.geo.lock().engine.remove_vehicle(&id),
                CacheChange::AlertCached(alert) => self.raise_alert(alert),
                CacheChange::ViolationCached(violation) => {
                    if !violation.resolved {
                        let name = self.geofence_name(&violation.geofence_id);
                        self.raise_alert(alert_from_violation(&violation, &name));
                    }
                    self.publish(FleetEvent::ViolationRaised(violation));
                }
                CacheChange::RouteCached(route) => self.publish(FleetEvent::RouteUpdated(route)),
            }
        }
    }

    fn on_vehicle_updated(&self, vehicle: Vehicle, previous_status: Option<VehicleStatus>) {
        if let Some(previous) = previous_status.filter(|p| *p != vehicle.status) {
            self.raise_alert(alert_from_status_change(
                &vehicle.id,
                previous,
                vehicle.status,
                vehicle.last_update,
            ));
        }

        let violations = {
            let mut geo = self.geo.lock();
            let GeoState { engine, geofences } = &mut *geo;
            engine.check_violations(std::slice::from_ref(&vehicle), geofences)
        };
        self.publish(FleetEvent::VehicleUpdated(vehicle));

        for violation in violations {
            let recorded = self.processor.lock().record_violation(violation);
            if let Some(change) = recorded {
                self.handle_changes(vec![change]);
            }
        }
    }

    fn raise_alert(&self, alert: Alert) {
        if self.alerts.add_alert(alert.clone()) {
            self.publish(FleetEvent::AlertRaised(alert));
        }
    }

    fn geofence_name(&self, id: &str) -> String {
        self.geo
            .lock()
            .geofences
            .iter()
            .find(|g| g.id == id)
            .map(|g| g.name.clone())
            .unwrap_or_default()
    }

    async fn run_sync(&self) -> SyncResult {
        let result = self.offline.sync(self.remote.as_ref()).await;

        let mut changes = Vec::new();
        for conflict in result
            .conflicts
            .iter()
            .filter(|c| c.winner == ConflictWinner::Remote)
        {
            let frame = InboundFrame::new(message_kind_for(conflict.item_kind), conflict.remote.clone());
            match self.processor.lock().ingest(frame) {
                Ok(applied) => changes.extend(applied),
                Err(e) => warn!(item_id = conflict.item_id, error = %e, "Remote winner failed validation"),
            }
        }
        self.dispatch_changes(changes, false);

        self.persist_quietly();
        self.publish(FleetEvent::SyncCompleted(result.clone()));
        result
    }
}
