//! Live transport ownership: lifecycle state, heartbeat, reconnection with
//! bounded backoff and the outbound queue.
//!
//! The manager spawns one driver task per established connection. The driver
//! owns the transport; everything else talks to it through the shared outbound
//! queue and the cancellation token. Lifecycle changes and decoded frames reach
//! the owner over an unbounded event channel.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{timer_period, ConnectionConfig};
use crate::error::{FleetError, FleetResult};
use crate::models::{ConnectionState, ConnectionStatus};
use crate::protocol::{InboundFrame, OutboundFrame};

// ===== TRANSPORT =====

#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> FleetResult<()>;

    /// Next inbound text frame. `None` means the peer closed the connection.
    async fn recv(&mut self) -> Option<FleetResult<String>>;

    async fn close(&mut self) -> FleetResult<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, url: &str) -> FleetResult<Box<dyn Transport>>;
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    failed: bool,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> FleetResult<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| FleetError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<FleetResult<String>> {
        if self.failed {
            return None;
        }
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8(bytes).map_err(|e| {
                        FleetError::Transport(format!("binary frame is not utf-8: {}", e))
                    }))
                }
                Ok(Message::Close(_)) => return None,
                // Control frames are answered by tungstenite itself.
                Ok(_) => continue,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(FleetError::Transport(e.to_string())));
                }
            }
        }
    }

    async fn close(&mut self) -> FleetResult<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| FleetError::Transport(e.to_string()))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl TransportFactory for WebSocketConnector {
    async fn connect(&self, url: &str) -> FleetResult<Box<dyn Transport>> {
        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| FleetError::Transport(format!("connect to {} failed: {}", url, e)))?;
        debug!(status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(WebSocketTransport {
            stream,
            failed: false,
        }))
    }
}

// ===== IN-MEMORY TRANSPORT =====

/// Client half of an in-process transport.
pub struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<FleetResult<String>>,
    outbound: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

/// Server half of an in-process transport.
pub struct MemoryPeer {
    to_client: Option<mpsc::UnboundedSender<FleetResult<String>>>,
    from_client: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

pub fn memory_pair() -> (MemoryTransport, MemoryPeer) {
    let (to_client, inbound) = mpsc::unbounded_channel();
    let (outbound, from_client) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        MemoryTransport {
            inbound,
            outbound,
            closed: closed.clone(),
        },
        MemoryPeer {
            to_client: Some(to_client),
            from_client,
            closed,
        },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, text: String) -> FleetResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FleetError::Transport("transport is closed".to_string()));
        }
        self.outbound
            .send(text)
            .map_err(|_| FleetError::Transport("peer went away".to_string()))
    }

    async fn recv(&mut self) -> Option<FleetResult<String>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) -> FleetResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.inbound.close();
        Ok(())
    }
}

impl MemoryPeer {
    /// Delivers a text frame to the client. Returns false once closed.
    pub fn push(&self, text: impl Into<String>) -> bool {
        match &self.to_client {
            Some(tx) => tx.send(Ok(text.into())).is_ok(),
            None => false,
        }
    }

    pub fn push_error(&self, error: FleetError) -> bool {
        match &self.to_client {
            Some(tx) => tx.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Simulates the server dropping the connection.
    pub fn close(&mut self) {
        self.to_client.take();
    }

    pub async fn next_sent(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    pub fn drain_sent(&mut self) -> Vec<String> {
        let mut sent = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            sent.push(text);
        }
        sent
    }

    pub fn closed_by_client(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Factory that hands out pre-arranged connection outcomes in order and
/// refuses once the script runs out.
#[derive(Default)]
pub struct MemoryConnector {
    script: Mutex<VecDeque<FleetResult<MemoryTransport>>>,
    attempts: AtomicU32,
    handshake: Duration,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connect takes this long before its outcome is known.
    pub fn with_handshake(mut self, handshake: Duration) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn push_transport(&self, transport: MemoryTransport) {
        self.script.lock().push_back(Ok(transport));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.script
            .lock()
            .push_back(Err(FleetError::Transport(message.into())));
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportFactory for MemoryConnector {
    async fn connect(&self, _url: &str) -> FleetResult<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.handshake.is_zero() {
            tokio::time::sleep(self.handshake).await;
        }
        let next = self.script.lock().pop_front();
        match next {
            Some(Ok(transport)) => Ok(Box::new(transport)),
            Some(Err(e)) => Err(e),
            None => Err(FleetError::Transport("connection refused".to_string())),
        }
    }
}

// ===== CONNECTION MANAGER =====

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionStatus),
    Message(InboundFrame),
    Error(FleetError),
    ReconnectExhausted { attempts: u32 },
}

/// Delay before reconnect attempt `attempt` (1-based).
pub fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    base.saturating_mul(attempt.max(1)).min(max)
}

struct Shared {
    config: ConnectionConfig,
    factory: Arc<dyn TransportFactory>,
    clock: Arc<dyn Clock>,
    outbound: Mutex<VecDeque<String>>,
    outbound_ready: Notify,
    state: watch::Sender<ConnectionStatus>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        if self.state.borrow().state == state {
            return;
        }
        let status = ConnectionStatus::new(state, self.clock.now());
        info!(state = ?state, "Connection state changed");
        self.state.send_replace(status.clone());
        self.emit(ConnectionEvent::StateChanged(status));
    }

    fn emit(&self, event: ConnectionEvent) {
        // The owner may have stopped listening; nothing to do then.
        let _ = self.events.send(event);
    }

    fn dispatch(&self, text: &str) {
        match InboundFrame::decode(text) {
            Ok(frame) => self.emit(ConnectionEvent::Message(frame)),
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                self.emit(ConnectionEvent::Error(e));
            }
        }
    }
}

/// The connection slot. `handle` stays empty while the initial connect is in
/// flight; `disconnect` can still cancel it through the token.
struct Driver {
    generation: u64,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Driver {
    fn is_active(&self) -> bool {
        match &self.handle {
            Some(handle) => !handle.is_finished(),
            None => true,
        }
    }
}

pub struct ConnectionManager {
    shared: Arc<Shared>,
    driver: Mutex<Option<Driver>>,
    generations: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        factory: Arc<dyn TransportFactory>,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionStatus::new(
            ConnectionState::Disconnected,
            clock.now(),
        ));
        let manager = Self {
            shared: Arc::new(Shared {
                config,
                factory,
                clock,
                outbound: Mutex::new(VecDeque::new()),
                outbound_ready: Notify::new(),
                state,
                events,
            }),
            driver: Mutex::new(None),
            generations: AtomicU64::new(0),
        };
        (manager, events_rx)
    }

    /// Opens the transport and starts the driver. Calling this while a
    /// connect is in flight or a driver is running is a no-op. A `disconnect`
    /// issued while the transport is still opening abandons the attempt.
    pub async fn connect(&self) -> FleetResult<()> {
        let shared = self.shared.clone();
        let (generation, cancel) = {
            let mut driver = self.driver.lock();
            if driver.as_ref().is_some_and(Driver::is_active) {
                debug!("Connect requested while already connecting or running");
                return Ok(());
            }
            let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
            let cancel = CancellationToken::new();
            *driver = Some(Driver {
                generation,
                cancel: cancel.clone(),
                handle: None,
            });
            shared.set_state(ConnectionState::Connecting);
            (generation, cancel)
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Connect abandoned by disconnect");
                return Ok(());
            }
            result = shared.factory.connect(&shared.config.url) => result,
        };

        let mut transport = match result {
            Ok(transport) => transport,
            Err(e) => {
                warn!(error = %e, url = %shared.config.url, "Initial connection failed");
                {
                    let mut driver = self.driver.lock();
                    if driver.as_ref().map(|d| d.generation) == Some(generation) {
                        *driver = None;
                        shared.set_state(ConnectionState::Disconnected);
                    }
                }
                shared.emit(ConnectionEvent::Error(e.clone()));
                return Err(e);
            }
        };

        {
            let mut driver = self.driver.lock();
            if let Some(slot) = driver.as_mut() {
                if slot.generation == generation && !cancel.is_cancelled() {
                    shared.set_state(ConnectionState::Connected);
                    slot.handle = Some(tokio::spawn(run_driver(
                        shared.clone(),
                        transport,
                        cancel,
                    )));
                    return Ok(());
                }
            }
        }

        debug!("Connect abandoned by disconnect; closing the fresh transport");
        if let Err(e) = transport.close().await {
            debug!(error = %e, "Transport close failed");
        }
        Ok(())
    }

    /// Closes the transport and stops reconnecting, including a connect that
    /// is still in flight. Returns once the driver task, and with it every
    /// timer it owns, has finished.
    pub async fn disconnect(&self) {
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            driver.cancel.cancel();
            if let Some(handle) = driver.handle {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Connection driver ended abnormally");
                }
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Queues a message for delivery. It goes out as soon as a connection is
    /// available, in the order it was queued.
    pub fn send(&self, message: impl Into<String>) {
        let len = {
            let mut outbound = self.shared.outbound.lock();
            outbound.push_back(message.into());
            outbound.len()
        };
        if len > self.shared.config.outbound_soft_limit {
            warn!(
                queued = len,
                soft_limit = self.shared.config.outbound_soft_limit,
                "Outbound queue is above its soft limit"
            );
        }
        self.shared.outbound_ready.notify_one();
    }

    pub fn send_frame(&self, frame: &OutboundFrame) -> FleetResult<()> {
        self.send(frame.encode()?);
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.state.subscribe()
    }

    pub fn queued_len(&self) -> usize {
        self.shared.outbound.lock().len()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.cancel.cancel();
        }
    }
}

// ===== DRIVER =====

enum SessionEnd {
    Cancelled,
    Closed(String),
}

async fn run_driver(
    shared: Arc<Shared>,
    mut transport: Box<dyn Transport>,
    cancel: CancellationToken,
) {
    let max_attempts = shared.config.max_reconnect_attempts;
    loop {
        match run_session(&shared, transport.as_mut(), &cancel).await {
            SessionEnd::Cancelled => {
                if let Err(e) = transport.close().await {
                    debug!(error = %e, "Transport close failed");
                }
                return;
            }
            SessionEnd::Closed(reason) => {
                warn!(reason = %reason, "Connection closed unexpectedly");
            }
        }

        let mut attempt: u32 = 0;
        transport = loop {
            attempt += 1;
            if attempt > max_attempts {
                warn!(attempts = max_attempts, "Giving up on reconnecting");
                shared.set_state(ConnectionState::Error);
                shared.emit(ConnectionEvent::ReconnectExhausted {
                    attempts: max_attempts,
                });
                return;
            }

            shared.set_state(ConnectionState::Reconnecting);
            let delay = backoff_delay(
                shared.config.reconnect_base_interval,
                attempt,
                shared.config.max_reconnect_delay,
            );
            info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            shared.set_state(ConnectionState::Connecting);
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = shared.factory.connect(&shared.config.url) => result,
            };
            match result {
                Ok(transport) => {
                    info!(attempt, "Reconnected");
                    shared.set_state(ConnectionState::Connected);
                    break transport;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                    shared.emit(ConnectionEvent::Error(e));
                }
            }
        };
    }
}

async fn run_session(
    shared: &Shared,
    transport: &mut dyn Transport,
    cancel: &CancellationToken,
) -> SessionEnd {
    let period = timer_period(shared.config.heartbeat_interval);
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    if let Err(e) = flush_outbound(shared, transport).await {
        return SessionEnd::Closed(e.to_string());
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            inbound = transport.recv() => match inbound {
                Some(Ok(text)) => shared.dispatch(&text),
                Some(Err(e)) => {
                    warn!(error = %e, "Transport error");
                    shared.emit(ConnectionEvent::Error(e));
                }
                None => return SessionEnd::Closed("closed by peer".to_string()),
            },
            _ = shared.outbound_ready.notified() => {
                if let Err(e) = flush_outbound(shared, transport).await {
                    return SessionEnd::Closed(e.to_string());
                }
            }
            _ = heartbeat.tick() => {
                let ping = match OutboundFrame::ping(shared.clock.now_millis()).encode() {
                    Ok(ping) => ping,
                    Err(e) => {
                        warn!(error = %e, "Could not encode heartbeat");
                        continue;
                    }
                };
                if let Err(e) = transport.send(ping).await {
                    return SessionEnd::Closed(e.to_string());
                }
            }
        }
    }
}

/// Sends queued messages oldest first. A message leaves the queue only after
/// the transport accepted it.
async fn flush_outbound(shared: &Shared, transport: &mut dyn Transport) -> FleetResult<()> {
    loop {
        let next = shared.outbound.lock().front().cloned();
        let Some(message) = next else {
            return Ok(());
        };
        transport.send(message).await?;
        shared.outbound.lock().pop_front();
    }
}
