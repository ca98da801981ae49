//! Real-time fleet telemetry sync core.
//!
//! [`FleetSync`] owns a reconnecting telemetry connection, validated bounded
//! caches, geofence crossing detection, alerting and an offline queue that is
//! replayed against the REST backend once the connection returns.

pub mod alerts;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod geofence;
pub mod models;
pub mod offline;
pub mod processor;
pub mod protocol;
pub mod storage;
pub mod sync;

pub use alerts::{AlertManager, NotificationSink, TracingSink};
pub use client::FleetApiClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::FleetConfig;
pub use connection::{ConnectionManager, Transport, TransportFactory, WebSocketConnector};
pub use error::{FleetError, FleetResult};
pub use geofence::GeofenceEngine;
pub use models::*;
pub use offline::{KeyValueStore, MemoryStore, OfflineStore, RemoteSource, StateSnapshot};
pub use processor::MessageProcessor;
pub use storage::NativeDbStore;
pub use sync::{BackfillSummary, FleetDependencies, FleetEvent, FleetSync};
