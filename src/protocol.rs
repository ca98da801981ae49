//! JSON frame codec for the telemetry stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{FleetError, FleetResult};

// ===== MESSAGE KINDS =====

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    VehicleUpdate,
    Alert,
    GeofenceViolation,
    RouteUpdate,
    /// Envelope whose `data` is an array of typed frames.
    Batch,
    Ping,
    Pong,
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::VehicleUpdate => "vehicle_update",
            MessageKind::Alert => "alert",
            MessageKind::GeofenceViolation => "geofence_violation",
            MessageKind::RouteUpdate => "route_update",
            MessageKind::Batch => "batch",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Other(other) => other,
        }
    }

    /// Kinds the processor knows how to cache.
    pub fn is_telemetry(&self) -> bool {
        matches!(
            self,
            MessageKind::VehicleUpdate
                | MessageKind::Alert
                | MessageKind::GeofenceViolation
                | MessageKind::RouteUpdate
        )
    }
}

impl From<&str> for MessageKind {
    fn from(s: &str) -> Self {
        match s {
            "vehicle_update" => MessageKind::VehicleUpdate,
            "alert" => MessageKind::Alert,
            "geofence_violation" => MessageKind::GeofenceViolation,
            "route_update" => MessageKind::RouteUpdate,
            "batch" => MessageKind::Batch,
            "ping" => MessageKind::Ping,
            "pong" => MessageKind::Pong,
            other => MessageKind::Other(other.to_string()),
        }
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MessageKind::from(raw.as_str()))
    }
}

// ===== FRAMES =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl InboundFrame {
    pub fn new(kind: MessageKind, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: None,
        }
    }

    /// Decoding failures are transport errors: the frame never reached the
    /// processor, so it is reported rather than counted as a rejected event.
    pub fn decode(text: &str) -> FleetResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| FleetError::Transport(format!("undecodable frame: {}", e)))
    }

    pub fn encode(&self) -> FleetResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// A frame is a batch when it says so or when it carries an array payload.
    pub fn is_batch(&self) -> bool {
        self.kind == MessageKind::Batch || self.data.is_array()
    }

    /// Splits a batch into its sub-frames. Elements of an explicit `batch`
    /// envelope are full frames; elements of a typed array share the parent's
    /// type. Sub-frames without their own timestamp inherit the parent's.
    /// Elements that cannot be read as frames come back as errors in place.
    pub fn split(self) -> Vec<FleetResult<InboundFrame>> {
        if !self.is_batch() {
            return vec![Ok(self)];
        }
        let parent_ts = self.timestamp;
        let items = match self.data {
            Value::Array(items) => items,
            other => {
                return vec![Err(FleetError::Validation(format!(
                    "batch frame data must be an array, got {}",
                    type_name(&other)
                )))]
            }
        };

        let mut frames = Vec::with_capacity(items.len());
        for item in items {
            let frame = if self.kind == MessageKind::Batch {
                serde_json::from_value::<InboundFrame>(item).map_err(FleetError::from)
            } else {
                Ok(InboundFrame::new(self.kind.clone(), item))
            };
            frames.push(frame.map(|mut f| {
                if f.timestamp.is_none() {
                    f.timestamp = parent_ts;
                }
                f
            }));
        }
        frames
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl OutboundFrame {
    pub fn new(kind: MessageKind, data: Value, timestamp_ms: i64) -> Self {
        Self {
            kind,
            data,
            timestamp: timestamp_ms,
        }
    }

    pub fn ping(timestamp_ms: i64) -> Self {
        Self::new(MessageKind::Ping, Value::Null, timestamp_ms)
    }

    pub fn encode(&self) -> FleetResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
