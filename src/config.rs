use anyhow::{anyhow, Context, Result};
use std::str::FromStr;
use std::time::Duration;

use crate::models::ConflictStrategy;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub heartbeat_interval: Duration,
    /// Backoff for attempt `n` is `reconnect_base_interval * n`, capped at `max_reconnect_delay`.
    pub reconnect_base_interval: Duration,
    pub max_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Outbound queue length past which every enqueue logs a warning.
    pub outbound_soft_limit: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_base_interval: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            outbound_soft_limit: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Buffered transport messages that trigger an early batch flush.
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub tick_interval: Duration,
    pub max_updates_per_tick: usize,
    /// Speed above which an update is high priority.
    pub fast_speed_threshold: f64,
    pub throttle_window: Duration,
    pub min_distance_meters: f64,
    /// Apply high-priority updates on ingest instead of waiting for the tick.
    pub immediate_high_priority: bool,
    pub max_vehicles: usize,
    pub max_alerts: usize,
    pub max_violations: usize,
    pub max_routes: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_interval: Duration::from_millis(100),
            tick_interval: Duration::from_millis(500),
            max_updates_per_tick: 100,
            fast_speed_threshold: 80.0,
            throttle_window: Duration::from_secs(1),
            min_distance_meters: 5.0,
            immediate_high_priority: true,
            max_vehicles: 1000,
            max_alerts: 500,
            max_violations: 500,
            max_routes: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeofenceConfig {
    /// Crossings within this many meters of the boundary are high severity.
    pub violation_threshold_meters: f64,
    /// Containment samples kept per (vehicle, geofence) pair.
    pub history_size: usize,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            violation_threshold_meters: 100.0,
            history_size: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OfflineConfig {
    pub storage_key: String,
    pub max_storage_bytes: usize,
    pub max_vehicles: usize,
    pub max_alerts: usize,
    pub max_violations: usize,
    pub max_routes: usize,
    pub conflict_strategy: ConflictStrategy,
    /// Periodic sync while online with a non-empty queue. `None` disables it.
    pub sync_interval: Option<Duration>,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            storage_key: "fleet_sync_state".to_string(),
            max_storage_bytes: 5 * 1024 * 1024,
            max_vehicles: 500,
            max_alerts: 100,
            max_violations: 50,
            max_routes: 20,
            conflict_strategy: ConflictStrategy::Timestamp,
            sync_interval: Some(Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub max_alerts: usize,
    pub auto_mark_read_after: Option<Duration>,
    /// Minimum gap between two notifications for the same source key.
    pub notification_cooldown: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            max_alerts: 100,
            auto_mark_read_after: None,
            notification_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FleetConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub connection: ConnectionConfig,
    pub processor: ProcessorConfig,
    pub geofence: GeofenceConfig,
    pub offline: OfflineConfig,
    pub alerts: AlertConfig,
}

impl FleetConfig {
    /// Creates a config from environment variables, loading `.env` first.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let ws_url = std::env::var("FLEET_WS_URL")
            .map_err(|_| anyhow!("FLEET_WS_URL environment variable is required"))?;
        let api_url = std::env::var("FLEET_API_URL")
            .map_err(|_| anyhow!("FLEET_API_URL environment variable is required"))?;

        let mut config = FleetConfig {
            api_url: normalize_base_url(&api_url)?,
            api_key: std::env::var("FLEET_API_KEY").ok().filter(|k| !k.is_empty()),
            ..Default::default()
        };
        config.connection.url = validate_ws_url(&ws_url)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(attempts) = env_value::<u32>("FLEET_MAX_RECONNECT_ATTEMPTS")? {
            self.connection.max_reconnect_attempts = attempts;
        }
        if let Some(period) = env_period("FLEET_HEARTBEAT_INTERVAL_MS")? {
            self.connection.heartbeat_interval = period;
        }
        if let Some(ms) = env_value::<u64>("FLEET_RECONNECT_INTERVAL_MS")? {
            self.connection.reconnect_base_interval = Duration::from_millis(ms);
        }
        if let Some(size) = env_value::<usize>("FLEET_BATCH_SIZE")? {
            self.processor.batch_size = size;
        }
        if let Some(period) = env_period("FLEET_BATCH_INTERVAL_MS")? {
            self.processor.batch_interval = period;
        }
        if let Some(max) = env_value::<usize>("FLEET_MAX_VEHICLES")? {
            self.processor.max_vehicles = max;
        }
        if let Some(meters) = env_value::<f64>("FLEET_VIOLATION_THRESHOLD_M")? {
            self.geofence.violation_threshold_meters = meters;
        }
        if let Some(bytes) = env_value::<usize>("FLEET_MAX_STORAGE_BYTES")? {
            self.offline.max_storage_bytes = bytes;
        }
        if let Ok(strategy) = std::env::var("FLEET_CONFLICT_STRATEGY") {
            self.offline.conflict_strategy = ConflictStrategy::try_from(strategy.as_str())?;
        }
        if let Some(max) = env_value::<usize>("FLEET_MAX_ALERTS")? {
            self.alerts.max_alerts = max;
        }
        Ok(())
    }
}

fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("{} has an invalid value '{}'", name, raw)),
        Err(_) => Ok(None),
    }
}

/// A timer period in milliseconds. Zero is refused.
fn env_period(name: &str) -> Result<Option<Duration>> {
    match env_value::<u64>(name)? {
        Some(0) => Err(anyhow!("{} must be greater than zero", name)),
        Some(ms) => Ok(Some(Duration::from_millis(ms))),
        None => Ok(None),
    }
}

/// Period for a tokio interval, which panics on zero.
pub fn timer_period(period: Duration) -> Duration {
    period.max(Duration::from_millis(1))
}

/// Ensures the REST base parses and carries no trailing slash.
pub fn normalize_base_url(raw: &str) -> Result<String> {
    let parsed = url::Url::parse(raw).map_err(|e| anyhow!("Invalid API url '{}': {}", raw, e))?;
    match parsed.scheme() {
        "http" | "https" => Ok(raw.trim_end_matches('/').to_string()),
        other => Err(anyhow!("API url must be http(s), got scheme '{}'", other)),
    }
}

pub fn validate_ws_url(raw: &str) -> Result<String> {
    let parsed =
        url::Url::parse(raw).map_err(|e| anyhow!("Invalid telemetry url '{}': {}", raw, e))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(raw.to_string()),
        other => Err(anyhow!(
            "Telemetry url must be ws(s), got scheme '{}'",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_storage_caps() {
        let config = FleetConfig::default();
        assert_eq!(config.offline.max_alerts, 100);
        assert_eq!(config.offline.max_violations, 50);
        assert_eq!(config.offline.max_routes, 20);
        assert_eq!(config.offline.conflict_strategy, ConflictStrategy::Timestamp);
        assert!(config.alerts.auto_mark_read_after.is_none());
    }

    #[test]
    fn test_normalize_base_url_trims_slash() {
        assert_eq!(
            normalize_base_url("https://fleet.example.com/api/").unwrap(),
            "https://fleet.example.com/api"
        );
        assert!(normalize_base_url("ftp://fleet.example.com").is_err());
        assert!(normalize_base_url("not a url").is_err());
    }

    #[test]
    fn test_validate_ws_url() {
        assert!(validate_ws_url("wss://fleet.example.com/stream").is_ok());
        assert!(validate_ws_url("https://fleet.example.com/stream").is_err());
    }

    #[test]
    fn test_env_value_parses_and_rejects() {
        std::env::set_var("FLEET_TEST_ENV_VALUE_OK", "42");
        std::env::set_var("FLEET_TEST_ENV_VALUE_BAD", "forty-two");
        assert_eq!(env_value::<u32>("FLEET_TEST_ENV_VALUE_OK").unwrap(), Some(42));
        assert!(env_value::<u32>("FLEET_TEST_ENV_VALUE_BAD").is_err());
        assert_eq!(env_value::<u32>("FLEET_TEST_ENV_VALUE_MISSING").unwrap(), None);
    }

    #[test]
    fn test_env_period_refuses_zero() {
        std::env::set_var("FLEET_TEST_ENV_PERIOD_ZERO", "0");
        std::env::set_var("FLEET_TEST_ENV_PERIOD_OK", "250");
        let err = env_period("FLEET_TEST_ENV_PERIOD_ZERO").unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
        assert_eq!(
            env_period("FLEET_TEST_ENV_PERIOD_OK").unwrap(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(env_period("FLEET_TEST_ENV_PERIOD_MISSING").unwrap(), None);
    }

    #[test]
    fn test_timer_period_is_never_zero() {
        assert_eq!(timer_period(Duration::ZERO), Duration::from_millis(1));
        assert_eq!(timer_period(Duration::from_secs(30)), Duration::from_secs(30));
    }
}
