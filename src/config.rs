use crate::influx::InfluxSettings;
use crate::mqtt::ReconnectPolicy;
use crate::pipeline::RetryPolicy;
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/aquarium-bridge/config.json";

fn setup_config_path(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(path) = lookup("BRIDGE_SETUP_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_namespace: Option<String>,
    #[serde(default)]
    influx_url: Option<String>,
    #[serde(default)]
    influx_database: Option<String>,
    #[serde(default)]
    influx_username: Option<String>,
    #[serde(default)]
    influx_password: Option<String>,
    #[serde(default)]
    influx_measurement: Option<String>,
    #[serde(default)]
    write_max_attempts: Option<u32>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "aquarium-bridge failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "aquarium-bridge failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Setup file values only apply where the matching env var is unset.
fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_is_set: impl Fn(&str) -> bool,
) {
    let allows = |key: &str| !env_is_set(key);

    if allows("BRIDGE_MQTT_HOST") {
        if let Some(host) = non_empty(overrides.mqtt_host.as_deref()) {
            config.mqtt_host = host;
        }
    }
    if allows("BRIDGE_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if allows("BRIDGE_MQTT_USERNAME") {
        if let Some(username) = overrides.mqtt_username.as_deref() {
            config.mqtt_username = non_empty(Some(username));
        }
    }
    if allows("BRIDGE_MQTT_PASSWORD") {
        if let Some(password) = overrides.mqtt_password.as_deref() {
            config.mqtt_password = non_empty(Some(password));
        }
    }
    if allows("BRIDGE_MQTT_NAMESPACE") {
        if let Some(namespace) = non_empty(overrides.mqtt_namespace.as_deref()) {
            config.mqtt_namespace = namespace.trim_end_matches('/').to_string();
        }
    }
    if allows("BRIDGE_INFLUX_URL") {
        if let Some(url) = non_empty(overrides.influx_url.as_deref()) {
            config.influx_url = url;
        }
    }
    if allows("BRIDGE_INFLUX_DATABASE") {
        if let Some(database) = non_empty(overrides.influx_database.as_deref()) {
            config.influx_database = database;
        }
    }
    if allows("BRIDGE_INFLUX_USERNAME") {
        if let Some(username) = overrides.influx_username.as_deref() {
            config.influx_username = non_empty(Some(username));
        }
    }
    if allows("BRIDGE_INFLUX_PASSWORD") {
        if let Some(password) = overrides.influx_password.as_deref() {
            config.influx_password = non_empty(Some(password));
        }
    }
    if allows("BRIDGE_INFLUX_MEASUREMENT") {
        if let Some(measurement) = non_empty(overrides.influx_measurement.as_deref()) {
            config.influx_measurement = measurement;
        }
    }
    if allows("BRIDGE_WRITE_MAX_ATTEMPTS") {
        if let Some(value) = overrides.write_max_attempts.filter(|v| *v != 0) {
            config.write_max_attempts = value;
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_namespace: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub mqtt_reconnect_delay_ms: u64,
    pub mqtt_reconnect_max_delay_ms: u64,
    pub mqtt_max_reconnect_attempts: Option<u32>,
    pub influx_url: String,
    pub influx_database: String,
    pub influx_retention_policy: Option<String>,
    pub influx_username: Option<String>,
    pub influx_password: Option<String>,
    pub influx_measurement: String,
    pub influx_timeout_ms: u64,
    pub write_max_attempts: u32,
    pub write_retry_backoff_ms: u64,
    pub write_retry_max_backoff_ms: u64,
    pub max_queue: usize,
    pub status_log_interval_secs: u64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let string = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .unwrap_or_else(|| default.to_string())
        };
        let optional = |key: &str| non_empty(lookup(key).as_deref());
        let number = |key: &str, default: u64| -> Result<u64> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("invalid {key}")),
                None => Ok(default),
            }
        };

        let mqtt_port = u16::try_from(number("BRIDGE_MQTT_PORT", 1883)?)
            .context("BRIDGE_MQTT_PORT out of range")?;
        let mqtt_max_reconnect_attempts = match optional("BRIDGE_MQTT_MAX_RECONNECT_ATTEMPTS") {
            Some(raw) => Some(
                raw.parse::<u32>()
                    .context("invalid BRIDGE_MQTT_MAX_RECONNECT_ATTEMPTS")?,
            ),
            None => None,
        };
        let write_max_attempts = u32::try_from(number("BRIDGE_WRITE_MAX_ATTEMPTS", 3)?)
            .context("BRIDGE_WRITE_MAX_ATTEMPTS out of range")?;
        let max_queue = number("BRIDGE_MAX_QUEUE", 64)? as usize;

        let mut config = Self {
            mqtt_host: string("BRIDGE_MQTT_HOST", "127.0.0.1"),
            mqtt_port,
            mqtt_username: optional("BRIDGE_MQTT_USERNAME"),
            mqtt_password: optional("BRIDGE_MQTT_PASSWORD"),
            mqtt_namespace: string("BRIDGE_MQTT_NAMESPACE", "aquarispark")
                .trim_end_matches('/')
                .to_string(),
            mqtt_keepalive_secs: number("BRIDGE_MQTT_KEEPALIVE_SECS", 60)?,
            mqtt_client_id: string(
                "BRIDGE_MQTT_CLIENT_ID",
                &format!("aquarium-bridge-{}", std::process::id()),
            ),
            mqtt_reconnect_delay_ms: number("BRIDGE_MQTT_RECONNECT_DELAY_MS", 1000)?,
            mqtt_reconnect_max_delay_ms: number("BRIDGE_MQTT_RECONNECT_MAX_DELAY_MS", 30_000)?,
            mqtt_max_reconnect_attempts,
            influx_url: string("BRIDGE_INFLUX_URL", "http://localhost:8086"),
            influx_database: string("BRIDGE_INFLUX_DATABASE", "HomeStats"),
            influx_retention_policy: optional("BRIDGE_INFLUX_RETENTION_POLICY"),
            influx_username: optional("BRIDGE_INFLUX_USERNAME"),
            influx_password: optional("BRIDGE_INFLUX_PASSWORD"),
            influx_measurement: string("BRIDGE_INFLUX_MEASUREMENT", "Aquarispark"),
            influx_timeout_ms: number("BRIDGE_INFLUX_TIMEOUT_MS", 5000)?,
            write_max_attempts,
            write_retry_backoff_ms: number("BRIDGE_WRITE_RETRY_BACKOFF_MS", 500)?,
            write_retry_max_backoff_ms: number("BRIDGE_WRITE_RETRY_MAX_BACKOFF_MS", 10_000)?,
            max_queue,
            status_log_interval_secs: number("BRIDGE_STATUS_LOG_INTERVAL_SECS", 60)?,
            otlp_endpoint: optional("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        let setup_path = setup_config_path(&lookup);
        if let Some(overrides) = load_setup_config_overrides(&setup_path) {
            apply_setup_overrides(&mut config, &overrides, |key| {
                non_empty(lookup(key).as_deref()).is_some()
            });
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.mqtt_namespace.is_empty() {
            return Err(anyhow!("BRIDGE_MQTT_NAMESPACE must not be empty"));
        }
        if self.influx_database.is_empty() {
            return Err(anyhow!("BRIDGE_INFLUX_DATABASE must not be empty"));
        }
        if self.influx_measurement.is_empty() {
            return Err(anyhow!("BRIDGE_INFLUX_MEASUREMENT must not be empty"));
        }
        if self.max_queue == 0 {
            return Err(anyhow!("BRIDGE_MAX_QUEUE must be at least 1"));
        }
        Ok(())
    }

    pub fn topic_filter(&self) -> String {
        format!("{}/#", self.mqtt_namespace)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.mqtt_reconnect_delay_ms),
            max_delay: Duration::from_millis(
                self.mqtt_reconnect_max_delay_ms
                    .max(self.mqtt_reconnect_delay_ms),
            ),
            max_attempts: self.mqtt_max_reconnect_attempts,
        }
    }

    pub fn write_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.write_max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.write_retry_backoff_ms),
            max_backoff: Duration::from_millis(
                self.write_retry_max_backoff_ms
                    .max(self.write_retry_backoff_ms),
            ),
        }
    }

    pub fn influx_settings(&self) -> InfluxSettings {
        InfluxSettings {
            url: self.influx_url.clone(),
            database: self.influx_database.clone(),
            retention_policy: self.influx_retention_policy.clone(),
            username: self.influx_username.clone(),
            password: self.influx_password.clone(),
            timeout: Duration::from_millis(self.influx_timeout_ms),
        }
    }

    pub fn status_log_interval(&self) -> Duration {
        Duration::from_secs(self.status_log_interval_secs.max(1))
    }
}
