#![allow(dead_code)]
//! Process-level application configuration (§6a), loaded from TOML +
//! environment via `figment` and validated with `validator`. Distinct from
//! the persisted on-device configuration record of `src/device_config.rs`,
//! which mirrors the original firmware's NVS-backed `struct config` layout
//! rather than a 12-factor-style process config.

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub hardware: HardwareConfig,

    #[validate(nested)]
    pub pilot: PilotConfig,

    #[validate(nested)]
    pub safety: SafetyConfig,

    #[validate(nested)]
    pub connector: ConnectorConfig,

    #[validate(nested)]
    pub ocpp: OcppConfig,

    #[validate(nested)]
    pub network: NetworkConfig,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

/// Selects the hardware backend; mirrors `hardware::EvseHardwareMode`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    Simulated,
}

fn default_hardware_mode() -> HardwareMode {
    HardwareMode::Simulated
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct HardwareConfig {
    #[serde(default = "default_hardware_mode")]
    pub mode: HardwareMode,

    #[validate(range(min = 1))]
    pub connector_count: u8,
}

/// Overrides for `pilot::PilotParams::default()`; any field left unset at
/// the config layer falls back to the compiled-in default.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PilotConfig {
    #[serde(default = "default_scan_interval_ms")]
    #[validate(range(min = 1, max = 1000))]
    pub scan_interval_ms: u16,

    #[serde(default = "default_sample_count")]
    #[validate(range(min = 10, max = 5000))]
    pub sample_count: u16,
}

fn default_scan_interval_ms() -> u16 {
    10
}
fn default_sample_count() -> u16 {
    500
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self { scan_interval_ms: default_scan_interval_ms(), sample_count: default_sample_count() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SafetyConfig {
    #[validate(range(min = 1, max = 400))]
    pub expected_input_frequency_hz: u16,

    #[serde(default)]
    pub expected_output_frequency_hz: Option<u16>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self { expected_input_frequency_hz: 60, expected_output_frequency_hz: None }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ConnectorConfig {
    #[serde(default = "default_connection_timeout_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub connection_timeout_secs: u64,

    #[serde(default = "default_meter_value_sample_interval_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub meter_value_sample_interval_secs: u64,

    #[serde(default)]
    pub clock_aligned_data_interval_secs: Option<u64>,
}

fn default_connection_timeout_secs() -> u64 {
    60
}
fn default_meter_value_sample_interval_secs() -> u64 {
    60
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_connection_timeout_secs(),
            meter_value_sample_interval_secs: default_meter_value_sample_interval_secs(),
            clock_aligned_data_interval_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct OcppConfig {
    #[validate(url)]
    pub server_url: String,

    #[validate(length(min = 1))]
    pub charge_point_id: String,

    #[serde(default = "default_heartbeat_interval_secs")]
    #[validate(range(min = 5, max = 86400))]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_ws_ping_interval_secs")]
    pub ws_ping_interval_secs: u64,

    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    #[serde(default = "default_message_retry_interval_secs")]
    pub transaction_message_retry_interval_secs: u64,

    #[serde(default = "default_message_retry_attempts")]
    pub transaction_message_attempts: u32,

    #[serde(default)]
    pub local_pre_authorize: bool,

    #[serde(default)]
    pub local_authorize_offline: bool,

    #[serde(default)]
    pub allow_offline_tx_for_unknown_id: bool,

    #[serde(default)]
    pub authorize_remote_tx_requests: bool,
}

fn default_heartbeat_interval_secs() -> u64 {
    300
}
fn default_ws_ping_interval_secs() -> u64 {
    300
}
fn default_write_timeout_secs() -> u64 {
    8
}
fn default_message_retry_interval_secs() -> u64 {
    60
}
fn default_message_retry_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct NetworkConfig {
    #[serde(default = "default_connect_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// NTP server (`host:port`) queried once per connection, mirroring
    /// `ntp_start()` in the reference firmware (spec §4.7 "Time sync").
    #[serde(default = "default_ntp_server_addr")]
    pub ntp_server_addr: String,
}

fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_max_backoff_secs() -> u64 {
    300
}
fn default_max_attempts() -> u32 {
    200
}
fn default_health_check_interval_secs() -> u64 {
    60
}
fn default_ntp_server_addr() -> String {
    "pool.ntp.org:123".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            max_attempts: default_max_attempts(),
            health_check_interval_secs: default_health_check_interval_secs(),
            ntp_server_addr: default_ntp_server_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { log_level: default_log_level(), log_json: false }
    }
}

impl AppConfig {
    /// Loads configuration from `config/default.toml`, an optional
    /// environment-specific overlay, then `EVSE__`-prefixed environment
    /// variables (later sources override earlier ones).
    pub fn load() -> Result<Self> {
        Self::load_with_env(None)
    }

    pub fn load_with_env(environment: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config/default.toml"));

        if let Some(env) = environment {
            figment = figment.merge(Toml::file(format!("config/{env}.toml")));
        } else {
            figment = figment.merge(Toml::file("config/development.toml").nested());
        }

        figment = figment.merge(Env::prefixed("EVSE__").split("__"));

        let config: AppConfig = figment.extract().context("failed to parse configuration")?;
        config.validate().context("configuration validation failed")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_network_config_is_valid() {
        assert!(NetworkConfig::default().validate().is_ok());
    }

    #[test]
    fn default_connector_config_is_valid() {
        assert!(ConnectorConfig::default().validate().is_ok());
    }

    #[test]
    fn ocpp_config_rejects_non_url_server() {
        let config = OcppConfig {
            server_url: "not-a-url".into(),
            charge_point_id: "CP001".into(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            ws_ping_interval_secs: default_ws_ping_interval_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            transaction_message_retry_interval_secs: default_message_retry_interval_secs(),
            transaction_message_attempts: default_message_retry_attempts(),
            local_pre_authorize: false,
            local_authorize_offline: false,
            allow_offline_tx_for_unknown_id: false,
            authorize_remote_tx_requests: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn hardware_config_requires_at_least_one_connector() {
        let config = HardwareConfig { mode: HardwareMode::Simulated, connector_count: 0 };
        assert!(config.validate().is_err());
    }
}
