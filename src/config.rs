//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::Deserialize;
use serde::de::Error;
use std::fs;
use std::path::Path;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub ble: BleConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub emulator: EmulatorConfig,
}

/// BLE link configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BleConfig {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,

    #[serde(default = "default_characteristic_uuid")]
    pub characteristic_uuid: String,

    /// How long a scan runs before stop-scan is issued
    #[serde(default = "default_scan_duration_ms")]
    pub scan_duration_ms: u64,

    /// Settle time between a charge-status line and the SYNC write
    #[serde(default = "default_sync_delay_ms")]
    pub sync_delay_ms: u64,

    /// Address used when no device was ever connected
    #[serde(default)]
    pub default_device: String,
}

/// Telemetry decoding configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    /// Which `B<digit>` value the firmware uses for "charging"
    #[serde(default = "default_charging_digit")]
    pub charging_digit: u8,

    #[serde(default = "default_message_log_capacity")]
    pub message_log_capacity: usize,
}

/// Persisted settings configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SettingsConfig {
    #[serde(default = "default_store_path")]
    pub store_path: String,

    #[serde(default = "default_threshold")]
    pub default_threshold: f64,

    #[serde(default)]
    pub auto_mode: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for rolling log files; empty disables file logging
    #[serde(default)]
    pub log_dir: String,
}

/// Emulated peripheral configuration
#[derive(Debug, Deserialize, Clone)]
pub struct EmulatorConfig {
    #[serde(default = "default_emulator_address")]
    pub address: String,

    #[serde(default = "default_emulator_name")]
    pub name: String,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

// Default value functions
fn default_service_uuid() -> String { "4fafc201-1fb5-459e-8fcc-c5c9c331914b".to_string() }
fn default_characteristic_uuid() -> String { "beb5483e-36e1-4688-b7f5-ea07361b26a8".to_string() }
fn default_scan_duration_ms() -> u64 { 10_000 }
fn default_sync_delay_ms() -> u64 { 1_500 }

fn default_charging_digit() -> u8 { 0 }
fn default_message_log_capacity() -> usize { 20 }

fn default_store_path() -> String { "./pizzabot-settings.json".to_string() }
fn default_threshold() -> f64 { 10.0 }

fn default_log_level() -> String { "info".to_string() }

fn default_emulator_address() -> String { "94:A9:90:48:02:FA".to_string() }
fn default_emulator_name() -> String { "PizzaBot".to_string() }
fn default_tick_interval_ms() -> u64 { 1_000 }

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            characteristic_uuid: default_characteristic_uuid(),
            scan_duration_ms: default_scan_duration_ms(),
            sync_delay_ms: default_sync_delay_ms(),
            default_device: String::new(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            charging_digit: default_charging_digit(),
            message_log_capacity: default_message_log_capacity(),
        }
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            default_threshold: default_threshold(),
            auto_mode: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: String::new(),
        }
    }
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            address: default_emulator_address(),
            name: default_emulator_name(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

fn invalid(msg: impl std::fmt::Display) -> crate::error::PizzabotError {
    crate::error::PizzabotError::Config(toml::de::Error::custom(msg))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use pizzabot::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("service_uuid", &self.ble.service_uuid),
            ("characteristic_uuid", &self.ble.characteristic_uuid),
        ] {
            if uuid::Uuid::parse_str(value).is_err() {
                return Err(invalid(format!("{} is not a valid UUID: {:?}", name, value)));
            }
        }

        if self.ble.scan_duration_ms == 0 || self.ble.scan_duration_ms > 120_000 {
            return Err(invalid("scan_duration_ms must be between 1 and 120000"));
        }

        // Zero is allowed: sync immediately
        if self.ble.sync_delay_ms > 10_000 {
            return Err(invalid("sync_delay_ms must be at most 10000"));
        }

        if self.telemetry.charging_digit > 1 {
            return Err(invalid("charging_digit must be 0 or 1"));
        }

        if self.telemetry.message_log_capacity == 0 || self.telemetry.message_log_capacity > 1000 {
            return Err(invalid("message_log_capacity must be between 1 and 1000"));
        }

        if self.settings.store_path.is_empty() {
            return Err(invalid("settings store_path cannot be empty"));
        }

        if !(1.0..=100.0).contains(&self.settings.default_threshold) {
            return Err(invalid("default_threshold must be between 1 and 100"));
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("logging level must be one of: trace, debug, info, warn, error"));
        }

        if self.emulator.address.is_empty() {
            return Err(invalid("emulator address cannot be empty"));
        }

        if self.emulator.tick_interval_ms < 50 || self.emulator.tick_interval_ms > 60_000 {
            return Err(invalid("tick_interval_ms must be between 50 and 60000"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let toml_content = r#"
[ble]
scan_duration_ms = 5000
default_device = "AA:BB:CC:DD:EE:FF"

[telemetry]
charging_digit = 1

[settings]
default_threshold = 42
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.ble.scan_duration_ms, 5000);
        assert_eq!(config.ble.default_device, "AA:BB:CC:DD:EE:FF");
        assert_eq!(config.ble.service_uuid, default_service_uuid());
        assert_eq!(config.telemetry.charging_digit, 1);
        assert_eq!(config.settings.default_threshold, 42.0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_empty_file_uses_defaults() {
        use tempfile::NamedTempFile;

        let temp_file = NamedTempFile::new().unwrap();
        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.telemetry.message_log_capacity, 20);
        assert_eq!(config.emulator.name, "PizzaBot");
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[telemetry]\ncharging_digit = 7\n").unwrap();
        temp_file.flush().unwrap();

        assert!(Config::load(temp_file.path()).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load("/nonexistent/pizzabot.toml").is_err());
    }

    #[test]
    fn test_invalid_service_uuid() {
        let mut config = Config::default();
        config.ble.service_uuid = "not-a-uuid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_characteristic_uuid() {
        let mut config = Config::default();
        config.ble.characteristic_uuid = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scan_duration_zero() {
        let mut config = Config::default();
        config.ble.scan_duration_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scan_duration_too_high() {
        let mut config = Config::default();
        config.ble.scan_duration_ms = 120_001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sync_delay_zero_allowed() {
        let mut config = Config::default();
        config.ble.sync_delay_ms = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sync_delay_too_high() {
        let mut config = Config::default();
        config.ble.sync_delay_ms = 10_001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_valid_charging_digits() {
        for digit in [0u8, 1] {
            let mut config = Config::default();
            config.telemetry.charging_digit = digit;
            assert!(config.validate().is_ok(), "Charging digit {} should be valid", digit);
        }
    }

    #[test]
    fn test_message_log_capacity_zero() {
        let mut config = Config::default();
        config.telemetry.message_log_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_store_path() {
        let mut config = Config::default();
        config.settings.store_path = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_out_of_range() {
        for value in [0.0, 100.5, -3.0] {
            let mut config = Config::default();
            config.settings.default_threshold = value;
            assert!(config.validate().is_err(), "Threshold {} should be rejected", value);
        }
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_emulator_address() {
        let mut config = Config::default();
        config.emulator.address = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tick_interval_too_low() {
        let mut config = Config::default();
        config.emulator.tick_interval_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_functions() {
        assert_eq!(default_service_uuid(), "4fafc201-1fb5-459e-8fcc-c5c9c331914b");
        assert_eq!(default_characteristic_uuid(), "beb5483e-36e1-4688-b7f5-ea07361b26a8");
        assert_eq!(default_scan_duration_ms(), 10_000);
        assert_eq!(default_sync_delay_ms(), 1_500);
        assert_eq!(default_charging_digit(), 0);
        assert_eq!(default_message_log_capacity(), 20);
        assert_eq!(default_store_path(), "./pizzabot-settings.json");
        assert_eq!(default_threshold(), 10.0);
        assert_eq!(default_log_level(), "info");
        assert_eq!(default_emulator_address(), "94:A9:90:48:02:FA");
        assert_eq!(default_tick_interval_ms(), 1_000);
    }
}
