//! Read-only presentation snapshot.

use std::fmt;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::error::Result;
use crate::session::ConnectionState;
use crate::telemetry::alarm::AlarmCounter;
use crate::telemetry::policy::PizzaMode;
use crate::telemetry::snapshot::TelemetrySnapshot;
use crate::transport::DiscoveredDevice;

/// Everything a presentation layer needs, copied out under the locks.
///
/// Building one never blocks on the gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateView {
    pub connection_state: ConnectionState,
    pub is_connected: bool,
    pub is_subscribed: bool,
    pub device_id: Option<String>,
    pub connected_at: Option<DateTime<Local>>,
    /// Live session length, `"1h 2m 3s"`
    pub uptime: Option<String>,

    pub telemetry: TelemetrySnapshot,
    pub voltage_alarm: AlarmCounter,
    pub light_alarm: AlarmCounter,

    pub pizza_mode: PizzaMode,
    pub threshold: f64,
    pub auto_mode: bool,
    /// Light level that trips the alarm; `None` in auto mode before a baseline is known
    pub effective_threshold: Option<f64>,

    pub auto_connect: bool,
    pub last_device: Option<String>,

    pub scanning: bool,
    pub devices: Vec<DiscoveredDevice>,

    pub messages: Vec<String>,
    pub connection_log: Vec<String>,
}

impl StateView {
    /// Most recent message log entry
    pub fn latest_message(&self) -> Option<&str> {
        self.messages.last().map(String::as_str)
    }

    /// Pretty JSON dump
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn or_unknown<T: fmt::Display>(value: Option<T>, unit: &str) -> String {
    match value {
        Some(v) => format!("{}{}", v, unit),
        None => "Unknown".to_string(),
    }
}

impl fmt::Display for StateView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "State: {} ({})",
            self.connection_state,
            self.device_id.as_deref().unwrap_or("no device")
        )?;
        if let Some(uptime) = &self.uptime {
            writeln!(f, "Uptime: {}", uptime)?;
        }
        writeln!(
            f,
            "Voltage: {}  RSSI: {}  Light: {}  Charging: {}",
            or_unknown(self.telemetry.voltage, " V"),
            or_unknown(self.telemetry.rssi, " dBm"),
            or_unknown(self.telemetry.light_level_percent, " %"),
            or_unknown(self.telemetry.charging, "")
        )?;
        writeln!(
            f,
            "Pizza Mode: {:?}  Threshold: {}{}  Auto-connect: {}",
            self.pizza_mode,
            self.threshold,
            if self.auto_mode { "% of ambient" } else { " %" },
            self.auto_connect
        )?;
        if self.voltage_alarm.armed {
            writeln!(f, "Low battery alert active (ack to clear)")?;
        }
        if !self.devices.is_empty() {
            writeln!(f, "Devices:")?;
            for device in &self.devices {
                writeln!(f, "  {} {}", device.address, device.name)?;
            }
        }
        write!(f, "Last message: {}", self.latest_message().unwrap_or("-"))
    }
}
