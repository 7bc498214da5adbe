//! Latest-known-good sensor values.

use serde::Serialize;

use crate::wire::protocol::SensorFrame;

/// The most recent value seen for each sensor field.
///
/// Fields update independently: a frame that lacks a field leaves the
/// previous value in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub voltage: Option<f64>,
    pub rssi: Option<i32>,
    pub light_level_percent: Option<f64>,
    pub charging: Option<bool>,
}

impl TelemetrySnapshot {
    /// Overwrite every field the frame carries.
    pub fn apply(&mut self, frame: &SensorFrame) {
        if let Some(voltage) = frame.voltage {
            self.voltage = Some(voltage);
        }
        if let Some(rssi) = frame.rssi {
            self.rssi = Some(rssi);
        }
        if let Some(light) = frame.light_level_percent {
            self.light_level_percent = Some(light);
        }
        if let Some(charging) = frame.charging {
            self.charging = Some(charging);
        }
    }

    /// Returns true once no field is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
