//! # Wire Protocol Constants and Types
//!
//! Core definitions for the PizzaBot text notification format.

use serde::Serialize;

use super::encoder::Command;

/// Status text the transport emits once the notify characteristic is discovered
pub const STATUS_CHARACTERISTIC_FOUND: &str = "Characteristic found!";

/// Status text the transport emits when the link drops
pub const STATUS_DISCONNECTED: &str = "Disconnected";

/// Out-of-band token the firmware sends when it decides the oven light went out
pub const ALARM_TRIGGER_TOKEN: &str = "LDR!";

/// Marker present in both "Charging" and "Not Charging" status lines
pub const CHARGE_STATUS_TOKEN: &str = "Charging";

/// Voltage token prefix (`V3.7`)
pub const TOKEN_VOLTAGE: u8 = b'V';

/// RSSI token prefix (`R-60`)
pub const TOKEN_RSSI: u8 = b'R';

/// Light level token prefix (`L85`)
pub const TOKEN_LIGHT: u8 = b'L';

/// Charging flag token prefix (`B0`)
pub const TOKEN_BATTERY: u8 = b'B';

/// One decoded telemetry line.
///
/// A field is `None` when its token is absent or could not be parsed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorFrame {
    /// Battery voltage in volts
    pub voltage: Option<f64>,

    /// Link RSSI in dBm
    pub rssi: Option<i32>,

    /// Ambient light level in percent
    pub light_level_percent: Option<f64>,

    /// Whether the peripheral reports it is charging
    pub charging: Option<bool>,

    /// The line this frame was decoded from
    pub raw: String,
}

impl SensorFrame {
    /// Returns true if no field could be extracted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.voltage.is_none()
            && self.rssi.is_none()
            && self.light_level_percent.is_none()
            && self.charging.is_none()
    }
}

/// Classification of one inbound notification message.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Whitespace only; dropped
    Empty,

    /// `LDR!` alarm pushed by the firmware
    AlarmTrigger,

    /// Textual charge status line ("Charging" / "Not Charging")
    ChargeStatus {
        charging: bool,
        text: String,
    },

    /// The peripheral echoing one of our commands back
    Echo(Command),

    /// A telemetry line with at least one field
    Frame(SensorFrame),

    /// Anything else, forwarded to the message log verbatim
    Unparsed(String),
}

/// Classification of the `status` field of a gateway event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusSignal {
    CharacteristicFound,
    Disconnected,
    Other(String),
}
