//! # Telemetry Policy Engine
//!
//! Consumes decoded frames, keeps the [`TelemetrySnapshot`] current and
//! applies the two alarm policies:
//!
//! - **Low voltage**: a reading below [`LOW_VOLTAGE_THRESHOLD`] counts a
//!   strike; once [`LOW_VOLTAGE_STRIKES`] are counted the next low reading
//!   raises [`AlertEvent::LowBattery`] and latches until acknowledged.
//!   Single noisy readings never alarm.
//! - **Pizza light alarm**: while Pizza Mode is on, a light level below the
//!   threshold fires immediately, turns Pizza Mode off and asks for
//!   `P_MODE_OFF` to be sent. The firmware's `LDR!` token takes the same
//!   path.
//!
//! Pizza Mode and the threshold are passed in on every call; the engine
//! keeps no copy of either.
//!
//! ## Usage
//!
//! ```
//! use pizzabot::alerts::AlertEvent;
//! use pizzabot::telemetry::policy::{PizzaMode, PolicyAction, PolicyEngine};
//! use pizzabot::wire::decoder::Decoder;
//!
//! let decoder = Decoder::default();
//! let mut engine = PolicyEngine::new();
//! let mut pizza = PizzaMode::On;
//!
//! let actions = engine.ingest(&decoder.parse_frame("V3.9 L20"), &mut pizza, Some(50.0));
//! assert!(actions.contains(&PolicyAction::Alert(AlertEvent::Pizza)));
//! assert_eq!(pizza, PizzaMode::Off);
//! ```

use serde::Serialize;
use tracing::{debug, info};

use super::alarm::{AlarmCounter, StrikeOutcome};
use super::snapshot::TelemetrySnapshot;
use crate::alerts::AlertEvent;
use crate::wire::encoder::Command;
use crate::wire::protocol::SensorFrame;

/// Readings below this voltage count as low-battery strikes
pub const LOW_VOLTAGE_THRESHOLD: f64 = 1.4;

/// Strikes counted before the next low reading raises the alarm
pub const LOW_VOLTAGE_STRIKES: u32 = 2;

/// Log line emitted for every counted low-voltage reading
pub const LOW_VOLTAGE_NOTICE: &str = "Low voltage detected!";

/// User intent to be alerted when the oven light goes out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum PizzaMode {
    On,
    #[default]
    Off,
}

impl PizzaMode {
    #[must_use]
    pub fn is_on(self) -> bool {
        self == PizzaMode::On
    }
}

impl From<bool> for PizzaMode {
    fn from(on: bool) -> Self {
        if on { PizzaMode::On } else { PizzaMode::Off }
    }
}

/// Something the caller must do as a result of ingesting telemetry.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyAction {
    /// Raise a user-facing alert
    Alert(AlertEvent),
    /// Write a command to the peripheral
    Send(Command),
    /// Append a line to the message log
    Notice(&'static str),
}

/// Stateful alarm policy over the telemetry stream.
#[derive(Debug, Default)]
pub struct PolicyEngine {
    snapshot: TelemetrySnapshot,
    voltage_alarm: AlarmCounter,
    light_alarm: AlarmCounter,
}

impl PolicyEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest known sensor values.
    #[must_use]
    pub fn snapshot(&self) -> &TelemetrySnapshot {
        &self.snapshot
    }

    /// Low-voltage alarm state.
    #[must_use]
    pub fn voltage_alarm(&self) -> AlarmCounter {
        self.voltage_alarm
    }

    /// Light-threshold alarm state.
    #[must_use]
    pub fn light_alarm(&self) -> AlarmCounter {
        self.light_alarm
    }

    /// Ingest one decoded frame.
    ///
    /// # Arguments
    ///
    /// * `frame` - Frame with at least one field present
    /// * `pizza_mode` - Current Pizza Mode; switched off if the light alarm fires
    /// * `threshold` - Effective light threshold in percent, `None` if unknown
    pub fn ingest(
        &mut self,
        frame: &SensorFrame,
        pizza_mode: &mut PizzaMode,
        threshold: Option<f64>,
    ) -> Vec<PolicyAction> {
        self.snapshot.apply(frame);

        let mut actions = Vec::new();

        if let (Some(light), Some(threshold)) = (frame.light_level_percent, threshold) {
            if pizza_mode.is_on() && light < threshold {
                info!("Light level {}% below threshold {}%", light, threshold);
                self.fire_light_alarm(pizza_mode, &mut actions);
            }
        }

        if let Some(voltage) = frame.voltage {
            if voltage < LOW_VOLTAGE_THRESHOLD && !self.voltage_alarm.is_latched() {
                actions.push(PolicyAction::Notice(LOW_VOLTAGE_NOTICE));
                match self.voltage_alarm.strike(LOW_VOLTAGE_STRIKES) {
                    StrikeOutcome::Fired => {
                        info!("Low battery alarm fired at {:.2} V", voltage);
                        actions.push(PolicyAction::Alert(AlertEvent::LowBattery));
                    }
                    StrikeOutcome::Counted => {
                        debug!("Low voltage strike {} at {:.2} V", self.voltage_alarm.strikes, voltage);
                    }
                    StrikeOutcome::Suppressed => {}
                }
            }
        }

        actions
    }

    /// Handle the firmware's `LDR!` alarm token.
    ///
    /// Fires at most once per arming: a second trigger, or one arriving after
    /// the phone-side threshold check already fired, is suppressed until
    /// [`rearm_light_alarm`](Self::rearm_light_alarm).
    pub fn ingest_alarm_trigger(&mut self, pizza_mode: &mut PizzaMode) -> Vec<PolicyAction> {
        let mut actions = Vec::new();
        if self.light_alarm.is_latched() {
            debug!("Alarm trigger ignored, light alarm already fired");
        } else {
            self.fire_light_alarm(pizza_mode, &mut actions);
        }
        actions
    }

    /// Record a textual charge status. Never alerts.
    pub fn ingest_charge_status(&mut self, is_charging: bool) {
        self.snapshot.charging = Some(is_charging);
    }

    /// The user dismissed the low-battery notification.
    pub fn acknowledge_low_battery_alert(&mut self) {
        self.voltage_alarm.acknowledge();
    }

    /// Allow the light alarm to fire again (Pizza Mode was switched on).
    pub fn rearm_light_alarm(&mut self) {
        self.light_alarm.acknowledge();
    }

    /// Forget everything learned during the session that just ended.
    pub fn reset_on_disconnect(&mut self) {
        self.snapshot = TelemetrySnapshot::default();
        self.voltage_alarm = AlarmCounter::default();
        self.light_alarm = AlarmCounter::default();
    }

    fn fire_light_alarm(&mut self, pizza_mode: &mut PizzaMode, actions: &mut Vec<PolicyAction>) {
        // One-shot: limit 0 fires on the first strike
        if self.light_alarm.strike(0) != StrikeOutcome::Fired {
            return;
        }
        *pizza_mode = PizzaMode::Off;
        actions.push(PolicyAction::Alert(AlertEvent::Pizza));
        actions.push(PolicyAction::Send(Command::PizzaModeOff));
    }
}
