//! # Emulated Oven
//!
//! An in-process PizzaBot peripheral behind the [`TransportGateway`] trait.
//!
//! It behaves like the firmware as far as the phone side can tell:
//!
//! - emits `Characteristic found!` once connected
//! - sends a charge status line right after notifications are enabled
//! - echoes every write back as a notification
//! - honours `P_MODE_ON`/`P_MODE_OFF`, `LEVEL<n>`, `CALC<n>`, `AUTO_MODE<n>`
//!   and `SYNC|..`
//! - on each [`tick`](EmulatedOven::tick) emits a `V.. R.. L.. B..` line;
//!   while Pizza Mode is on the oven light fades and `LDR!` is sent once
//!   it crosses the threshold
//! - reports `Disconnected` only when the link drops
//!   ([`drop_link`](EmulatedOven::drop_link)), never for a requested disconnect
//!
//! Battery flag follows the common firmware convention: `B0` charging,
//! `B1` not charging.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::gateway::{DiscoveredDevice, Endpoint, EventReceiver, GatewayEvent, TransportGateway};
use crate::config::EmulatorConfig;
use crate::error::{PizzabotError, Result};
use crate::wire::encoder::Command;
use crate::wire::protocol::{STATUS_CHARACTERISTIC_FOUND, STATUS_DISCONNECTED};

/// Light level of a lit oven, percent
const OVEN_LIGHT_ON: f64 = 85.0;

/// Light lost per tick once Pizza Mode is on
const LIGHT_FADE_PER_TICK: f64 = 7.5;

/// Battery drain per tick while not charging, volts
const VOLTAGE_DRAIN_PER_TICK: f64 = 0.005;

const VOLTAGE_FULL: f64 = 3.9;
const VOLTAGE_EMPTY: f64 = 1.0;

#[derive(Debug)]
struct OvenState {
    connected: bool,
    subscribed: bool,
    led: bool,
    pizza_mode: bool,
    auto_mode: bool,
    threshold: f64,
    baseline: f64,
    alarm_sent: bool,
    voltage: f64,
    light: f64,
    charging: bool,
    ticks: u64,
}

impl Default for OvenState {
    fn default() -> Self {
        Self {
            connected: false,
            subscribed: false,
            led: false,
            pizza_mode: false,
            auto_mode: false,
            threshold: 10.0,
            baseline: OVEN_LIGHT_ON,
            alarm_sent: false,
            voltage: VOLTAGE_FULL,
            light: OVEN_LIGHT_ON,
            charging: false,
            ticks: 0,
        }
    }
}

impl OvenState {
    fn alarm_level(&self) -> f64 {
        if self.auto_mode {
            self.baseline * self.threshold / 100.0
        } else {
            self.threshold
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::LedOn => self.led = true,
            Command::LedOff => self.led = false,
            Command::PizzaModeOn => {
                self.pizza_mode = true;
                self.alarm_sent = false;
                self.baseline = self.light;
            }
            Command::PizzaModeOff => {
                self.pizza_mode = false;
                // Oven switched back on for the next bake
                self.light = OVEN_LIGHT_ON;
            }
            Command::Level(value) => {
                self.threshold = value;
                self.auto_mode = false;
            }
            Command::Calc(value) => {
                self.threshold = value;
                self.auto_mode = true;
            }
            Command::AutoMode(on) => self.auto_mode = on,
            Command::Sync { threshold, auto_mode } => {
                self.threshold = threshold;
                self.auto_mode = auto_mode;
            }
        }
    }

    fn telemetry_line(&self) -> String {
        let rssi = -55 - (self.ticks % 10) as i32;
        format!(
            "V{:.2} R{} L{:.0} B{}",
            self.voltage,
            rssi,
            self.light,
            if self.charging { 0 } else { 1 }
        )
    }
}

/// Simulated PizzaBot peripheral.
pub struct EmulatedOven {
    address: String,
    name: String,
    state: Mutex<OvenState>,
    sender: mpsc::UnboundedSender<GatewayEvent>,
    receiver: Mutex<Option<EventReceiver>>,
}

impl std::fmt::Debug for EmulatedOven {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedOven")
            .field("address", &self.address)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl EmulatedOven {
    pub fn new(config: &EmulatorConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            address: config.address.clone(),
            name: config.name.clone(),
            state: Mutex::new(OvenState::default()),
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the emulated LED is lit
    pub fn led(&self) -> bool {
        self.state().led
    }

    /// Whether the emulated firmware has Pizza Mode on
    pub fn pizza_mode(&self) -> bool {
        self.state().pizza_mode
    }

    /// Threshold and auto mode as last written by the phone side
    pub fn threshold(&self) -> (f64, bool) {
        let state = self.state();
        (state.threshold, state.auto_mode)
    }

    pub fn set_charging(&self, charging: bool) {
        self.state().charging = charging;
    }

    pub fn set_voltage(&self, voltage: f64) {
        self.state().voltage = voltage;
    }

    pub fn set_light(&self, light: f64) {
        self.state().light = light;
    }

    /// Simulate the link dropping from the peripheral side
    pub fn drop_link(&self) {
        let was_connected = {
            let mut state = self.state();
            let was = state.connected;
            state.connected = false;
            state.subscribed = false;
            was
        };
        if was_connected {
            info!("Emulated oven dropped the link");
            self.emit(GatewayEvent::status(STATUS_DISCONNECTED));
        }
    }

    /// Advance the simulation by one step and emit telemetry if subscribed.
    pub fn tick(&self) {
        let mut lines = Vec::new();
        {
            let mut state = self.state();
            state.ticks += 1;

            if state.charging {
                state.voltage = (state.voltage + VOLTAGE_DRAIN_PER_TICK).min(VOLTAGE_FULL);
            } else {
                state.voltage = (state.voltage - VOLTAGE_DRAIN_PER_TICK).max(VOLTAGE_EMPTY);
            }

            if state.pizza_mode {
                state.light = (state.light - LIGHT_FADE_PER_TICK).max(0.0);
            }

            if !state.subscribed {
                return;
            }

            lines.push(state.telemetry_line());

            if state.pizza_mode && !state.alarm_sent && state.light < state.alarm_level() {
                state.alarm_sent = true;
                lines.push("LDR!".to_string());
            }
        }

        for line in lines {
            self.emit(GatewayEvent::message(line));
        }
    }

    /// Tick forever at `period`.
    pub async fn run_ticker(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            self.tick();
        }
    }

    fn state(&self) -> MutexGuard<'_, OvenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: GatewayEvent) {
        if self.sender.send(event).is_err() {
            debug!("Emulated oven event dropped, no receiver");
        }
    }

    fn require_connected(&self) -> Result<()> {
        if self.state().connected {
            Ok(())
        } else {
            Err(PizzabotError::Transport("Device not connected".to_string()))
        }
    }
}

#[async_trait]
impl TransportGateway for EmulatedOven {
    async fn connect(&self, device_id: &str) -> Result<String> {
        if !device_id.eq_ignore_ascii_case(&self.address) {
            return Err(PizzabotError::Transport(format!("Device {} not found", device_id)));
        }

        self.state().connected = true;
        info!("Emulated oven connected");
        self.emit(GatewayEvent::status(STATUS_CHARACTERISTIC_FOUND));
        Ok(format!("Connected to {}", self.name))
    }

    async fn disconnect(&self) -> Result<String> {
        self.require_connected()?;
        {
            let mut state = self.state();
            state.connected = false;
            state.subscribed = false;
        }
        // Only a dropped link is reported as a status
        Ok("Disconnected".to_string())
    }

    async fn subscribe(&self, _endpoint: &Endpoint) -> Result<String> {
        self.require_connected()?;
        let charging = {
            let mut state = self.state();
            state.subscribed = true;
            state.charging
        };
        let status = if charging { "Charging" } else { "Not Charging" };
        self.emit(GatewayEvent::message(status));
        Ok("Notifications enabled".to_string())
    }

    async fn unsubscribe(&self, _endpoint: &Endpoint) -> Result<String> {
        self.require_connected()?;
        self.state().subscribed = false;
        Ok("Notifications disabled".to_string())
    }

    async fn write(&self, _endpoint: &Endpoint, text: &str) -> Result<String> {
        self.require_connected()?;
        let subscribed = {
            let mut state = self.state();
            if let Some(command) = Command::parse(text) {
                state.apply(command);
            }
            state.subscribed
        };
        if subscribed {
            self.emit(GatewayEvent::message(text));
        }
        Ok(format!("Wrote {} bytes", text.len()))
    }

    async fn scan(&self) -> Result<String> {
        self.emit(GatewayEvent::DeviceFound(DiscoveredDevice {
            name: self.name.clone(),
            address: self.address.clone(),
        }));
        Ok("Scan started".to_string())
    }

    fn stop_scan(&self) {
        debug!("Emulated scan stopped");
    }

    fn take_events(&self) -> Option<EventReceiver> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BleConfig;
    use crate::wire::decoder::Decoder;

    fn oven() -> (EmulatedOven, EventReceiver) {
        let oven = EmulatedOven::new(&EmulatorConfig::default());
        let events = oven.take_events().unwrap();
        (oven, events)
    }

    fn drain(events: &mut EventReceiver) -> Vec<GatewayEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn endpoint() -> Endpoint {
        Endpoint::from(&BleConfig::default())
    }

    #[tokio::test]
    async fn test_connect_unknown_device_fails() {
        let (oven, _events) = oven();
        let result = oven.connect("00:00:00:00:00:00").await;
        assert!(matches!(result, Err(PizzabotError::Transport(_))));
    }

    #[tokio::test]
    async fn test_connect_reports_characteristic() {
        let (oven, mut events) = oven();
        oven.connect("94:a9:90:48:02:fa").await.unwrap();
        assert_eq!(drain(&mut events), vec![GatewayEvent::status(STATUS_CHARACTERISTIC_FOUND)]);
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let (oven, _events) = oven();
        assert!(oven.write(&endpoint(), "LED_ON").await.is_err());
    }

    #[tokio::test]
    async fn test_subscribe_sends_charge_status_and_echoes_writes() {
        let (oven, mut events) = oven();
        oven.connect("94:A9:90:48:02:FA").await.unwrap();
        oven.subscribe(&endpoint()).await.unwrap();
        oven.write(&endpoint(), "LED_ON").await.unwrap();

        let events = drain(&mut events);
        assert_eq!(events[1], GatewayEvent::message("Not Charging"));
        assert_eq!(events[2], GatewayEvent::message("LED_ON"));
        assert!(oven.led());
    }

    #[tokio::test]
    async fn test_threshold_commands_are_applied() {
        let (oven, _events) = oven();
        oven.connect("94:A9:90:48:02:FA").await.unwrap();
        oven.write(&endpoint(), "CALC40").await.unwrap();
        assert_eq!(oven.threshold(), (40.0, true));
        oven.write(&endpoint(), "SYNC|L25|A0").await.unwrap();
        assert_eq!(oven.threshold(), (25.0, false));
    }

    #[tokio::test]
    async fn test_tick_silent_until_subscribed() {
        let (oven, mut events) = oven();
        oven.tick();
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_pizza_mode_fades_light_and_sends_alarm_once() {
        let (oven, mut events) = oven();
        oven.connect("94:A9:90:48:02:FA").await.unwrap();
        oven.subscribe(&endpoint()).await.unwrap();
        oven.write(&endpoint(), "LEVEL50").await.unwrap();
        oven.write(&endpoint(), "P_MODE_ON").await.unwrap();
        drain(&mut events);

        for _ in 0..20 {
            oven.tick();
        }
        let alarms = drain(&mut events)
            .into_iter()
            .filter(|e| *e == GatewayEvent::message("LDR!"))
            .count();
        assert_eq!(alarms, 1);
    }

    #[tokio::test]
    async fn test_telemetry_line_format() {
        let (oven, mut events) = oven();
        oven.connect("94:A9:90:48:02:FA").await.unwrap();
        oven.subscribe(&endpoint()).await.unwrap();
        oven.set_voltage(3.7);
        oven.set_charging(true);
        drain(&mut events);

        oven.tick();
        let line = match drain(&mut events).pop() {
            Some(GatewayEvent::Notification { message: Some(line), .. }) => line,
            other => panic!("Expected telemetry, got: {:?}", other),
        };
        let frame = Decoder::default().parse_frame(&line);
        assert!((frame.voltage.unwrap() - 3.7).abs() < 0.02, "unexpected line {}", line);
        assert_eq!(frame.rssi, Some(-56));
        assert_eq!(frame.light_level_percent, Some(85.0));
        assert_eq!(frame.charging, Some(true));
    }

    #[tokio::test]
    async fn test_scan_reports_itself() {
        let (oven, mut events) = oven();
        oven.scan().await.unwrap();
        assert_eq!(
            drain(&mut events),
            vec![GatewayEvent::DeviceFound(DiscoveredDevice {
                name: "PizzaBot".to_string(),
                address: "94:A9:90:48:02:FA".to_string(),
            })]
        );
    }

    #[tokio::test]
    async fn test_local_disconnect_emits_nothing() {
        let (oven, mut events) = oven();
        oven.connect("94:A9:90:48:02:FA").await.unwrap();
        oven.subscribe(&endpoint()).await.unwrap();
        drain(&mut events);

        assert_eq!(oven.disconnect().await.unwrap(), "Disconnected");
        assert!(drain(&mut events).is_empty());

        // Nothing left to drop
        oven.drop_link();
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_drop_link_emits_disconnected_once() {
        let (oven, mut events) = oven();
        oven.connect("94:A9:90:48:02:FA").await.unwrap();
        drain(&mut events);

        oven.drop_link();
        oven.drop_link();
        assert_eq!(drain(&mut events), vec![GatewayEvent::status(STATUS_DISCONNECTED)]);
    }
}
