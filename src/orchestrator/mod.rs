//! # Session Orchestrator
//!
//! Composition root for one PizzaBot link. Owns the session machine, the
//! telemetry policy, the user controls (Pizza Mode, threshold, auto mode,
//! auto-connect) and the scan candidates, and is the single owner of the
//! gateway's event stream.
//!
//! This module handles:
//! - Routing inbound status and message text to the session machine and
//!   the policy engine
//! - Carrying out policy actions (alerts, `P_MODE_OFF`)
//! - The delayed `SYNC` write after a charge status line
//! - Loading and persisting user settings
//! - The worker loop serialising events, commands, timers and shutdown
//!
//! Lock order is `controls` before `policy`. No lock is held across an
//! `.await`.

pub mod command;
pub mod view;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertEvent, AlertSink, Cue, PermissionGate};
use crate::config::Config;
use crate::error::{PizzabotError, Result};
use crate::session::uptime::format_duration;
use crate::session::{BoundedLog, ConnectionState, SessionMachine, SessionSummary};
use crate::store::{SettingsStore, KEY_AUTO_CONNECT, KEY_LAST_DEVICE, KEY_THRESHOLD};
use crate::telemetry::policy::{PizzaMode, PolicyAction, PolicyEngine};
use crate::transport::{DiscoveredDevice, Endpoint, EventReceiver, GatewayEvent, TransportGateway};
use crate::wire::decoder::{classify_status, Decoder};
use crate::wire::encoder::Command;
use crate::wire::protocol::{Notification, StatusSignal};

pub use command::{CommandParseError, UserCommand};
pub use view::StateView;

/// Accepted light threshold range, percent
pub const THRESHOLD_RANGE: std::ops::RangeInclusive<f64> = 1.0..=100.0;

/// Connection log capacity
const CONNECTION_LOG_CAPACITY: usize = 50;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[derive(Debug)]
struct Controls {
    pizza_mode: PizzaMode,
    threshold: f64,
    auto_mode: bool,
    auto_connect: bool,
    last_device: Option<String>,
    /// Light level when Pizza Mode was armed, base for auto mode
    ambient_baseline: Option<f64>,
    sync_due: Option<Instant>,
    /// SYNC already sent on this connection
    sync_done: bool,
    auto_connect_evaluated: bool,
}

impl Controls {
    fn effective_threshold(&self) -> Option<f64> {
        if self.auto_mode {
            self.ambient_baseline.map(|base| base * self.threshold / 100.0)
        } else {
            Some(self.threshold)
        }
    }
}

#[derive(Debug, Default)]
struct ScanState {
    scanning: bool,
    deadline: Option<Instant>,
    devices: Vec<DiscoveredDevice>,
}

/// One PizzaBot link and everything derived from it.
pub struct Orchestrator {
    config: Config,
    gateway: Arc<dyn TransportGateway>,
    machine: SessionMachine,
    policy: Mutex<PolicyEngine>,
    decoder: Decoder,
    store: Arc<dyn SettingsStore>,
    alerts: Arc<dyn AlertSink>,
    messages: Arc<BoundedLog>,
    events: Arc<BoundedLog>,
    controls: Mutex<Controls>,
    scan: Mutex<ScanState>,
    subscription: Mutex<Option<EventReceiver>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("machine", &self.machine)
            .field("decoder", &self.decoder)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build the orchestrator and take ownership of the gateway's event stream.
    ///
    /// # Errors
    ///
    /// Returns [`PizzabotError::EventStreamTaken`] if another owner already
    /// took the stream.
    pub fn new(
        config: Config,
        gateway: Arc<dyn TransportGateway>,
        permissions: Arc<dyn PermissionGate>,
        alerts: Arc<dyn AlertSink>,
        store: Arc<dyn SettingsStore>,
    ) -> Result<Self> {
        let subscription = gateway.take_events().ok_or(PizzabotError::EventStreamTaken)?;

        let messages = Arc::new(BoundedLog::new(config.telemetry.message_log_capacity));
        let events = Arc::new(BoundedLog::new(CONNECTION_LOG_CAPACITY));
        let machine = SessionMachine::new(
            gateway.clone(),
            permissions,
            alerts.clone(),
            Endpoint::from(&config.ble),
            messages.clone(),
            events.clone(),
        );

        let controls = Controls {
            pizza_mode: PizzaMode::Off,
            threshold: config.settings.default_threshold,
            auto_mode: config.settings.auto_mode,
            auto_connect: false,
            last_device: None,
            ambient_baseline: None,
            sync_due: None,
            sync_done: false,
            auto_connect_evaluated: false,
        };

        Ok(Self {
            decoder: Decoder::new(config.telemetry.charging_digit),
            config,
            gateway,
            machine,
            policy: Mutex::new(PolicyEngine::new()),
            store,
            alerts,
            messages,
            events,
            controls: Mutex::new(controls),
            scan: Mutex::new(ScanState::default()),
            subscription: Mutex::new(Some(subscription)),
        })
    }

    /// Load persisted settings, then auto-connect once if enabled.
    pub async fn start(&self) {
        self.load_settings().await;
        self.try_auto_connect().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.entries()
    }

    pub fn connection_log(&self) -> Vec<String> {
        self.events.entries()
    }

    /// Route one gateway event: status first, then message.
    ///
    /// A panic while routing is caught here and logged with the raw event;
    /// later events are still processed.
    pub async fn handle_event(&self, event: GatewayEvent) {
        let raw = event.clone();
        if let Err(payload) = AssertUnwindSafe(self.route(event)).catch_unwind().await {
            error!("Panic while handling {:?}: {}", raw, panic_message(payload.as_ref()));
            self.messages.push("Internal error while handling notification");
        }
    }

    async fn route(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::DeviceFound(device) => self.on_device_found(device),
            GatewayEvent::Notification { status, message } => {
                if let Some(status) = status {
                    self.on_status(&status).await;
                }
                if let Some(message) = message {
                    self.on_message(&message).await;
                }
            }
        }
    }

    async fn on_status(&self, status: &str) {
        match classify_status(status) {
            StatusSignal::CharacteristicFound => self.machine.on_characteristic_found().await,
            StatusSignal::Disconnected => {
                if let Some(summary) = self.machine.handle_remote_disconnect() {
                    self.on_disconnected(summary);
                }
            }
            StatusSignal::Other(text) => {
                if !text.is_empty() {
                    self.messages.push(text);
                }
            }
        }
    }

    async fn on_message(&self, raw: &str) {
        match self.decoder.decode(raw) {
            Notification::Empty => {}
            Notification::AlarmTrigger => {
                info!("Alarm trigger from device");
                let actions = {
                    let mut controls = lock(&self.controls);
                    let actions = lock(&self.policy).ingest_alarm_trigger(&mut controls.pizza_mode);
                    if !actions.is_empty() {
                        controls.ambient_baseline = None;
                    }
                    actions
                };
                self.apply(actions).await;
            }
            Notification::ChargeStatus { charging, text } => {
                lock(&self.policy).ingest_charge_status(charging);
                self.messages.push(text);
                self.schedule_sync();
            }
            Notification::Echo(command) => {
                debug!("Device echoed {}", command);
                self.messages.push(command.to_string());
            }
            Notification::Frame(frame) => {
                debug!("Telemetry: {}", frame.raw);
                let actions = {
                    let mut controls = lock(&self.controls);
                    if controls.pizza_mode.is_on()
                        && controls.auto_mode
                        && controls.ambient_baseline.is_none()
                    {
                        controls.ambient_baseline = frame.light_level_percent;
                    }
                    let threshold = controls.effective_threshold();
                    let actions = lock(&self.policy).ingest(&frame, &mut controls.pizza_mode, threshold);
                    if !controls.pizza_mode.is_on() {
                        controls.ambient_baseline = None;
                    }
                    actions
                };
                self.apply(actions).await;
            }
            Notification::Unparsed(text) => self.messages.push(text),
        }
    }

    async fn apply(&self, actions: Vec<PolicyAction>) {
        for action in actions {
            match action {
                PolicyAction::Notice(text) => self.messages.push(text),
                PolicyAction::Alert(event) => {
                    self.messages.push(match event {
                        AlertEvent::LowBattery => "Low Battery!",
                        AlertEvent::Pizza => "Pizza is ready!",
                    });
                    self.alerts.raise(event);
                }
                PolicyAction::Send(command) => {
                    self.machine.send_data(&command.to_string()).await;
                }
            }
        }
    }

    fn on_device_found(&self, device: DiscoveredDevice) {
        let mut scan = lock(&self.scan);
        if !scan.scanning {
            debug!("Ignoring {} outside a scan", device.address);
            return;
        }
        if scan.devices.iter().any(|d| d.address == device.address) {
            return;
        }
        info!("Found {} ({})", device.name, device.address);
        scan.devices.push(device);
    }

    fn on_disconnected(&self, summary: SessionSummary) {
        lock(&self.policy).reset_on_disconnect();
        {
            let mut controls = lock(&self.controls);
            controls.pizza_mode = PizzaMode::Off;
            controls.ambient_baseline = None;
            controls.sync_due = None;
            controls.sync_done = false;
        }
        info!(
            "Session with {} ended",
            summary.device_id.as_deref().unwrap_or("unknown device")
        );
    }

    fn schedule_sync(&self) {
        if !self.machine.is_connected() {
            return;
        }
        let mut controls = lock(&self.controls);
        if controls.sync_done || controls.sync_due.is_some() {
            return;
        }
        let delay = Duration::from_millis(self.config.ble.sync_delay_ms);
        controls.sync_due = Some(Instant::now() + delay);
        debug!("SYNC scheduled in {:?}", delay);
    }

    /// When the pending SYNC write is due, if any.
    pub fn sync_deadline(&self) -> Option<Instant> {
        lock(&self.controls).sync_due
    }

    /// Send the pending SYNC now. Returns true if one was written.
    pub async fn flush_pending_sync(&self) -> bool {
        let command = {
            let mut controls = lock(&self.controls);
            if controls.sync_due.take().is_none() {
                return false;
            }
            controls.sync_done = true;
            Command::Sync {
                threshold: controls.threshold,
                auto_mode: controls.auto_mode,
            }
        };

        if !self.machine.state().can_write() {
            debug!("Dropping {}, link not ready", command);
            return false;
        }
        info!("Syncing settings: {}", command);
        self.machine.send_data(&command.to_string()).await
    }

    async fn load_settings(&self) {
        let last_device = self.read_setting(KEY_LAST_DEVICE).await;
        let auto_connect = self.read_setting(KEY_AUTO_CONNECT).await;
        let threshold = self.read_setting(KEY_THRESHOLD).await;

        let mut controls = lock(&self.controls);
        if let Some(device) = last_device.filter(|d| !d.trim().is_empty()) {
            controls.last_device = Some(device);
        }
        if let Some(flag) = auto_connect {
            controls.auto_connect = flag.trim() == "true";
        }
        match threshold.map(|t| t.trim().parse::<f64>()) {
            Some(Ok(value)) if THRESHOLD_RANGE.contains(&value) => controls.threshold = value,
            Some(_) => warn!("Ignoring stored threshold outside {:?}", THRESHOLD_RANGE),
            None => {}
        }
        info!(
            "Settings loaded: last device {:?}, auto-connect {}, threshold {}",
            controls.last_device, controls.auto_connect, controls.threshold
        );
    }

    async fn read_setting(&self, key: &str) -> Option<String> {
        match self.store.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Reading setting {} failed: {}", key, e);
                self.messages.push(format!("Settings error: {}", e));
                None
            }
        }
    }

    async fn write_setting(&self, key: &str, value: &str) {
        if let Err(e) = self.store.set(key, value).await {
            warn!("Saving setting {} failed: {}", key, e);
            self.messages.push(format!("Settings error: {}", e));
        }
    }

    async fn try_auto_connect(&self) {
        let device = {
            let mut controls = lock(&self.controls);
            if controls.auto_connect_evaluated {
                return;
            }
            controls.auto_connect_evaluated = true;
            if !controls.auto_connect {
                return;
            }
            controls.last_device.clone()
        };

        if let Some(device) = device {
            if self.machine.state() == ConnectionState::Disconnected {
                info!("Auto-connecting to {}", device);
                self.connect(Some(&device)).await;
            }
        }
    }

    /// Connect to `device`, or else the last device, the configured default
    /// device, or the first scan result.
    pub async fn connect(&self, device: Option<&str>) -> bool {
        let target = device
            .map(str::to_string)
            .or_else(|| lock(&self.controls).last_device.clone())
            .or_else(|| {
                let default = self.config.ble.default_device.trim();
                (!default.is_empty()).then(|| default.to_string())
            })
            .or_else(|| lock(&self.scan).devices.first().map(|d| d.address.clone()));

        let Some(target) = target else {
            warn!("Connect requested with no known device");
            self.messages.push("No known device");
            return false;
        };

        if !self.machine.do_connect(&target).await {
            return false;
        }

        let changed = {
            let mut controls = lock(&self.controls);
            let changed = controls.last_device.as_deref() != Some(target.as_str());
            controls.last_device = Some(target.clone());
            changed
        };
        if changed {
            self.write_setting(KEY_LAST_DEVICE, &target).await;
        }
        true
    }

    pub async fn disconnect(&self) {
        if let Some(summary) = self.machine.disconnect_ble().await {
            self.on_disconnected(summary);
        }
    }

    pub async fn subscribe(&self) {
        self.machine.do_subscribe().await;
    }

    pub async fn unsubscribe(&self) {
        self.machine.do_unsubscribe().await;
    }

    /// Write arbitrary text to the peripheral.
    pub async fn send_raw(&self, text: &str) -> bool {
        self.machine.send_data(text).await
    }

    pub async fn set_led(&self, on: bool) -> bool {
        let command = if on { Command::LedOn } else { Command::LedOff };
        self.machine.send_data(&command.to_string()).await
    }

    /// Turn Pizza Mode on or off.
    ///
    /// Turning it on requires a link; it captures the ambient light level,
    /// re-arms the light alarm and sends `P_MODE_ON`.
    pub async fn set_pizza_mode(&self, on: bool) {
        if on {
            if !self.machine.is_connected() {
                warn!("Pizza Mode needs a connection");
                self.messages.push("Not connected");
                return;
            }
            {
                let mut controls = lock(&self.controls);
                if controls.pizza_mode.is_on() {
                    return;
                }
                let mut policy = lock(&self.policy);
                controls.pizza_mode = PizzaMode::On;
                controls.ambient_baseline = policy.snapshot().light_level_percent;
                policy.rearm_light_alarm();
            }
            info!("Pizza Mode on");
            self.alerts.cue(Cue::PizzaModeArmed);
            self.messages.push("Pizza Mode on");
            self.machine.send_data(&Command::PizzaModeOn.to_string()).await;
        } else {
            {
                let mut controls = lock(&self.controls);
                if !controls.pizza_mode.is_on() {
                    return;
                }
                controls.pizza_mode = PizzaMode::Off;
                controls.ambient_baseline = None;
            }
            info!("Pizza Mode off");
            self.messages.push("Pizza Mode off");
            if self.machine.state().can_write() {
                self.machine.send_data(&Command::PizzaModeOff.to_string()).await;
            }
        }
    }

    pub async fn toggle_pizza_mode(&self) {
        let on = lock(&self.controls).pizza_mode.is_on();
        self.set_pizza_mode(!on).await;
    }

    /// Save a new light threshold (percent, or percent of ambient in auto mode).
    ///
    /// Persists it and, when connected, sends `CALC<n>` or `LEVEL<n>`.
    pub async fn set_threshold(&self, value: f64) -> bool {
        if !value.is_finite() || !THRESHOLD_RANGE.contains(&value) {
            warn!("Rejected threshold {}", value);
            self.messages
                .push(format!("Threshold must be between 1 and 100, got {}", value));
            return false;
        }

        let auto_mode = {
            let mut controls = lock(&self.controls);
            controls.threshold = value;
            controls.auto_mode
        };
        self.write_setting(KEY_THRESHOLD, &value.to_string()).await;
        self.messages.push(format!("Threshold set to {}", value));

        if self.machine.state().can_write() {
            self.machine
                .send_data(&Command::threshold(value, auto_mode).to_string())
                .await;
        }
        true
    }

    /// Switch between absolute and ambient-relative thresholds.
    ///
    /// The firmware resets Pizza Mode on a mode change, so it is forced off here too.
    pub async fn set_auto_mode(&self, on: bool) {
        {
            let mut controls = lock(&self.controls);
            controls.auto_mode = on;
            controls.pizza_mode = PizzaMode::Off;
            controls.ambient_baseline = None;
        }
        info!("Auto mode {}", if on { "on" } else { "off" });
        self.messages
            .push(if on { "Auto mode on" } else { "Auto mode off" });
        if self.machine.state().can_write() {
            self.machine.send_data(&Command::AutoMode(on).to_string()).await;
        }
    }

    pub async fn set_auto_connect(&self, on: bool) {
        lock(&self.controls).auto_connect = on;
        self.write_setting(KEY_AUTO_CONNECT, if on { "true" } else { "false" })
            .await;
        self.messages
            .push(if on { "Auto-connect enabled" } else { "Auto-connect disabled" });
    }

    /// The user dismissed the low-battery alert; strike counting restarts.
    pub fn acknowledge_low_battery(&self) {
        lock(&self.policy).acknowledge_low_battery_alert();
        self.messages.push("Low battery alert acknowledged");
    }

    /// Clear the candidate list and scan for `ble.scan_duration_ms`.
    pub async fn start_scan(&self) {
        {
            let mut scan = lock(&self.scan);
            if scan.scanning {
                drop(scan);
                self.messages.push("Scan already running");
                return;
            }
            scan.scanning = true;
            scan.devices.clear();
            scan.deadline =
                Some(Instant::now() + Duration::from_millis(self.config.ble.scan_duration_ms));
        }

        info!("Scanning for {} ms", self.config.ble.scan_duration_ms);
        match self.gateway.scan().await {
            Ok(text) => self.messages.push(text),
            Err(e) => {
                warn!("Scan failed: {}", e);
                {
                    let mut scan = lock(&self.scan);
                    scan.scanning = false;
                    scan.deadline = None;
                }
                self.messages.push(format!("Scan error: {}", e));
            }
        }
    }

    pub fn stop_scan(&self) {
        let found = {
            let mut scan = lock(&self.scan);
            if !scan.scanning {
                return;
            }
            scan.scanning = false;
            scan.deadline = None;
            scan.devices.len()
        };
        self.gateway.stop_scan();
        info!("Scan stopped, {} device(s) found", found);
        self.messages
            .push(format!("Scan finished, {} device(s) found", found));
    }

    /// When the running scan stops, if any.
    pub fn scan_deadline(&self) -> Option<Instant> {
        lock(&self.scan).deadline
    }

    /// Snapshot of everything presentable. Never touches the gateway.
    pub fn view(&self) -> StateView {
        let state = self.machine.state();
        let session = self.machine.session();
        let (telemetry, voltage_alarm, light_alarm) = {
            let policy = lock(&self.policy);
            (policy.snapshot().clone(), policy.voltage_alarm(), policy.light_alarm())
        };
        let controls = lock(&self.controls);
        let scan = lock(&self.scan);

        StateView {
            connection_state: state,
            is_connected: state.is_connected(),
            is_subscribed: state == ConnectionState::Subscribed,
            uptime: session.duration().map(format_duration),
            device_id: session.device_id,
            connected_at: session.connected_at,
            telemetry,
            voltage_alarm,
            light_alarm,
            pizza_mode: controls.pizza_mode,
            threshold: controls.threshold,
            auto_mode: controls.auto_mode,
            effective_threshold: controls.effective_threshold(),
            auto_connect: controls.auto_connect,
            last_device: controls.last_device.clone(),
            scanning: scan.scanning,
            devices: scan.devices.clone(),
            messages: self.messages.entries(),
            connection_log: self.events.entries(),
        }
    }

    /// Carry out one operator command.
    pub async fn execute(&self, command: UserCommand) {
        debug!("Command: {:?}", command);
        match command {
            UserCommand::Connect(device) => {
                self.connect(device.as_deref()).await;
            }
            UserCommand::Disconnect => self.disconnect().await,
            UserCommand::Subscribe => self.subscribe().await,
            UserCommand::Unsubscribe => self.unsubscribe().await,
            UserCommand::Scan => self.start_scan().await,
            UserCommand::StopScan => self.stop_scan(),
            UserCommand::Led(on) => {
                self.set_led(on).await;
            }
            UserCommand::TogglePizzaMode => self.toggle_pizza_mode().await,
            UserCommand::Threshold(value) => {
                self.set_threshold(value).await;
            }
            UserCommand::AutoMode(on) => self.set_auto_mode(on).await,
            UserCommand::AutoConnect(on) => self.set_auto_connect(on).await,
            UserCommand::AcknowledgeLowBattery => self.acknowledge_low_battery(),
            UserCommand::Send(text) => {
                self.send_raw(&text).await;
            }
            UserCommand::Status => info!("\n{}", self.view()),
        }
    }

    /// Process events, commands and timers until `shutdown` resolves or the
    /// gateway's stream closes.
    ///
    /// Runs at most once per orchestrator: the event subscription is moved
    /// into the loop and disposed when it exits.
    pub async fn run(&self, mut commands: mpsc::Receiver<UserCommand>, shutdown: impl Future<Output = ()>) {
        let Some(mut events) = lock(&self.subscription).take() else {
            warn!("Event subscription already disposed");
            return;
        };
        tokio::pin!(shutdown);
        let mut commands_open = true;

        info!("Worker loop started");
        loop {
            let sync_due = self.sync_deadline();
            let scan_due = self.scan_deadline();

            // Delivered events drain before the next command runs
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }

                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("Gateway event stream closed");
                        break;
                    }
                },

                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.execute(command).await,
                    None => {
                        debug!("Command channel closed");
                        commands_open = false;
                    }
                },

                _ = sleep_until(sync_due.unwrap_or_else(Instant::now)), if sync_due.is_some() => {
                    self.flush_pending_sync().await;
                }

                _ = sleep_until(scan_due.unwrap_or_else(Instant::now)), if scan_due.is_some() => {
                    self.stop_scan();
                }
            }
        }

        self.dispose(events).await;
    }

    /// Tear down the event subscription. Consumes it, so it runs once.
    async fn dispose(&self, events: EventReceiver) {
        drop(events);
        if self.machine.state() == ConnectionState::Subscribed {
            self.machine.do_unsubscribe().await;
        }
        self.stop_scan();
        info!("Event subscription disposed");
    }

    /// Handle every event already queued, without blocking.
    #[cfg(test)]
    async fn pump(&self) -> usize {
        let mut queued = Vec::new();
        if let Some(events) = lock(&self.subscription).as_mut() {
            while let Ok(event) = events.try_recv() {
                queued.push(event);
            }
        }
        let count = queued.len();
        for event in queued {
            self.handle_event(event).await;
        }
        count
    }
}

#[cfg(test)]
mod tests;
