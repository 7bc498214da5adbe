use super::*;
use crate::alerts::{AlwaysGranted, LogAlertSink, MockAlertSink, MockPermissionGate};
use crate::config::EmulatorConfig;
use crate::store::MemorySettingsStore;
use crate::transport::emulator::EmulatedOven;
use crate::transport::gateway::mocks::{GatewayCall, MockGateway};
use mockall::predicate::eq;
use tokio::sync::oneshot;
use tokio_test::{assert_err, assert_ok};

const DEVICE: &str = "94:A9:90:48:02:FA";

fn test_config() -> Config {
    let mut config = Config::default();
    config.ble.sync_delay_ms = 0;
    config.telemetry.message_log_capacity = 100;
    config
}

fn quiet_alerts() -> MockAlertSink {
    let mut alerts = MockAlertSink::new();
    alerts.expect_cue().return_const(());
    alerts.expect_raise().return_const(());
    alerts
}

fn granted() -> Arc<MockPermissionGate> {
    let mut gate = MockPermissionGate::new();
    gate.expect_connect_permitted().return_const(true);
    Arc::new(gate)
}

struct Harness {
    gateway: MockGateway,
    store: Arc<MemorySettingsStore>,
    orch: Orchestrator,
}

impl Harness {
    fn with(config: Config, alerts: impl AlertSink + 'static, store: MemorySettingsStore) -> Self {
        let gateway = MockGateway::new();
        let store = Arc::new(store);
        let orch = Orchestrator::new(
            config,
            Arc::new(gateway.clone()),
            granted(),
            Arc::new(alerts),
            store.clone(),
        )
        .unwrap();
        Self { gateway, store, orch }
    }

    fn new() -> Self {
        Self::with(test_config(), quiet_alerts(), MemorySettingsStore::new())
    }

    async fn subscribed(alerts: impl AlertSink + 'static) -> Self {
        let h = Self::with(test_config(), alerts, MemorySettingsStore::new());
        assert!(h.orch.connect(Some(DEVICE)).await);
        h.status("Characteristic found!").await;
        assert_eq!(h.orch.state(), ConnectionState::Subscribed);
        h.gateway.clear_calls();
        h
    }

    async fn message(&self, text: &str) {
        self.orch.handle_event(GatewayEvent::message(text)).await;
    }

    async fn status(&self, text: &str) {
        self.orch.handle_event(GatewayEvent::status(text)).await;
    }
}

struct ExplodingSink;

impl AlertSink for ExplodingSink {
    fn raise(&self, _event: AlertEvent) {
        panic!("sink exploded");
    }

    fn cue(&self, _cue: Cue) {}
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_second_owner_of_event_stream_is_rejected() {
    let gateway = MockGateway::new();
    let first = Orchestrator::new(
        test_config(),
        Arc::new(gateway.clone()),
        granted(),
        Arc::new(quiet_alerts()),
        Arc::new(MemorySettingsStore::new()),
    );
    assert_ok!(&first);

    let second = Orchestrator::new(
        test_config(),
        Arc::new(gateway.clone()),
        granted(),
        Arc::new(quiet_alerts()),
        Arc::new(MemorySettingsStore::new()),
    );
    assert!(matches!(assert_err!(second), PizzabotError::EventStreamTaken));
}

#[tokio::test]
async fn test_happy_path_telemetry() {
    let h = Harness::subscribed(quiet_alerts()).await;

    h.message("V3.7 R-60 L85 B1").await;

    let view = h.orch.view();
    assert!(view.is_connected);
    assert!(view.is_subscribed);
    assert_eq!(view.telemetry.voltage, Some(3.7));
    assert_eq!(view.telemetry.rssi, Some(-60));
    assert_eq!(view.telemetry.light_level_percent, Some(85.0));
    assert_eq!(view.telemetry.charging, Some(false));
    assert_eq!(view.device_id.as_deref(), Some(DEVICE));
    assert!(view.uptime.is_some());
}

#[tokio::test]
async fn test_malformed_message_is_logged_verbatim() {
    let h = Harness::subscribed(quiet_alerts()).await;
    h.message("V3.7").await;
    let before = h.orch.view().telemetry;

    h.message("garbage_no_tokens").await;

    let view = h.orch.view();
    assert_eq!(view.latest_message(), Some("garbage_no_tokens"));
    assert_eq!(view.telemetry, before);
}

#[tokio::test]
async fn test_whitespace_message_is_dropped() {
    let h = Harness::subscribed(quiet_alerts()).await;
    let before = h.orch.messages().len();
    h.message("  \r\n").await;
    assert_eq!(h.orch.messages().len(), before);
}

#[tokio::test]
async fn test_echo_is_logged_not_parsed() {
    let h = Harness::subscribed(quiet_alerts()).await;
    h.message("LEVEL50").await;

    let view = h.orch.view();
    assert_eq!(view.latest_message(), Some("LEVEL50"));
    assert_eq!(view.telemetry.light_level_percent, None);
}

#[tokio::test]
async fn test_status_text_goes_to_message_log() {
    let h = Harness::new();
    h.status("Scanning...").await;
    assert_eq!(h.orch.view().latest_message(), Some("Scanning..."));
}

#[tokio::test]
async fn test_pizza_alarm_fires_once() {
    let mut alerts = MockAlertSink::new();
    alerts.expect_cue().return_const(());
    alerts.expect_raise().with(eq(AlertEvent::Pizza)).times(1).return_const(());
    let h = Harness::subscribed(alerts).await;

    assert!(h.orch.set_threshold(50.0).await);
    h.orch.set_pizza_mode(true).await;
    assert_eq!(h.orch.view().pizza_mode, PizzaMode::On);

    h.message("L40").await;
    assert_eq!(h.orch.view().pizza_mode, PizzaMode::Off);

    h.message("L30").await;

    assert_eq!(h.gateway.written(), vec!["LEVEL50", "P_MODE_ON", "P_MODE_OFF"]);
    assert!(h.orch.messages().contains(&"Pizza is ready!".to_string()));
}

#[tokio::test]
async fn test_alarm_trigger_token_fires_pizza_alert() {
    let mut alerts = MockAlertSink::new();
    alerts.expect_cue().return_const(());
    alerts.expect_raise().with(eq(AlertEvent::Pizza)).times(1).return_const(());
    let h = Harness::subscribed(alerts).await;
    h.orch.set_pizza_mode(true).await;
    h.gateway.clear_calls();

    h.message("LDR!").await;
    h.message("LDR!").await;

    assert_eq!(h.gateway.written(), vec!["P_MODE_OFF"]);
    assert_eq!(h.orch.view().pizza_mode, PizzaMode::Off);
}

#[tokio::test]
async fn test_low_voltage_debounce_and_acknowledge() {
    let mut alerts = MockAlertSink::new();
    alerts.expect_cue().return_const(());
    alerts.expect_raise().with(eq(AlertEvent::LowBattery)).times(2).return_const(());
    let h = Harness::subscribed(alerts).await;

    h.message("V1.2").await;
    h.message("V1.2").await;
    assert!(!h.orch.view().voltage_alarm.armed);
    h.message("V1.2").await;
    assert!(h.orch.view().voltage_alarm.armed);

    // Latched: no further alerts until acknowledged
    h.message("V1.2").await;
    h.message("V3.9").await;
    assert!(h.orch.view().voltage_alarm.armed);

    h.orch.acknowledge_low_battery();
    for _ in 0..3 {
        h.message("V1.1").await;
    }

    let notices = h
        .orch
        .messages()
        .iter()
        .filter(|m| *m == "Low voltage detected!")
        .count();
    assert_eq!(notices, 6);
}

#[tokio::test]
async fn test_charge_status_schedules_one_sync() {
    let h = Harness::subscribed(quiet_alerts()).await;

    h.message("Not Charging").await;
    assert!(h.orch.sync_deadline().is_some());
    assert_eq!(h.orch.view().telemetry.charging, Some(false));
    assert_eq!(h.orch.view().latest_message(), Some("Not Charging"));

    assert!(h.orch.flush_pending_sync().await);
    assert_eq!(h.gateway.written(), vec!["SYNC|L10|A0"]);

    h.message("Charging").await;
    assert_eq!(h.orch.sync_deadline(), None);
    assert!(!h.orch.flush_pending_sync().await);
    assert_eq!(h.orch.view().telemetry.charging, Some(true));
}

#[tokio::test]
async fn test_sync_uses_auto_mode_tag() {
    let h = Harness::subscribed(quiet_alerts()).await;
    h.orch.set_auto_mode(true).await;
    h.orch.set_threshold(80.0).await;
    h.gateway.clear_calls();

    h.message("Charging").await;
    h.orch.flush_pending_sync().await;
    assert_eq!(h.gateway.written(), vec!["SYNC|P80|A1"]);
}

#[tokio::test]
async fn test_charge_status_while_disconnected_does_not_schedule_sync() {
    let h = Harness::new();
    h.message("Charging").await;
    assert_eq!(h.orch.sync_deadline(), None);
}

#[tokio::test]
async fn test_sync_rearms_after_reconnect() {
    let h = Harness::subscribed(quiet_alerts()).await;
    h.message("Charging").await;
    h.orch.flush_pending_sync().await;

    h.orch.disconnect().await;
    h.orch.connect(None).await;
    h.status("Characteristic found!").await;
    h.gateway.clear_calls();

    h.message("Charging").await;
    assert!(h.orch.flush_pending_sync().await);
    assert_eq!(h.gateway.written(), vec!["SYNC|L10|A0"]);
}

#[tokio::test]
async fn test_disconnect_resets_derived_state() {
    let h = Harness::subscribed(quiet_alerts()).await;
    h.message("V1.0 R-70 L60 B0").await;
    h.orch.set_pizza_mode(true).await;
    h.message("Charging").await;

    h.orch.disconnect().await;

    let view = h.orch.view();
    assert_eq!(view.connection_state, ConnectionState::Disconnected);
    assert_eq!(view.connected_at, None);
    assert_eq!(view.uptime, None);
    assert_eq!(view.pizza_mode, PizzaMode::Off);
    assert!(view.telemetry.is_empty());
    assert_eq!(view.voltage_alarm, Default::default());
    assert_eq!(h.orch.sync_deadline(), None);
    assert!(view.connection_log.last().unwrap().contains("Disconnected (session "));
}

#[tokio::test]
async fn test_remote_disconnect() {
    let mut alerts = MockAlertSink::new();
    alerts.expect_cue().with(eq(Cue::Subscribed)).return_const(());
    alerts.expect_cue().with(eq(Cue::PizzaModeArmed)).return_const(());
    alerts.expect_cue().with(eq(Cue::ConnectionLost)).times(1).return_const(());
    let h = Harness::subscribed(alerts).await;
    h.message("V1.0 R-70 L60 B0").await;
    h.orch.set_pizza_mode(true).await;
    assert_eq!(h.orch.view().voltage_alarm.strikes, 1);

    h.status("Disconnected").await;
    h.status("Disconnected").await;

    let view = h.orch.view();
    assert_eq!(view.connection_state, ConnectionState::Disconnected);
    assert_eq!(view.pizza_mode, PizzaMode::Off);
    assert_eq!(view.connected_at, None);
    assert!(view.telemetry.is_empty());
    assert_eq!(view.voltage_alarm, Default::default());
    assert_eq!(view.light_alarm, Default::default());
    assert_eq!(h.orch.sync_deadline(), None);
}

#[tokio::test]
async fn test_delivered_disconnect_runs_before_queued_connect() {
    let h = Harness::subscribed(quiet_alerts()).await;
    h.orch.disconnect().await;
    // Late report for the link that was just closed
    h.gateway.emit(GatewayEvent::status("Disconnected"));

    let (tx, rx) = mpsc::channel(4);
    tx.send(UserCommand::Connect(Some(DEVICE.to_string()))).await.unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let driver = async {
        wait_until(|| h.orch.state() == ConnectionState::Connected).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = stop_tx.send(());
    };

    tokio::join!(
        h.orch.run(rx, async {
            let _ = stop_rx.await;
        }),
        driver
    );

    assert_eq!(h.orch.state(), ConnectionState::Connected);
    assert!(h.orch.view().connected_at.is_some());
    assert_eq!(h.gateway.count(|c| matches!(c, GatewayCall::Connect(_))), 1);
    assert_eq!(h.gateway.count(|c| *c == GatewayCall::Disconnect), 1);
}

#[tokio::test]
async fn test_connect_without_known_device() {
    let h = Harness::new();
    assert!(!h.orch.connect(None).await);
    assert!(h.gateway.get_calls().is_empty());
    assert_eq!(h.orch.view().latest_message(), Some("No known device"));
}

#[tokio::test]
async fn test_connect_falls_back_to_scan_result_and_persists() {
    let h = Harness::new();
    h.orch.start_scan().await;
    for (name, address) in [("PizzaBot", DEVICE), ("PizzaBot", DEVICE), ("Other", "11:22:33:44:55:66")] {
        h.orch
            .handle_event(GatewayEvent::DeviceFound(DiscoveredDevice {
                name: name.to_string(),
                address: address.to_string(),
            }))
            .await;
    }
    assert_eq!(h.orch.view().devices.len(), 2);

    assert!(h.orch.connect(None).await);
    assert!(h.gateway.get_calls().contains(&GatewayCall::Connect(DEVICE.to_string())));
    assert_eq!(
        h.store.get(KEY_LAST_DEVICE).await.unwrap().as_deref(),
        Some(DEVICE)
    );
    assert_eq!(h.orch.view().last_device.as_deref(), Some(DEVICE));
}

#[tokio::test]
async fn test_connect_uses_configured_default_device() {
    let mut config = test_config();
    config.ble.default_device = "AA:BB:CC:DD:EE:FF".to_string();
    let h = Harness::with(config, quiet_alerts(), MemorySettingsStore::new());

    assert!(h.orch.connect(None).await);
    assert_eq!(
        h.gateway.get_calls(),
        vec![GatewayCall::Connect("AA:BB:CC:DD:EE:FF".to_string())]
    );
}

#[tokio::test]
async fn test_device_found_outside_scan_is_ignored() {
    let h = Harness::new();
    h.orch
        .handle_event(GatewayEvent::DeviceFound(DiscoveredDevice {
            name: "PizzaBot".to_string(),
            address: DEVICE.to_string(),
        }))
        .await;
    assert!(h.orch.view().devices.is_empty());
}

#[tokio::test]
async fn test_scan_start_and_stop() {
    let h = Harness::new();
    h.orch.start_scan().await;
    assert!(h.orch.scan_deadline().is_some());
    assert!(h.orch.view().scanning);

    h.orch.start_scan().await;
    assert_eq!(h.gateway.count(|c| *c == GatewayCall::Scan), 1);

    h.orch.stop_scan();
    h.orch.stop_scan();
    assert_eq!(h.orch.scan_deadline(), None);
    assert_eq!(h.gateway.count(|c| *c == GatewayCall::StopScan), 1);
    assert_eq!(
        h.orch.view().latest_message(),
        Some("Scan finished, 0 device(s) found")
    );
}

#[tokio::test]
async fn test_start_auto_connects_once() {
    let store = MemorySettingsStore::with_entries([
        (KEY_LAST_DEVICE, DEVICE),
        (KEY_AUTO_CONNECT, "true"),
        (KEY_THRESHOLD, "25"),
    ]);
    let h = Harness::with(test_config(), quiet_alerts(), store);

    h.orch.start().await;
    assert_eq!(h.orch.state(), ConnectionState::Connected);
    assert_eq!(h.orch.view().threshold, 25.0);
    assert!(h.orch.view().auto_connect);

    h.orch.disconnect().await;
    h.orch.start().await;
    assert_eq!(h.gateway.count(|c| matches!(c, GatewayCall::Connect(_))), 1);
}

#[tokio::test]
async fn test_start_without_auto_connect() {
    let store = MemorySettingsStore::with_entries([
        (KEY_LAST_DEVICE, DEVICE),
        (KEY_AUTO_CONNECT, "false"),
        (KEY_THRESHOLD, "500"),
    ]);
    let h = Harness::with(test_config(), quiet_alerts(), store);

    h.orch.start().await;
    assert!(h.gateway.get_calls().is_empty());
    assert_eq!(h.orch.view().last_device.as_deref(), Some(DEVICE));
    // Out of range values keep the configured default
    assert_eq!(h.orch.view().threshold, 10.0);
}

#[tokio::test]
async fn test_threshold_validation_and_persistence() {
    let h = Harness::new();

    assert!(!h.orch.set_threshold(0.5).await);
    assert!(!h.orch.set_threshold(f64::NAN).await);
    assert_eq!(h.store.get(KEY_THRESHOLD).await.unwrap(), None);

    assert!(h.orch.set_threshold(35.0).await);
    assert_eq!(h.store.get(KEY_THRESHOLD).await.unwrap().as_deref(), Some("35"));
    // Disconnected: nothing written to the device
    assert!(h.gateway.written().is_empty());
    assert_eq!(h.orch.view().threshold, 35.0);
}

#[tokio::test]
async fn test_auto_mode_threshold_is_relative_to_baseline() {
    let mut alerts = MockAlertSink::new();
    alerts.expect_cue().return_const(());
    alerts.expect_raise().with(eq(AlertEvent::Pizza)).times(1).return_const(());
    let h = Harness::subscribed(alerts).await;

    h.orch.set_auto_mode(true).await;
    h.orch.set_threshold(50.0).await;
    h.message("L80").await;
    h.orch.set_pizza_mode(true).await;
    assert_eq!(h.orch.view().effective_threshold, Some(40.0));

    h.message("L45").await;
    assert_eq!(h.orch.view().pizza_mode, PizzaMode::On);
    h.message("L39").await;
    assert_eq!(h.orch.view().pizza_mode, PizzaMode::Off);

    assert_eq!(
        h.gateway.written(),
        vec!["AUTO_MODE1", "CALC50", "P_MODE_ON", "P_MODE_OFF"]
    );
}

#[tokio::test]
async fn test_auto_mode_switch_forces_pizza_mode_off() {
    let h = Harness::subscribed(quiet_alerts()).await;
    h.orch.set_pizza_mode(true).await;
    h.orch.set_auto_mode(false).await;
    assert_eq!(h.orch.view().pizza_mode, PizzaMode::Off);
    assert_eq!(h.gateway.written(), vec!["P_MODE_ON", "AUTO_MODE0"]);
}

#[tokio::test]
async fn test_pizza_mode_requires_connection() {
    let mut alerts = MockAlertSink::new();
    alerts.expect_cue().never();
    let h = Harness::with(test_config(), alerts, MemorySettingsStore::new());

    h.orch.set_pizza_mode(true).await;
    assert_eq!(h.orch.view().pizza_mode, PizzaMode::Off);
    assert!(h.gateway.written().is_empty());
}

#[tokio::test]
async fn test_toggle_pizza_mode() {
    let h = Harness::subscribed(quiet_alerts()).await;
    h.orch.toggle_pizza_mode().await;
    h.orch.toggle_pizza_mode().await;
    assert_eq!(h.gateway.written(), vec!["P_MODE_ON", "P_MODE_OFF"]);
}

#[tokio::test]
async fn test_commands_are_safe_while_disconnected() {
    let h = Harness::new();
    h.orch.execute(UserCommand::Disconnect).await;
    h.orch.execute(UserCommand::Subscribe).await;
    h.orch.execute(UserCommand::Unsubscribe).await;
    h.orch.execute(UserCommand::Led(true)).await;
    h.orch.execute(UserCommand::Send("HELLO".to_string())).await;
    h.orch.execute(UserCommand::AutoMode(true)).await;
    h.orch.execute(UserCommand::AcknowledgeLowBattery).await;
    h.orch.execute(UserCommand::Status).await;

    assert!(h.gateway.get_calls().is_empty());
    assert_eq!(h.orch.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_auto_connect_setting_is_persisted() {
    let h = Harness::new();
    h.orch.set_auto_connect(true).await;
    assert_eq!(h.store.get(KEY_AUTO_CONNECT).await.unwrap().as_deref(), Some("true"));
    h.orch.set_auto_connect(false).await;
    assert_eq!(h.store.get(KEY_AUTO_CONNECT).await.unwrap().as_deref(), Some("false"));
}

#[tokio::test]
async fn test_panic_in_handler_is_contained() {
    let h = Harness::with(test_config(), ExplodingSink, MemorySettingsStore::new());
    assert!(h.orch.connect(Some(DEVICE)).await);

    h.message("LDR!").await;
    assert!(h
        .orch
        .messages()
        .contains(&"Internal error while handling notification".to_string()));

    h.message("V3.3").await;
    assert_eq!(h.orch.view().telemetry.voltage, Some(3.3));
}

#[tokio::test]
async fn test_pump_processes_queued_gateway_events() {
    let h = Harness::new();
    h.orch.connect(Some(DEVICE)).await;
    h.gateway.emit(GatewayEvent::status("Characteristic found!"));
    h.gateway.emit(GatewayEvent::message("V3.8 L70"));

    assert_eq!(h.orch.pump().await, 2);
    assert_eq!(h.orch.state(), ConnectionState::Subscribed);
    assert_eq!(h.orch.view().telemetry.light_level_percent, Some(70.0));
}

#[tokio::test]
async fn test_run_loop_with_emulated_oven() {
    let oven = Arc::new(EmulatedOven::new(&EmulatorConfig::default()));
    let store = Arc::new(MemorySettingsStore::with_entries([(KEY_THRESHOLD, "42")]));
    let orch = Orchestrator::new(
        test_config(),
        oven.clone(),
        Arc::new(AlwaysGranted),
        Arc::new(LogAlertSink),
        store,
    )
    .unwrap();
    orch.start().await;

    let (tx, rx) = mpsc::channel(8);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let driver = async {
        tx.send(UserCommand::Connect(Some(DEVICE.to_string()))).await.unwrap();
        // Characteristic found, subscribe, charge status, then SYNC
        wait_until(|| oven.threshold() == (42.0, false)).await;
        assert_eq!(orch.state(), ConnectionState::Subscribed);

        oven.tick();
        wait_until(|| orch.view().telemetry.voltage.is_some()).await;

        tx.send(UserCommand::Led(true)).await.unwrap();
        wait_until(|| oven.led()).await;

        let _ = stop_tx.send(());
    };

    tokio::join!(
        orch.run(rx, async {
            let _ = stop_rx.await;
        }),
        driver
    );

    // Dispose unsubscribed but kept the link
    assert_eq!(orch.state(), ConnectionState::Connected);

    // The subscription is gone; a second loop exits immediately
    let (_tx, rx) = mpsc::channel(1);
    orch.run(rx, std::future::pending()).await;
}

#[tokio::test]
async fn test_quick_reconnect_through_run_loop_keeps_new_session() {
    let oven = Arc::new(EmulatedOven::new(&EmulatorConfig::default()));
    let orch = Orchestrator::new(
        test_config(),
        oven.clone(),
        Arc::new(AlwaysGranted),
        Arc::new(LogAlertSink),
        Arc::new(MemorySettingsStore::new()),
    )
    .unwrap();
    orch.start().await;

    let (tx, rx) = mpsc::channel(8);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let sessions = |suffix: &str| {
        orch.connection_log()
            .iter()
            .filter(|line| line.contains(suffix))
            .count()
    };

    let driver = async {
        for round in 1..=5 {
            tx.send(UserCommand::Connect(Some(DEVICE.to_string()))).await.unwrap();
            wait_until(|| orch.state() == ConnectionState::Subscribed && sessions("- Connected") == 2 * round - 1).await;

            tx.send(UserCommand::Disconnect).await.unwrap();
            tx.send(UserCommand::Connect(Some(DEVICE.to_string()))).await.unwrap();
            wait_until(|| orch.state() == ConnectionState::Subscribed && sessions("- Connected") == 2 * round).await;

            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(orch.state(), ConnectionState::Subscribed);
            assert_eq!(sessions("Disconnected (session "), 2 * round - 1);

            tx.send(UserCommand::Disconnect).await.unwrap();
            wait_until(|| orch.state() == ConnectionState::Disconnected).await;
        }
        let _ = stop_tx.send(());
    };

    tokio::join!(
        orch.run(rx, async {
            let _ = stop_rx.await;
        }),
        driver
    );

    assert_eq!(orch.state(), ConnectionState::Disconnected);
}
