//! # PizzaBot
//!
//! Companion link for the PizzaBot oven monitor.
//!
//! Connects to a PizzaBot, streams its telemetry and raises battery and
//! Pizza Mode alerts. Operator commands are read from stdin.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use pizzabot::alerts::{AlwaysGranted, LogAlertSink};
use pizzabot::config::{Config, LoggingConfig};
use pizzabot::orchestrator::{CommandParseError, Orchestrator, UserCommand};
use pizzabot::store::FileSettingsStore;
use pizzabot::transport::TransportGateway;

/// Operator commands queued ahead of the worker loop
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// One line per operator command, printed on start and on unknown input
const HELP: &[&str] = &[
    "connect [address]",
    "disconnect",
    "subscribe",
    "unsubscribe",
    "scan",
    "stop",
    "led on|off",
    "pizza",
    "threshold <1-100>",
    "auto on|off",
    "autoconnect on|off",
    "ack",
    "send <text>",
    "status",
];

/// Main entry point for PizzaBot
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (first argument, or built-in defaults)
///    - Set up logging (stdout, plus daily rolling files when `logging.log_dir` is set)
///    - Build the transport: the emulated oven, or a real BLE central with `--features btle`
///    - Load persisted settings and auto-connect if enabled
///
/// 2. **Main Loop**
///    - Route gateway events, operator commands and timers through the orchestrator
///
/// 3. **Graceful Shutdown**
///    - On Ctrl+C, unsubscribe and drop the event subscription
///
/// # Errors
///
/// Returns error if the configuration is invalid or the transport cannot be opened
///
/// # Examples
///
/// ```bash
/// cargo run --release -- config/default.toml
/// ```
///
/// Expected output:
/// ```text
/// INFO pizzabot: PizzaBot v0.1.0 starting...
/// INFO pizzabot: Using emulated oven at 94:A9:90:48:02:FA
/// INFO pizzabot::orchestrator: Worker loop started
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };

    let _log_guard = init_logging(&config.logging);

    info!("PizzaBot v{} starting...", env!("CARGO_PKG_VERSION"));

    let gateway = build_gateway(&config).await?;
    let store = Arc::new(FileSettingsStore::new(&config.settings.store_path));
    info!("Settings stored in {}", store.path().display());

    let orchestrator = Orchestrator::new(
        config,
        gateway,
        Arc::new(AlwaysGranted),
        Arc::new(LogAlertSink),
        store,
    )?;

    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    spawn_stdin_reader(tx);

    info!("Commands: {}", HELP.join(", "));
    info!("Press Ctrl+C to exit");

    orchestrator.start().await;
    orchestrator
        .run(rx, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down...");
        })
        .await;

    Ok(())
}

/// Initialize tracing: `RUST_LOG` wins over the configured level.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let (file_layer, guard) = if config.log_dir.is_empty() {
        (None, None)
    } else {
        let appender = tracing_appender::rolling::daily(&config.log_dir, "pizzabot.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    guard
}

#[cfg(not(feature = "btle"))]
async fn build_gateway(config: &Config) -> Result<Arc<dyn TransportGateway>> {
    use pizzabot::transport::emulator::EmulatedOven;

    let oven = Arc::new(EmulatedOven::new(&config.emulator));
    let period = Duration::from_millis(config.emulator.tick_interval_ms);
    tokio::spawn(oven.clone().run_ticker(period));

    info!("Using emulated oven at {}", oven.address());
    Ok(oven)
}

#[cfg(feature = "btle")]
async fn build_gateway(config: &Config) -> Result<Arc<dyn TransportGateway>> {
    use pizzabot::transport::btle::BtleGateway;
    use pizzabot::transport::Endpoint;

    let gateway = BtleGateway::new(Endpoint::from(&config.ble)).await?;
    info!("Using Bluetooth adapter (scan timeout {:?})", Duration::from_millis(config.ble.scan_duration_ms));
    Ok(Arc::new(gateway))
}

/// Forward parsed stdin lines to the worker loop until EOF.
fn spawn_stdin_reader(tx: mpsc::Sender<UserCommand>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Reading stdin failed: {}", e);
                    break;
                }
            };

            match UserCommand::parse(&line) {
                Ok(command) => {
                    if tx.send(command).await.is_err() {
                        break;
                    }
                }
                Err(CommandParseError::Empty) => {}
                Err(e) => warn!("{} (commands: {})", e, HELP.join(", ")),
            }
        }
        info!("Operator input closed");
    });
}
