//! # BLE Central Gateway
//!
//! [`TransportGateway`] over a real Bluetooth adapter using `btleplug`.
//! Enabled with the `btle` cargo feature.
//!
//! Devices are addressed by their Bluetooth address as printed by
//! `btleplug` (`94:A9:90:48:02:FA`). A device must have been seen by the
//! adapter (scan) before it can be connected.

use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::gateway::{DiscoveredDevice, Endpoint, EventReceiver, GatewayEvent, TransportGateway};
use crate::error::{PizzabotError, Result};
use crate::wire::protocol::{STATUS_CHARACTERISTIC_FOUND, STATUS_DISCONNECTED};

fn transport(e: impl Display) -> PizzabotError {
    PizzabotError::Transport(e.to_string())
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// BLE central bound to the first adapter on the host.
pub struct BtleGateway {
    adapter: Adapter,
    endpoint: Endpoint,
    peripheral: Mutex<Option<Peripheral>>,
    connected_id: Arc<Mutex<Option<PeripheralId>>>,
    notification_task: Mutex<Option<JoinHandle<()>>>,
    sender: mpsc::UnboundedSender<GatewayEvent>,
    receiver: Mutex<Option<EventReceiver>>,
}

impl std::fmt::Debug for BtleGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleGateway")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl BtleGateway {
    /// Open the first Bluetooth adapter and start listening for central events.
    ///
    /// # Errors
    ///
    /// Returns error if no adapter is available
    pub async fn new(endpoint: Endpoint) -> Result<Self> {
        let manager = Manager::new().await.map_err(transport)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(transport)?
            .into_iter()
            .next()
            .ok_or_else(|| PizzabotError::Transport("No Bluetooth adapter found".to_string()))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let connected_id = Arc::new(Mutex::new(None));

        let mut central_events = adapter.events().await.map_err(transport)?;
        let events_adapter = adapter.clone();
        let events_sender = sender.clone();
        let events_connected = connected_id.clone();
        tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) => {
                        let Ok(peripheral) = events_adapter.peripheral(&id).await else {
                            continue;
                        };
                        if let Ok(Some(props)) = peripheral.properties().await {
                            let device = DiscoveredDevice {
                                name: props.local_name.unwrap_or_else(|| "Unknown".to_string()),
                                address: props.address.to_string(),
                            };
                            let _ = events_sender.send(GatewayEvent::DeviceFound(device));
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let ours = guard(&events_connected).as_ref() == Some(&id);
                        if ours {
                            info!("Peripheral dropped the link");
                            *guard(&events_connected) = None;
                            let _ = events_sender.send(GatewayEvent::status(STATUS_DISCONNECTED));
                        }
                    }
                    _ => {}
                }
            }
            debug!("Central event stream ended");
        });

        Ok(Self {
            adapter,
            endpoint,
            peripheral: Mutex::new(None),
            connected_id,
            notification_task: Mutex::new(None),
            sender,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    fn current(&self) -> Result<Peripheral> {
        guard(&self.peripheral)
            .clone()
            .ok_or_else(|| PizzabotError::Transport("Device not connected".to_string()))
    }

    fn characteristic(peripheral: &Peripheral, endpoint: &Endpoint) -> Result<Characteristic> {
        let uuid = Uuid::parse_str(&endpoint.characteristic_uuid).map_err(transport)?;
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| PizzabotError::Transport(format!("Characteristic {} not found", uuid)))
    }

    async fn find(&self, device_id: &str) -> Result<Peripheral> {
        for peripheral in self.adapter.peripherals().await.map_err(transport)? {
            if let Ok(Some(props)) = peripheral.properties().await {
                if props.address.to_string().eq_ignore_ascii_case(device_id) {
                    return Ok(peripheral);
                }
            }
        }
        Err(PizzabotError::Transport(format!("Device {} not found, scan first", device_id)))
    }

    fn stop_notifications(&self) {
        if let Some(task) = guard(&self.notification_task).take() {
            task.abort();
        }
    }
}

#[async_trait]
impl TransportGateway for BtleGateway {
    async fn connect(&self, device_id: &str) -> Result<String> {
        let peripheral = self.find(device_id).await?;
        peripheral.connect().await.map_err(transport)?;
        peripheral.discover_services().await.map_err(transport)?;

        *guard(&self.connected_id) = Some(peripheral.id());
        *guard(&self.peripheral) = Some(peripheral.clone());

        if Self::characteristic(&peripheral, &self.endpoint).is_ok() {
            let _ = self.sender.send(GatewayEvent::status(STATUS_CHARACTERISTIC_FOUND));
        } else {
            warn!("Connected device does not expose {}", self.endpoint.characteristic_uuid);
        }
        Ok(format!("Connected to {}", device_id))
    }

    async fn disconnect(&self) -> Result<String> {
        let peripheral = self.current()?;
        self.stop_notifications();
        *guard(&self.connected_id) = None;
        *guard(&self.peripheral) = None;
        peripheral.disconnect().await.map_err(transport)?;
        Ok("Disconnected".to_string())
    }

    async fn subscribe(&self, endpoint: &Endpoint) -> Result<String> {
        let peripheral = self.current()?;
        let characteristic = Self::characteristic(&peripheral, endpoint)?;

        let mut stream = peripheral.notifications().await.map_err(transport)?;
        let uuid = characteristic.uuid;
        let sender = self.sender.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == uuid {
                    let text = String::from_utf8_lossy(&notification.value).into_owned();
                    let _ = sender.send(GatewayEvent::message(text));
                }
            }
        });
        if let Some(previous) = guard(&self.notification_task).replace(task) {
            previous.abort();
        }

        peripheral.subscribe(&characteristic).await.map_err(transport)?;
        Ok("Notifications enabled".to_string())
    }

    async fn unsubscribe(&self, endpoint: &Endpoint) -> Result<String> {
        let peripheral = self.current()?;
        let characteristic = Self::characteristic(&peripheral, endpoint)?;
        self.stop_notifications();
        peripheral.unsubscribe(&characteristic).await.map_err(transport)?;
        Ok("Notifications disabled".to_string())
    }

    async fn write(&self, endpoint: &Endpoint, text: &str) -> Result<String> {
        let peripheral = self.current()?;
        let characteristic = Self::characteristic(&peripheral, endpoint)?;
        peripheral
            .write(&characteristic, text.as_bytes(), WriteType::WithResponse)
            .await
            .map_err(transport)?;
        Ok(format!("Wrote {} bytes", text.len()))
    }

    async fn scan(&self) -> Result<String> {
        self.adapter.start_scan(ScanFilter::default()).await.map_err(transport)?;
        Ok("Scan started".to_string())
    }

    fn stop_scan(&self) {
        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Stop scan failed: {}", e);
            }
        });
    }

    fn take_events(&self) -> Option<EventReceiver> {
        guard(&self.receiver).take()
    }
}
