//! Trait abstraction for the BLE transport to enable testing

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::BleConfig;
use crate::error::Result;

/// Service and characteristic the PizzaBot exposes its text channel on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub service_uuid: String,
    pub characteristic_uuid: String,
}

impl From<&BleConfig> for Endpoint {
    fn from(config: &BleConfig) -> Self {
        Self {
            service_uuid: config.service_uuid.clone(),
            characteristic_uuid: config.characteristic_uuid.clone(),
        }
    }
}

/// A peripheral seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
}

/// Inbound event from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// Status text and/or a notification payload
    Notification {
        status: Option<String>,
        message: Option<String>,
    },
    /// Scan result
    DeviceFound(DiscoveredDevice),
}

impl GatewayEvent {
    pub fn status(text: impl Into<String>) -> Self {
        GatewayEvent::Notification {
            status: Some(text.into()),
            message: None,
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        GatewayEvent::Notification {
            status: None,
            message: Some(text.into()),
        }
    }
}

/// Receiving half of the gateway's event stream
pub type EventReceiver = mpsc::UnboundedReceiver<GatewayEvent>;

/// Trait for peripheral I/O operations
///
/// Every call resolves to a human-readable result string or a
/// [`PizzabotError::Transport`](crate::error::PizzabotError::Transport).
/// Implementations never time out on their own.
#[async_trait]
pub trait TransportGateway: Send + Sync {
    /// Connect to the device with the given address
    async fn connect(&self, device_id: &str) -> Result<String>;

    /// Drop the current link
    async fn disconnect(&self) -> Result<String>;

    /// Enable notifications on the endpoint
    async fn subscribe(&self, endpoint: &Endpoint) -> Result<String>;

    /// Disable notifications on the endpoint
    async fn unsubscribe(&self, endpoint: &Endpoint) -> Result<String>;

    /// Write one text command to the endpoint
    async fn write(&self, endpoint: &Endpoint, text: &str) -> Result<String>;

    /// Start discovering peripherals; results arrive as [`GatewayEvent::DeviceFound`]
    async fn scan(&self) -> Result<String>;

    /// Stop discovering
    fn stop_scan(&self);

    /// Hand out the inbound event stream.
    ///
    /// Returns `Some` exactly once; the caller becomes its single owner.
    fn take_events(&self) -> Option<EventReceiver>;
}
