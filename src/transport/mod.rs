//! # Transport
//!
//! The radio boundary. [`gateway::TransportGateway`] is the only way the
//! core touches a peripheral; concrete backends:
//!
//! - [`emulator::EmulatedOven`]: in-process simulated PizzaBot
//! - `btle::BtleGateway` (feature `btle`): BLE central on `btleplug`

pub mod gateway;
pub mod emulator;

#[cfg(feature = "btle")]
pub mod btle;

pub use gateway::{DiscoveredDevice, Endpoint, EventReceiver, GatewayEvent, TransportGateway};
