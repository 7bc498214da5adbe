//! # PizzaBot Library
//!
//! Companion link for the PizzaBot oven monitor.
//!
//! This library keeps a persistent-intent BLE session to one PizzaBot,
//! decodes its short text telemetry, and derives battery, light level and
//! Pizza Mode alarms from the notification stream.
//!
//! Telemetry flows gateway → decoder → policy → view; commands flow
//! operator → orchestrator → session machine → gateway.

pub mod config;
pub mod error;
pub mod wire;
pub mod telemetry;
pub mod alerts;
pub mod store;
pub mod transport;
pub mod session;
pub mod orchestrator;
