//! # Telemetry Module
//!
//! Turns decoded sensor frames into application state and alerts.
//!
//! This module handles:
//! - Keeping the latest known value of every sensor field
//! - The low-voltage alarm (debounced over repeated readings)
//! - The Pizza Mode light alarm (one-shot, no debounce)

pub mod snapshot;
pub mod alarm;
pub mod policy;
