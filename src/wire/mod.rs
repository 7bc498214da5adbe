//! # Wire Protocol Module
//!
//! The text micro-format spoken over the PizzaBot notification characteristic.
//!
//! This module handles:
//! - Classifying inbound notification lines (telemetry, alarms, charge text, echoes)
//! - Extracting `V`/`R`/`L`/`B` tokens into typed sensor frames
//! - Rendering the outbound ASCII command vocabulary byte-for-byte

pub mod protocol;
pub mod encoder;
pub mod decoder;
