//! # Session Module
//!
//! Connection lifecycle for the single PizzaBot link.
//!
//! This module handles:
//! - The connection state enum and the session record
//! - The state machine gating every gateway side effect
//! - Bounded message and connection logs
//! - Human-readable uptime formatting

pub mod state;
pub mod log;
pub mod uptime;
pub mod machine;

pub use log::BoundedLog;
pub use machine::SessionMachine;
pub use state::{ConnectionState, Session, SessionSummary};
