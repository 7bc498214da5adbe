//! # Alerts and Permissions
//!
//! Interfaces the core uses to reach the user and to ask whether it may
//! touch the radio. Rendering (sounds, toasts, vibration) and permission
//! negotiation live behind these traits.

use serde::Serialize;
use tracing::{info, warn};

/// A user-facing alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertEvent {
    /// Battery voltage stayed below the low-voltage threshold
    LowBattery,
    /// The oven light went out while Pizza Mode was on
    Pizza,
}

/// A short feedback cue (haptics in the original device app).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Cue {
    Subscribed,
    ConnectionLost,
    PizzaModeArmed,
}

/// Sink for alerts and cues.
///
/// Implementations must not block; they are called from the worker loop.
#[cfg_attr(test, mockall::automock)]
pub trait AlertSink: Send + Sync {
    fn raise(&self, event: AlertEvent);
    fn cue(&self, cue: Cue);
}

/// Renders alerts and cues as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn raise(&self, event: AlertEvent) {
        match event {
            AlertEvent::LowBattery => warn!("ALERT: PizzaBot battery is low"),
            AlertEvent::Pizza => warn!("ALERT: Pizza is ready!"),
        }
    }

    fn cue(&self, cue: Cue) {
        info!("Cue: {:?}", cue);
    }
}

/// Precondition checked before every connect attempt.
#[cfg_attr(test, mockall::automock)]
pub trait PermissionGate: Send + Sync {
    fn connect_permitted(&self) -> bool;
}

/// Gate for platforms without a runtime permission model.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysGranted;

impl PermissionGate for AlwaysGranted {
    fn connect_permitted(&self) -> bool {
        true
    }
}
