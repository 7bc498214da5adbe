//! Connection state and session record.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;

/// Link lifecycle state. Only the session machine mutates it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Subscribing,
    Subscribed,
    Disconnecting,
}

impl ConnectionState {
    /// True while a link exists (Connected, Subscribing or Subscribed).
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Subscribing | ConnectionState::Subscribed
        )
    }

    /// Peripheral writes are allowed only in these states.
    #[must_use]
    pub fn can_write(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Subscribed)
    }

    /// A gateway call is in flight.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Subscribing | ConnectionState::Disconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Subscribing => "Subscribing",
            ConnectionState::Subscribed => "Subscribed",
            ConnectionState::Disconnecting => "Disconnecting",
        };
        f.write_str(text)
    }
}

/// The current (or absent) link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Set once per successful connect, cleared once per disconnect
    pub connected_at: Option<DateTime<Local>>,
    pub device_id: Option<String>,
}

impl Session {
    /// Time since connect, `None` while disconnected.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.duration_at(Local::now())
    }

    /// Time between connect and `now`; clamps clock steps backwards to zero.
    #[must_use]
    pub fn duration_at(&self, now: DateTime<Local>) -> Option<Duration> {
        self.connected_at
            .map(|start| (now - start).to_std().unwrap_or(Duration::ZERO))
    }
}

/// What a finished session looked like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub device_id: Option<String>,
    pub duration: Option<Duration>,
}
