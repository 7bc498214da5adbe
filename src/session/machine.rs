//! # Session State Machine
//!
//! Owns [`ConnectionState`] and the [`Session`] record and gates every
//! gateway side effect on the current state.
//!
//! ```text
//!                 do_connect                    characteristic found
//! Disconnected ─────────────► Connecting ──ok──► Connected ─────────────► Subscribing
//!      ▲                          │                 │  ▲                      │    │
//!      │◄────────── error ────────┘                 │  └──── error ───────────┘    ok
//!      │                                            │                              ▼
//!      │◄──────────── Disconnecting ◄───────────────┴──────── disconnect ───── Subscribed
//!      │◄──────────── remote disconnect (Connected / Subscribing / Subscribed)
//! ```
//!
//! Every command is idempotent: calling it in a state where it makes no
//! sense logs a diagnostic and performs no gateway call. Transient states
//! (Connecting, Subscribing, Disconnecting) make overlapping calls no-op,
//! so two `do_connect` futures joined on one task issue exactly one
//! gateway `connect`.
//!
//! The state lock is a `std::sync::Mutex` and is never held across an
//! `.await`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Local;
use tracing::{debug, info, warn};

use super::log::BoundedLog;
use super::state::{ConnectionState, Session, SessionSummary};
use super::uptime::format_duration;
use crate::alerts::{AlertSink, Cue, PermissionGate};
use crate::error::PizzabotError;
use crate::transport::{Endpoint, TransportGateway};
use crate::wire::protocol::STATUS_CHARACTERISTIC_FOUND;

#[derive(Debug, Default)]
struct Inner {
    state: ConnectionState,
    session: Session,
    /// Characteristic reported while still Connecting
    subscribe_pending: bool,
}

/// Connection lifecycle for one peripheral.
pub struct SessionMachine {
    gateway: Arc<dyn TransportGateway>,
    permissions: Arc<dyn PermissionGate>,
    alerts: Arc<dyn AlertSink>,
    endpoint: Endpoint,
    inner: Mutex<Inner>,
    messages: Arc<BoundedLog>,
    events: Arc<BoundedLog>,
}

impl std::fmt::Debug for SessionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMachine")
            .field("state", &self.state())
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl SessionMachine {
    /// # Arguments
    ///
    /// * `messages` - Verbatim message log (diagnostics, gateway results)
    /// * `events` - Timestamped connection log
    pub fn new(
        gateway: Arc<dyn TransportGateway>,
        permissions: Arc<dyn PermissionGate>,
        alerts: Arc<dyn AlertSink>,
        endpoint: Endpoint,
        messages: Arc<BoundedLog>,
        events: Arc<BoundedLog>,
    ) -> Self {
        Self {
            gateway,
            permissions,
            alerts,
            endpoint,
            inner: Mutex::new(Inner::default()),
            messages,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn session(&self) -> Session {
        self.lock().session.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Connect to `device_id`.
    ///
    /// Only acts from Disconnected and never retries. Returns true if the
    /// link is up afterwards.
    pub async fn do_connect(&self, device_id: &str) -> bool {
        {
            let mut inner = self.lock();
            let state = inner.state;
            match state {
                ConnectionState::Disconnected => {}
                ConnectionState::Connecting => {
                    drop(inner);
                    self.diagnostic("Connection already in progress");
                    return false;
                }
                ConnectionState::Disconnecting => {
                    drop(inner);
                    self.diagnostic("Operation in progress");
                    return false;
                }
                _ => {
                    drop(inner);
                    self.diagnostic("Already connected");
                    return false;
                }
            }

            if !self.permissions.connect_permitted() {
                drop(inner);
                self.diagnostic(&PizzabotError::PermissionDenied.to_string());
                return false;
            }

            inner.state = ConnectionState::Connecting;
            inner.subscribe_pending = false;
            inner.session.device_id = Some(device_id.to_string());
        }

        info!("Connecting to {}", device_id);
        let result = self.gateway.connect(device_id).await;

        let subscribe_now = {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Connecting {
                debug!("Connect completed in state {}, ignoring", inner.state);
                return false;
            }
            match &result {
                Ok(_) => {
                    inner.state = ConnectionState::Connected;
                    inner.session.connected_at = Some(Local::now());
                    std::mem::take(&mut inner.subscribe_pending)
                }
                Err(_) => {
                    inner.state = ConnectionState::Disconnected;
                    inner.session = Session::default();
                    false
                }
            }
        };

        match result {
            Ok(text) => {
                info!("Connected to {}", device_id);
                self.events.push_timestamped("Connected");
                self.messages.push(format!("BLE Connect Result: {}", text));
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", device_id, e);
                self.messages.push(format!("BLE Connect Error: {}", e));
                return false;
            }
        }

        if subscribe_now {
            self.do_subscribe().await;
        }
        true
    }

    /// The gateway reported the notify characteristic.
    pub async fn on_characteristic_found(&self) {
        self.messages.push(STATUS_CHARACTERISTIC_FOUND);

        let subscribe_now = {
            let mut inner = self.lock();
            let state = inner.state;
            match state {
                ConnectionState::Connecting => {
                    debug!("Characteristic found while connecting, deferring subscribe");
                    inner.subscribe_pending = true;
                    false
                }
                ConnectionState::Connected => true,
                state => {
                    debug!("Characteristic found in state {}, ignoring", state);
                    false
                }
            }
        };

        if subscribe_now {
            self.do_subscribe().await;
        }
    }

    /// Enable notifications.
    pub async fn do_subscribe(&self) {
        {
            let mut inner = self.lock();
            let state = inner.state;
            match state {
                ConnectionState::Connected => inner.state = ConnectionState::Subscribing,
                ConnectionState::Subscribed => {
                    drop(inner);
                    self.diagnostic("Already subscribed");
                    return;
                }
                ConnectionState::Subscribing => {
                    drop(inner);
                    self.diagnostic("Subscription already in progress");
                    return;
                }
                _ => {
                    drop(inner);
                    self.diagnostic("Not connected");
                    return;
                }
            }
        }

        let result = self.gateway.subscribe(&self.endpoint).await;

        {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Subscribing {
                debug!("Subscribe completed in state {}, ignoring", inner.state);
                return;
            }
            inner.state = if result.is_ok() {
                ConnectionState::Subscribed
            } else {
                ConnectionState::Connected
            };
        }

        match result {
            Ok(_) => {
                info!("Subscribed to notifications");
                self.alerts.cue(Cue::Subscribed);
                self.messages.push("Subscribed to BLE notifications");
            }
            Err(e) => {
                warn!("Subscribe failed: {}", e);
                self.messages.push(format!("Subscription error: {}", e));
            }
        }
    }

    /// Disable notifications, keeping the link.
    pub async fn do_unsubscribe(&self) {
        if self.state() != ConnectionState::Subscribed {
            self.diagnostic("Not subscribed");
            return;
        }

        match self.gateway.unsubscribe(&self.endpoint).await {
            Ok(_) => {
                let mut inner = self.lock();
                if inner.state == ConnectionState::Subscribed {
                    inner.state = ConnectionState::Connected;
                }
                drop(inner);
                self.messages.push("Unsubscribed from BLE notifications");
            }
            Err(e) => {
                warn!("Unsubscribe failed: {}", e);
                self.messages.push(format!("Unsubscribe error: {}", e));
            }
        }
    }

    /// User-initiated disconnect.
    ///
    /// Unsubscribes first when subscribed, then disconnects. The terminal
    /// transition happens whatever the gateway answers. Returns the summary
    /// of the session that ended, `None` if nothing was torn down.
    pub async fn disconnect_ble(&self) -> Option<SessionSummary> {
        let was_subscribed = {
            let mut inner = self.lock();
            let state = inner.state;
            match state {
                ConnectionState::Disconnected => {
                    drop(inner);
                    self.diagnostic("Not connected");
                    return None;
                }
                _ if state.is_transient() => {
                    drop(inner);
                    self.diagnostic("Operation in progress");
                    return None;
                }
                _ => {
                    let subscribed = state == ConnectionState::Subscribed;
                    inner.state = ConnectionState::Disconnecting;
                    subscribed
                }
            }
        };

        if was_subscribed {
            if let Err(e) = self.gateway.unsubscribe(&self.endpoint).await {
                warn!("Unsubscribe before disconnect failed: {}", e);
                self.messages.push(format!("Unsubscribe error: {}", e));
            }
        }

        self.messages.push("Disconnecting BLE...");
        match self.gateway.disconnect().await {
            Ok(text) => debug!("Disconnect result: {}", text),
            Err(e) => {
                warn!("Disconnect failed: {}", e);
                self.messages.push(format!("Disconnect error: {}", e));
            }
        }

        self.end_session(|state| state == ConnectionState::Disconnecting)
    }

    /// The gateway reported the link dropped.
    ///
    /// Applies only while a link exists; ignored during Connecting and
    /// Disconnecting since those paths finish the transition themselves.
    pub fn handle_remote_disconnect(&self) -> Option<SessionSummary> {
        let summary = self.end_session(ConnectionState::is_connected);
        if summary.is_some() {
            warn!("Connection lost");
            self.alerts.cue(Cue::ConnectionLost);
        } else {
            debug!("Remote disconnect in state {}, ignoring", self.state());
        }
        summary
    }

    /// Write one text command. Returns true if the gateway accepted it.
    pub async fn send_data(&self, text: &str) -> bool {
        if !self.state().can_write() {
            self.diagnostic("Not connected");
            return false;
        }

        match self.gateway.write(&self.endpoint, text).await {
            Ok(_) => {
                debug!("Sent {}", text);
                true
            }
            Err(e) => {
                warn!("Write of {} failed: {}", text, e);
                self.messages.push(format!("{}: Send error: {}", text, e));
                false
            }
        }
    }

    /// Terminal transition to Disconnected if `applies(state)`.
    fn end_session(&self, applies: impl Fn(ConnectionState) -> bool) -> Option<SessionSummary> {
        let (session, now) = {
            let mut inner = self.lock();
            if !applies(inner.state) {
                return None;
            }
            inner.state = ConnectionState::Disconnected;
            inner.subscribe_pending = false;
            (std::mem::take(&mut inner.session), Local::now())
        };

        let duration = session.duration_at(now);
        match duration {
            Some(d) => {
                info!("Disconnected after {:.1}s", d.as_secs_f64());
                self.events
                    .push_timestamped(&format!("Disconnected (session {:.1}s)", d.as_secs_f64()));
                self.messages.push(format!("Connected for {}", format_duration(d)));
            }
            None => {
                info!("Disconnected");
                self.events.push_timestamped("Disconnected");
                self.messages.push("Disconnected");
            }
        }

        Some(SessionSummary {
            device_id: session.device_id,
            duration,
        })
    }

    fn diagnostic(&self, text: &str) {
        warn!("{}", text);
        self.messages.push(text);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
