//! # Alarm Counters
//!
//! Strike counting and latching shared by the telemetry alarms.
//!
//! ```text
//!            strike()              strikes >= limit
//!  Idle ─────────────► Counting ────────────────────► Latched
//!   ▲                                                    │
//!   └──────────────── acknowledge() / reset() ───────────┘
//! ```
//!
//! A latched counter ignores further strikes. Recovery of the underlying
//! reading does not clear the latch; only an explicit acknowledgement does.

use serde::Serialize;

/// Result of recording one strike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrikeOutcome {
    /// Counted toward the limit, no alarm yet
    Counted,
    /// This strike fired the alarm; the counter is now latched
    Fired,
    /// Already latched; strike ignored
    Suppressed,
}

/// Per-alarm debounce state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlarmCounter {
    /// Sub-threshold readings counted since the last reset
    pub strikes: u32,
    /// Set when the alarm fired; cleared only by acknowledgement or reset
    pub armed: bool,
}

impl AlarmCounter {
    /// Record one sub-threshold reading.
    ///
    /// The alarm fires on the reading that arrives once `limit` strikes are
    /// already counted, so `limit = 2` fires on the third consecutive call.
    /// A `limit` of 0 fires immediately (one-shot).
    pub fn strike(&mut self, limit: u32) -> StrikeOutcome {
        if self.armed {
            return StrikeOutcome::Suppressed;
        }

        if self.strikes >= limit {
            self.strikes = 0;
            self.armed = true;
            StrikeOutcome::Fired
        } else {
            self.strikes += 1;
            StrikeOutcome::Counted
        }
    }

    /// Clear the latch and restart counting from zero.
    pub fn acknowledge(&mut self) {
        self.strikes = 0;
        self.armed = false;
    }

    /// Returns true while the alarm is latched.
    #[must_use]
    pub fn is_latched(&self) -> bool {
        self.armed
    }
}
