//! # Notification Decoder
//!
//! Classifies raw notification lines and extracts sensor tokens.
//!
//! The peripheral multiplexes telemetry, alarms, charge status and command
//! echoes onto one characteristic as short text lines. Tokens may appear in
//! any order, separated by arbitrary characters:
//!
//! | Token | Field | Grammar |
//! |-------|-------|---------|
//! | `V3.7` | voltage | `V` followed by digits and dots |
//! | `R-60` | rssi | `R` followed by an optional `-` and digits |
//! | `L85` | light level | `L` followed by digits and dots |
//! | `B0` | charging flag | `B` followed by one digit |
//!
//! Only the first match of each token is used. A token whose text does not
//! parse as a number yields `None`, never a partial value.
//!
//! Decoding is total: every input, including empty and non-ASCII text,
//! produces a [`Notification`].

use super::encoder::Command;
use super::protocol::*;

/// Text marking the "not charging" variant of a charge status line
const NOT_CHARGING_TEXT: &str = "Not Charging";

/// Stateless notification decoder.
///
/// The only knob is which `B<digit>` value the firmware uses for
/// "charging"; revisions disagree, so it is configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoder {
    charging_digit: u8,
}

impl Default for Decoder {
    fn default() -> Self {
        Self { charging_digit: 0 }
    }
}

impl Decoder {
    /// Creates a decoder where `B<charging_digit>` means charging.
    ///
    /// Values other than 0 and 1 are clamped to 1.
    #[must_use]
    pub fn new(charging_digit: u8) -> Self {
        Self {
            charging_digit: charging_digit.min(1),
        }
    }

    /// Classify one notification message.
    ///
    /// # Examples
    ///
    /// ```
    /// use pizzabot::wire::decoder::Decoder;
    /// use pizzabot::wire::protocol::Notification;
    ///
    /// let decoder = Decoder::default();
    /// assert_eq!(decoder.decode("   "), Notification::Empty);
    /// assert_eq!(decoder.decode("LDR!"), Notification::AlarmTrigger);
    /// assert!(matches!(decoder.decode("V3.7 R-60 L85 B1"), Notification::Frame(_)));
    /// ```
    #[must_use]
    pub fn decode(&self, raw: &str) -> Notification {
        let text = raw.trim();

        if text.is_empty() {
            return Notification::Empty;
        }

        if text.contains(ALARM_TRIGGER_TOKEN) {
            return Notification::AlarmTrigger;
        }

        if text.contains(CHARGE_STATUS_TOKEN) {
            return Notification::ChargeStatus {
                charging: !text.contains(NOT_CHARGING_TEXT),
                text: text.to_string(),
            };
        }

        if let Some(command) = Command::parse(text) {
            return Notification::Echo(command);
        }

        let frame = self.parse_frame(text);
        if frame.is_empty() {
            Notification::Unparsed(text.to_string())
        } else {
            Notification::Frame(frame)
        }
    }

    /// Extract every sensor token from a line.
    ///
    /// Never fails; missing or malformed tokens become `None`.
    #[must_use]
    pub fn parse_frame(&self, raw: &str) -> SensorFrame {
        let voltage = find_token(raw, TOKEN_VOLTAGE, decimal_len).and_then(parse_decimal);
        let rssi = find_token(raw, TOKEN_RSSI, signed_integer_len).and_then(|t| t.parse().ok());
        let light_level_percent = find_token(raw, TOKEN_LIGHT, decimal_len).and_then(parse_decimal);
        let charging = find_token(raw, TOKEN_BATTERY, single_digit_len).and_then(|t| self.charging_flag(t));

        SensorFrame {
            voltage,
            rssi,
            light_level_percent,
            charging,
            raw: raw.to_string(),
        }
    }

    fn charging_flag(&self, digit: &str) -> Option<bool> {
        let value = digit.parse::<u8>().ok()?;
        if value == self.charging_digit {
            Some(true)
        } else if value == 1 - self.charging_digit {
            Some(false)
        } else {
            None
        }
    }
}

/// Classify the `status` field of a gateway event.
#[must_use]
pub fn classify_status(status: &str) -> StatusSignal {
    if status.contains(STATUS_CHARACTERISTIC_FOUND) {
        StatusSignal::CharacteristicFound
    } else if status.contains(STATUS_DISCONNECTED) {
        StatusSignal::Disconnected
    } else {
        StatusSignal::Other(status.trim().to_string())
    }
}

/// Classify a message with the default charging convention.
#[must_use]
pub fn decode(raw: &str) -> Notification {
    Decoder::default().decode(raw)
}

/// Find the first `prefix` whose following bytes satisfy `accept`.
///
/// `accept` returns the length of the match after the prefix, 0 for none.
fn find_token(line: &str, prefix: u8, accept: fn(&[u8]) -> usize) -> Option<&str> {
    let bytes = line.as_bytes();
    bytes
        .iter()
        .enumerate()
        .filter(|&(_, &b)| b == prefix)
        .find_map(|(i, _)| {
            let start = i + 1;
            let len = accept(&bytes[start..]);
            (len > 0).then(|| &line[start..start + len])
        })
}

fn decimal_len(rest: &[u8]) -> usize {
    rest.iter().take_while(|b| b.is_ascii_digit() || **b == b'.').count()
}

fn signed_integer_len(rest: &[u8]) -> usize {
    let sign = usize::from(rest.first() == Some(&b'-'));
    let digits = rest[sign..].iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 { 0 } else { sign + digits }
}

fn single_digit_len(rest: &[u8]) -> usize {
    usize::from(rest.first().is_some_and(u8::is_ascii_digit))
}

fn parse_decimal(token: &str) -> Option<f64> {
    token.parse::<f64>().ok().filter(|v| v.is_finite())
}
