//! # Command Encoder
//!
//! Renders the outbound command vocabulary written to the PizzaBot
//! characteristic. These strings are the firmware's wire protocol and must
//! stay byte-for-byte stable.
//!
//! | Command | Wire text |
//! |---------|-----------|
//! | LED on / off | `LED_ON` / `LED_OFF` |
//! | Pizza Mode on / off | `P_MODE_ON` / `P_MODE_OFF` |
//! | Absolute threshold | `LEVEL<n>` |
//! | Ambient-relative threshold | `CALC<n>` |
//! | Auto mode | `AUTO_MODE1` / `AUTO_MODE0` |
//! | Settings sync | `SYNC\|<P\|L><n>\|<A1\|A0>` |

use std::fmt;

/// A command the phone side writes to the peripheral.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    LedOn,
    LedOff,
    PizzaModeOn,
    PizzaModeOff,
    /// Absolute light threshold in percent
    Level(f64),
    /// Threshold as a percentage of the ambient light level
    Calc(f64),
    AutoMode(bool),
    /// Push the locally held threshold and mode back to the peripheral
    Sync {
        threshold: f64,
        auto_mode: bool,
    },
}

impl Command {
    /// The threshold command matching the current mode.
    ///
    /// # Examples
    ///
    /// ```
    /// use pizzabot::wire::encoder::Command;
    ///
    /// assert_eq!(Command::threshold(80.0, true).to_string(), "CALC80");
    /// assert_eq!(Command::threshold(25.0, false).to_string(), "LEVEL25");
    /// ```
    #[must_use]
    pub fn threshold(value: f64, auto_mode: bool) -> Self {
        if auto_mode {
            Command::Calc(value)
        } else {
            Command::Level(value)
        }
    }

    /// Parse a line that exactly matches the command vocabulary.
    ///
    /// Used to recognise the peripheral echoing our writes back.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "LED_ON" => return Some(Command::LedOn),
            "LED_OFF" => return Some(Command::LedOff),
            "P_MODE_ON" => return Some(Command::PizzaModeOn),
            "P_MODE_OFF" => return Some(Command::PizzaModeOff),
            "AUTO_MODE1" => return Some(Command::AutoMode(true)),
            "AUTO_MODE0" => return Some(Command::AutoMode(false)),
            _ => {}
        }

        if let Some(value) = text.strip_prefix("LEVEL") {
            return parse_number(value).map(Command::Level);
        }
        if let Some(value) = text.strip_prefix("CALC") {
            return parse_number(value).map(Command::Calc);
        }
        if let Some(rest) = text.strip_prefix("SYNC|") {
            let (threshold_part, mode_part) = rest.split_once('|')?;
            let auto_mode = match mode_part {
                "A1" => true,
                "A0" => false,
                _ => return None,
            };
            let mut chars = threshold_part.chars();
            let tag = chars.next()?;
            let expected_tag = if auto_mode { 'P' } else { 'L' };
            if tag != expected_tag {
                return None;
            }
            let threshold = parse_number(chars.as_str())?;
            return Some(Command::Sync { threshold, auto_mode });
        }

        None
    }
}

fn parse_number(text: &str) -> Option<f64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return None;
    }
    text.parse().ok()
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // f64 Display drops the fraction for whole numbers: 50.0 -> "50"
        match self {
            Command::LedOn => f.write_str("LED_ON"),
            Command::LedOff => f.write_str("LED_OFF"),
            Command::PizzaModeOn => f.write_str("P_MODE_ON"),
            Command::PizzaModeOff => f.write_str("P_MODE_OFF"),
            Command::Level(value) => write!(f, "LEVEL{}", value),
            Command::Calc(value) => write!(f, "CALC{}", value),
            Command::AutoMode(on) => write!(f, "AUTO_MODE{}", u8::from(*on)),
            Command::Sync { threshold, auto_mode } => {
                let tag = if *auto_mode { 'P' } else { 'L' };
                let mode = if *auto_mode { "A1" } else { "A0" };
                write!(f, "SYNC|{}{}|{}", tag, threshold, mode)
            }
        }
    }
}
