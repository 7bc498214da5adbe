//! Uptime formatting.

use std::time::Duration;

/// Render a duration as `"1h 2m 3s"`, omitting leading zero units.
///
/// ```
/// use std::time::Duration;
/// use pizzabot::session::uptime::format_duration;
///
/// assert_eq!(format_duration(Duration::from_secs(3723)), "1h 2m 3s");
/// assert_eq!(format_duration(Duration::from_secs(62)), "1m 2s");
/// assert_eq!(format_duration(Duration::from_secs(7)), "7s");
/// ```
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
