//! Human-readable sizes, rates and durations for status messages.

use std::time::Duration;

const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

/// Render a byte count using the largest unit that keeps the value below 1024.
///
/// Zero, negative and non-finite input all render as `0B`.
pub fn human_size(bytes: f64) -> String {
    if !bytes.is_finite() || bytes <= 0.0 {
        return "0B".to_string();
    }

    let mut unit = 0;
    let mut value = bytes;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let mut rounded = (value * 100.0).round() / 100.0;
    // 1023.999 KB rounds to 1024.0 KB; promote it instead
    if rounded >= 1024.0 && unit < UNITS.len() - 1 {
        rounded = ((rounded / 1024.0) * 100.0).round() / 100.0;
        unit += 1;
    }

    format!("{} {}", trim_decimals(rounded), UNITS[unit])
}

/// `1.50` -> `1.5`, `2.00` -> `2.0`, `1.07` -> `1.07`.
fn trim_decimals(value: f64) -> String {
    let text = format!("{value:.2}");
    let trimmed = text.trim_end_matches('0');
    if trimmed.ends_with('.') {
        format!("{trimmed}0")
    } else {
        trimmed.to_string()
    }
}

/// Average throughput in bytes per second. Zero when no time has elapsed.
pub fn rate(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / secs
    } else {
        0.0
    }
}

/// Time left at the given rate, or `None` when the rate is unknown.
pub fn eta(remaining_bytes: u64, rate: f64) -> Option<Duration> {
    if rate > 0.0 && rate.is_finite() {
        Duration::try_from_secs_f64(remaining_bytes as f64 / rate).ok()
    } else {
        None
    }
}

/// `HH:MM:SS`, hours are not wrapped at 24.
pub fn clock(duration: Duration) -> String {
    let total = duration.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}
