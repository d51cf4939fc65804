//! Human-readable formatting for CLI output.

use duplex_core::SessionStats;
use std::time::Duration;

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{size:.2} {}", UNITS[unit_index])
}

/// Format duration in human-readable format
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// One-line summary of session byte counters
#[must_use]
pub fn format_stats(stats: &SessionStats) -> String {
    format!(
        "sent {} wifi / {} mobile, received {} wifi / {} mobile",
        format_bytes(stats.bytes_sent_wifi),
        format_bytes(stats.bytes_sent_mobile),
        format_bytes(stats.bytes_received_wifi),
        format_bytes(stats.bytes_received_mobile)
    )
}
