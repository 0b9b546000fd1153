use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};

/// Common date/time formats used throughout the application
pub mod formats {
    /// Human-readable format for display: "2024-01-20 15:30:00"
    pub const DISPLAY_FULL: &str = "%Y-%m-%d %H:%M:%S";

    /// Date-only format for display: "2024-01-20"
    pub const DISPLAY_DATE: &str = "%Y-%m-%d";
}

/// Current Unix timestamp in milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert an epoch-milliseconds timestamp to a UTC datetime
pub fn datetime_from_ms(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .with_context(|| format!("Timestamp out of range: {ms}"))
}

/// Format an epoch-milliseconds timestamp for human-readable display
pub fn format_ms_for_display(ms: i64) -> String {
    datetime_from_ms(ms)
        .map(|dt| dt.format(formats::DISPLAY_FULL).to_string())
        .unwrap_or_else(|_| format!("invalid timestamp {ms}"))
}

/// Render a duration (in milliseconds) as a rough human phrase, the way a
/// notification reads: "34 minutes", "3 days", "2 years". Values are floored,
/// so a 47-hour span reads "1 day".
pub fn relative_duration_phrase(duration_ms: i64) -> String {
    const MINUTE: i64 = 60_000;
    const HOUR: i64 = 60 * MINUTE;
    const DAY: i64 = 24 * HOUR;
    const MONTH: i64 = 30 * DAY;
    const YEAR: i64 = 365 * DAY;

    let ms = duration_ms.max(0);

    let (count, unit) = if ms >= YEAR {
        (ms / YEAR, "year")
    } else if ms >= MONTH {
        (ms / MONTH, "month")
    } else if ms >= DAY {
        (ms / DAY, "day")
    } else if ms >= HOUR {
        (ms / HOUR, "hour")
    } else if ms >= MINUTE {
        (ms / MINUTE, "minute")
    } else {
        return "a few seconds".to_string();
    };

    if count == 1 {
        format!("1 {unit}")
    } else {
        format!("{count} {unit}s")
    }
}
