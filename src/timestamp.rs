//! # Timestamp Utility
//!
//! Canonical local timestamps (`YYYY/MM/DD HH:MM:SS`, 24-hour clock) used by
//! command envelopes and session history entries.

use chrono::{DateTime, Local, TimeZone};

/// Format string for the canonical timestamp
pub const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Format a point in time as a canonical timestamp string
///
/// # Examples
///
/// ```
/// use bms_link::timestamp::format_timestamp;
/// use chrono::{Local, TimeZone};
///
/// let at = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();
/// assert_eq!(format_timestamp(&at), "2024/03/07 09:05:02");
/// ```
pub fn format_timestamp<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Canonical timestamp for the current local time
pub fn now() -> String {
    format_timestamp(&Local::now())
}

/// Source of timestamps for envelopes and history entries
#[cfg_attr(test, mockall::automock)]
pub trait TimestampProvider: Send + Sync {
    /// Current canonical timestamp
    fn timestamp(&self) -> String;
}

/// Wall-clock provider backed by the local timezone
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClock;

impl TimestampProvider for LocalClock {
    fn timestamp(&self) -> String {
        now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_format_pads_fields() {
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_timestamp(&at), "2025/01/02 03:04:05");
    }

    #[test]
    fn test_format_uses_24_hour_clock() {
        let at = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 58).unwrap();
        assert_eq!(format_timestamp(&at), "2025/12/31 23:59:58");
    }

    #[test]
    fn test_local_clock_shape() {
        let ts = LocalClock.timestamp();
        // "YYYY/MM/DD HH:MM:SS"
        assert_eq!(ts.len(), 19, "Unexpected timestamp: {}", ts);
        assert_eq!(&ts[4..5], "/");
        assert_eq!(&ts[7..8], "/");
        assert_eq!(&ts[10..11], " ");
        assert_eq!(&ts[13..14], ":");
    }
}
