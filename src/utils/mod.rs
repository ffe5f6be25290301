//! Utility functions and helpers.

pub mod http;
pub mod log;

use chrono::{DateTime, TimeZone, Utc};
use url::Url;

/// Resolve a potentially relative URL against a base URL.
pub fn resolve_url(base: &Url, href: &str) -> String {
    base.join(href)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

/// Human readable UTC timestamp used in log lines.
pub fn fmt_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Convert a millisecond epoch value (as found in listing markup) to seconds
/// precision.
pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(millis.div_euclid(1000), 0).single()
}

/// Convert a fractional second epoch value (as returned by the API).
pub fn from_secs_f64(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    Utc.timestamp_opt(secs.trunc() as i64, 0).single()
}

/// Current time truncated to whole seconds, matching stored precision.
pub fn now_secs() -> DateTime<Utc> {
    Utc.timestamp_opt(Utc::now().timestamp(), 0)
        .single()
        .unwrap_or_else(Utc::now)
}
