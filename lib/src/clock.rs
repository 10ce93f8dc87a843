//! Wall-clock helpers.
//!
//! Timestamps in the engine are seconds since the epoch as `f64`, with NaN
//! as the "not stamped" sentinel, which keeps the request-timing arithmetic
//! (deltas, logging) trivial.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in seconds.
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Format a timestamp as an RFC 1123 date for HTTP headers.
pub fn format_http_date(t: f64) -> String {
    let t = if t.is_finite() && t >= 0.0 { t } else { 0.0 };
    httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_secs_f64(t))
}

/// Parse an HTTP date header value into a timestamp.
pub fn parse_http_date(s: &str) -> Option<f64> {
    httpdate::parse_http_date(s)
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
}
