//! Small shared helpers: token arithmetic and timestamps.

use chrono::{DateTime, Utc};

/// Estimate the token count of a text as `ceil(chars / 4)`.
///
/// Every budget check in the pipeline uses this same estimate so that
/// ceilings compose predictably across sections.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Truncate `text` from the tail so that its estimated token count fits
/// within `max_tokens`. Returns the text unchanged when it already fits.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    if estimate_tokens(text) <= max_tokens {
        return text.to_string();
    }
    let max_chars = max_tokens.saturating_mul(4);
    text.chars().take(max_chars).collect()
}

/// Dollar cost of a dispatch at the fixed input/output rates.
pub fn dispatch_cost_usd(input_tokens: u64, output_tokens: u64) -> f64 {
    (input_tokens as f64 * 3.0 + output_tokens as f64 * 15.0) / 1_000_000.0
}

/// Current UTC time as the RFC3339 string stored throughout the DB.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Parse an RFC3339 timestamp written by [`now_rfc3339`].
pub fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
