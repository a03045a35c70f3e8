//! Retry-After hint parsing.
//!
//! Servers express the hint three ways: HTTP delta-seconds, an HTTP-date,
//! or free text buried in an error body ("retry in 45.28s"). All three are
//! accepted; anything else yields None.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

fn free_text_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(?i)retry\s+(?:in|after)\s+(\d+(?:\.\d+)?)\s*s").unwrap(),
            Regex::new(r"(?i)retry-after:\s*(\d+(?:\.\d+)?)").unwrap(),
            Regex::new(r"(?i)wait\s+(\d+(?:\.\d+)?)\s*s").unwrap(),
        ]
    })
}

/// Parse a Retry-After hint out of a header value or error message.
pub fn parse_retry_after(text: &str) -> Option<Duration> {
    let trimmed = text.trim();

    // Bare delta-seconds (the plain header form)
    if let Ok(secs) = trimmed.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(Duration::from_secs_f64(secs));
        }
        return None;
    }

    // HTTP-date
    if let Ok(date) = DateTime::parse_from_rfc2822(trimmed) {
        let delta = date.with_timezone(&Utc) - Utc::now();
        return Some(delta.to_std().unwrap_or(Duration::ZERO));
    }

    // Free-text patterns
    for pattern in free_text_patterns() {
        if let Some(caps) = pattern.captures(trimmed) {
            if let Ok(secs) = caps[1].parse::<f64>() {
                if secs.is_finite() && secs >= 0.0 {
                    return Some(Duration::from_secs_f64(secs));
                }
            }
        }
    }

    None
}
