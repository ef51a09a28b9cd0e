//! Human duration strings such as `48h` or `1h 30m`, backed by `humantime`.

use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Parse a duration like `48h`, `1h30m` or `2days`. A bare `0` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let raw = input.trim();
    if raw.is_empty() {
        bail!("empty duration");
    }
    if raw == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(raw).with_context(|| format!("invalid duration '{raw}'"))
}

pub fn format_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}
