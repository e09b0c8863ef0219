//! Human-readable duration parsing.
//!
//! Accepted forms (case-insensitive, whitespace-tolerant between parts):
//! - bare integers: seconds ("90" -> 90s)
//! - single unit: "500ms", "90s", "5m", "2h", "1d"
//! - compound: "1h30m", "2m 30s", "1d2h"
//!
//! Units: ms, s/sec/secs, m/min/mins, h/hr/hrs, d/day/days.

use std::time::Duration;

use conveyor_types::error::DurationError;

/// Parse a human-readable duration string into a `Duration`.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationError::Empty);
    }

    // Bare integer means seconds.
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let lower = trimmed.to_lowercase();
    let mut total_ms: u64 = 0;
    let mut number = String::new();
    let mut unit = String::new();
    let mut saw_part = false;

    // Walk number/unit pairs; flush a pair whenever a digit follows a unit.
    let mut chars = lower.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            continue;
        }
        if c.is_ascii_digit() {
            if !unit.is_empty() {
                total_ms = total_ms
                    .checked_add(part_ms(&number, &unit, input)?)
                    .ok_or_else(|| DurationError::Invalid(input.to_string()))?;
                number.clear();
                unit.clear();
                saw_part = true;
            }
            number.push(c);
        } else if c.is_ascii_alphabetic() {
            if number.is_empty() {
                return Err(DurationError::Invalid(input.to_string()));
            }
            unit.push(c);
        } else {
            return Err(DurationError::Invalid(input.to_string()));
        }
    }

    if !number.is_empty() {
        if unit.is_empty() {
            return Err(DurationError::Invalid(input.to_string()));
        }
        total_ms = total_ms
            .checked_add(part_ms(&number, &unit, input)?)
            .ok_or_else(|| DurationError::Invalid(input.to_string()))?;
        saw_part = true;
    }

    if !saw_part {
        return Err(DurationError::Invalid(input.to_string()));
    }

    Ok(Duration::from_millis(total_ms))
}

fn part_ms(number: &str, unit: &str, input: &str) -> Result<u64, DurationError> {
    let n: u64 = number
        .parse()
        .map_err(|_| DurationError::Invalid(input.to_string()))?;
    let factor = match unit {
        "ms" => 1,
        "s" | "sec" | "secs" => 1_000,
        "m" | "min" | "mins" => 60_000,
        "h" | "hr" | "hrs" => 3_600_000,
        "d" | "day" | "days" => 86_400_000,
        other => {
            return Err(DurationError::UnknownUnit {
                input: input.to_string(),
                unit: other.to_string(),
            })
        }
    };
    n.checked_mul(factor)
        .ok_or_else(|| DurationError::Invalid(input.to_string()))
}

/// Parse an optional duration field, falling back to a default.
pub fn parse_duration_or(input: Option<&str>, default: Duration) -> Duration {
    match input {
        Some(s) => parse_duration(s).unwrap_or(default),
        None => default,
    }
}
