//! Human-readable duration parsing, grounded on the original daemon's
//! `advgetopt::validator_duration` used by `daemon/cache.cpp` for the
//! `cache=ttl=<duration>` parameter.
//!
//! Accepts a bare number of seconds (`"30"`), or a number immediately
//! followed by a single unit suffix: `s` (seconds), `m` (minutes), `h`
//! (hours), `d` (days), e.g. `"3h"`, `"1m"`.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DurationParseError {
    #[error("empty duration string")]
    Empty,
    #[error("not a valid number")]
    NotANumber,
    #[error("unknown duration unit")]
    UnknownUnit,
}

pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(DurationParseError::Empty);
    }

    let (number_part, unit) = match input.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&input[..input.len() - 1], c),
        _ => (input, 's'),
    };

    let value: f64 = number_part
        .parse()
        .map_err(|_| DurationParseError::NotANumber)?;

    let seconds = match unit {
        's' => value,
        'm' => value * 60.0,
        'h' => value * 3600.0,
        'd' => value * 86_400.0,
        _ => return Err(DurationParseError::UnknownUnit),
    };

    if seconds < 0.0 {
        return Err(DurationParseError::NotANumber);
    }

    Ok(Duration::from_secs_f64(seconds))
}
