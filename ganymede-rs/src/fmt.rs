//! Provides formatting and parsing helpers for durations.
//!
//! Durations show up in two places: the config accepts human friendly values like `5s` or
//! `250ms` (e.g. **storage.redis.command_timeout**) and the diagnostic commands report call
//! durations in a compact form.
use std::fmt::Write;
use std::time::Duration;

/// Formats a duration given in microseconds using the most concise unit.
///
/// # Examples
///
/// ```
/// assert_eq!(ganymede::fmt::format_short_duration(100), "100 us");
/// assert_eq!(ganymede::fmt::format_short_duration(8_192), "8.19 ms");
/// assert_eq!(ganymede::fmt::format_short_duration(32_768), "32.8 ms");
/// assert_eq!(ganymede::fmt::format_short_duration(128_123), "128 ms");
/// assert_eq!(ganymede::fmt::format_short_duration(1_128_123), "1.13 s");
/// assert_eq!(ganymede::fmt::format_short_duration(101_000_000), "101 s");
/// ```
pub fn format_short_duration(micros: u64) -> String {
    match micros {
        0..=999 => format!("{} us", micros),
        1_000..=9_999 => format!("{:.2} ms", micros as f64 / 1_000.),
        10_000..=99_999 => format!("{:.1} ms", micros as f64 / 1_000.),
        100_000..=999_999 => format!("{} ms", micros / 1_000),
        1_000_000..=9_999_999 => format!("{:.2} s", micros as f64 / 1_000_000.),
        10_000_000..=99_999_999 => format!("{:.1} s", micros as f64 / 1_000_000.),
        _ => format!("{} s", micros / 1_000_000),
    }
}

/// Parses a duration like `250ms`, `5s`, `3m`, `2h` or `1d`.
///
/// A number without a unit is treated as milliseconds.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(ganymede::fmt::parse_duration("100 ms").unwrap(), Duration::from_millis(100));
/// assert_eq!(ganymede::fmt::parse_duration("5s").unwrap(), Duration::from_secs(5));
/// assert_eq!(ganymede::fmt::parse_duration("3 M").unwrap(), Duration::from_secs(3 * 60));
/// assert_eq!(ganymede::fmt::parse_duration("2h").unwrap(), Duration::from_secs(2 * 60 * 60));
/// assert_eq!(ganymede::fmt::parse_duration("1d").unwrap(), Duration::from_secs(24 * 60 * 60));
/// assert_eq!(ganymede::fmt::parse_duration("750").unwrap(), Duration::from_millis(750));
///
/// assert_eq!(ganymede::fmt::parse_duration("3 Y").is_err(), true);
/// assert_eq!(ganymede::fmt::parse_duration("1.2s").is_err(), true);
/// assert_eq!(ganymede::fmt::parse_duration("-1m").is_err(), true);
/// ```
pub fn parse_duration(str: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref NUMBER_AND_UNIT: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *(ms|s|m|h|d|MS|S|M|H|D)? *$").unwrap();
    }

    let captures = NUMBER_AND_UNIT.captures(str.as_ref()).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' as duration. Expected a positive number optionally followed by \
             'ms', 's', 'm', 'h' or 'd'.",
            str.as_ref()
        )
    })?;

    let number = captures[1].parse::<u64>()?;
    let unit = captures
        .get(2)
        .map(|unit| unit.as_str().to_lowercase())
        .unwrap_or_default();

    Ok(match unit.as_str() {
        "s" => Duration::from_secs(number),
        "m" => Duration::from_secs(number * 60),
        "h" => Duration::from_secs(number * 60 * 60),
        "d" => Duration::from_secs(number * 60 * 60 * 24),
        _ => Duration::from_millis(number),
    })
}

/// Formats a duration into a string like "1d 3h 17m 2s 12ms".
///
/// Units which are zero are skipped.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(ganymede::fmt::format_duration(Duration::from_millis(13)), "13ms");
/// assert_eq!(ganymede::fmt::format_duration(Duration::from_millis(62_013)), "1m 2s 13ms");
/// assert_eq!(ganymede::fmt::format_duration(Duration::from_secs(60 * 61)), "1h 1m");
/// assert_eq!(ganymede::fmt::format_duration(Duration::from_secs(24 * 60 * 60 + 59)), "1d 59s");
/// assert_eq!(ganymede::fmt::format_duration(Duration::ZERO), "0ms");
/// ```
pub fn format_duration(duration: Duration) -> String {
    const UNITS: [(u128, &str); 5] = [
        (1000 * 60 * 60 * 24, "d"),
        (1000 * 60 * 60, "h"),
        (1000 * 60, "m"),
        (1000, "s"),
        (1, "ms"),
    ];

    let mut result = String::new();
    let mut remainder = duration.as_millis();
    for (millis_per_unit, unit) in UNITS {
        let amount = remainder / millis_per_unit;
        if amount > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}{}", amount, unit);
            remainder %= millis_per_unit;
        }
    }

    if result.is_empty() {
        result.push_str("0ms");
    }

    result
}
