//! Human-friendly duration strings used by the config file.
//!
//! Accepts the usual unit sequences (`300ms`, `1.5h`, `1h30m`) plus the
//! calendar shorthands `d` and `w` with fractional counts (`7d`, `0.5w`).
//! The literal `"0"` means zero. Negative values clamp to zero so that a
//! negative TTL or interval behaves like a disabled one.

use std::time::Duration;

use crate::error::{ProxyError, ProxyResult};

const SECS_PER_DAY: f64 = 86_400.0;
const SECS_PER_WEEK: f64 = 7.0 * SECS_PER_DAY;

/// Parse a duration string such as `"7d"`, `"1h30m"` or `"250ms"`.
pub fn parse_duration(input: &str) -> ProxyResult<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ProxyError::config("empty duration string"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    match unit.to_ascii_lowercase().as_str() {
        "d" => scaled(number, SECS_PER_DAY, input),
        "w" => scaled(number, SECS_PER_WEEK, input),
        _ => parse_unit_sequence(s),
    }
}

fn scaled(number: &str, secs_per_unit: f64, input: &str) -> ProxyResult<Duration> {
    let count: f64 = number.parse().map_err(|e| {
        ProxyError::config(format!("invalid number '{}' in duration '{}': {}", number, input, e))
    })?;
    Duration::try_from_secs_f64(count * secs_per_unit)
        .map_err(|e| ProxyError::config(format!("duration '{}' out of range: {}", input, e)))
}

fn unit_nanos(unit: &str) -> Option<u128> {
    let nanos = match unit {
        "ns" => 1,
        "us" | "µs" | "μs" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60 * 1_000_000_000,
        "h" => 3_600 * 1_000_000_000,
        _ => return None,
    };
    Some(nanos)
}

fn parse_unit_sequence(s: &str) -> ProxyResult<Duration> {
    let invalid = |why: &str| ProxyError::config(format!("invalid duration '{}': {}", s, why));

    let (negative, mut rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid("missing value"));
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        let number = &rest[..number_end];
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = &rest[unit_end..];

        let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
        if (whole.is_empty() && frac.is_empty()) || frac.contains('.') {
            return Err(invalid("malformed number"));
        }
        if unit.is_empty() {
            return Err(invalid("missing unit"));
        }
        let scale = unit_nanos(unit).ok_or_else(|| invalid("unknown unit"))?;

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid("number too large"))?
        };
        total = whole
            .checked_mul(scale)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| invalid("overflow"))?;

        if !frac.is_empty() {
            // More than 18 fractional digits cannot change a nanosecond total.
            let frac = &frac[..frac.len().min(18)];
            let digits: u128 = frac.parse().map_err(|_| invalid("malformed number"))?;
            let denom = 10u128.pow(frac.len() as u32);
            total = total
                .checked_add(digits * scale / denom)
                .ok_or_else(|| invalid("overflow"))?;
        }
    }

    if negative {
        return Ok(Duration::ZERO);
    }
    let nanos = u64::try_from(total).map_err(|_| invalid("overflow"))?;
    Ok(Duration::from_nanos(nanos))
}
