// Duration parsing for document intervals and CLI flags.
// Accepts a bare number (seconds), a float, or a number with a unit suffix:
// ms, s/sec, m/min, h/hour. A bare "5" in a runbook means five seconds.

use std::time::Duration;

use crate::errors::{Result, RundownError};

pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Ok(Duration::ZERO);
    }
    if let Ok(secs) = s.parse::<f64>() {
        if secs < 0.0 {
            return Err(invalid(input));
        }
        return Ok(Duration::from_secs_f64(secs));
    }
    let split = s.find(|c: char| !c.is_ascii_digit() && c != '.').ok_or_else(|| invalid(input))?;
    let (num, unit) = s.split_at(split);
    let value: f64 = num.trim().parse().map_err(|_| invalid(input))?;
    let factor = match unit.trim() {
        "ms" | "msec" => 0.001,
        "s" | "sec" | "secs" | "second" | "seconds" => 1.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60.0,
        "h" | "hour" | "hours" => 3600.0,
        _ => return Err(invalid(input)),
    };
    Ok(Duration::from_secs_f64(value * factor))
}

fn invalid(input: &str) -> RundownError {
    RundownError::Expr { expr: input.to_string(), message: "invalid duration".to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_number_is_seconds() {
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("0.5").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn unit_suffixes() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10sec").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("2min").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn empty_is_zero() {
        assert_eq!(parse_duration("").unwrap(), Duration::ZERO);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10 parsecs").is_err());
        assert!(parse_duration("-3").is_err());
    }
}
