//! Duration strings in configuration files.
//!
//! Durations are written in humantime form: `200ms`, `30s`, `1m 30s`.

use std::time::Duration;

/// Per-branch timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Parse a duration string.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s.trim())
        .map_err(|e| format!("invalid duration '{}': {} (expected e.g. 200ms, 30s, 1m)", s, e))
}

/// Parse an optional duration string, falling back to [`DEFAULT_TIMEOUT`] when empty.
pub fn parse_timeout(s: &str) -> Result<Duration, String> {
    if s.trim().is_empty() {
        return Ok(DEFAULT_TIMEOUT);
    }
    parse_duration(s)
}

/// Format a duration the way it is written in configuration.
pub fn format_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_humantime() {
        assert_eq!(parse_duration("200ms").unwrap(), Duration::from_millis(200));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1m 30s").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn test_parse_invalid() {
        let err = parse_duration("soon").unwrap_err();
        assert!(err.contains("soon"));
        assert!(parse_duration("10").is_err());
    }

    #[test]
    fn test_empty_timeout_defaults() {
        assert_eq!(parse_timeout("").unwrap(), DEFAULT_TIMEOUT);
        assert_eq!(parse_timeout("5s").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_format_round_trip() {
        assert_eq!(format_duration(Duration::from_millis(200)), "200ms");
    }
}
