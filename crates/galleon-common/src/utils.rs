//! Utility functions and helpers

use std::time::Duration;

use crate::error::{GalleonError, Result};

/// Time utilities
pub struct TimeUtils;

impl TimeUtils {
    /// Convert duration to human-readable string
    pub fn format_duration(duration: Duration) -> String {
        let secs = duration.as_secs();
        let millis = duration.subsec_millis();
        let micros = duration.subsec_micros() % 1000;

        if secs >= 3600 {
            format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
        } else if secs >= 60 {
            format!("{}m{:02}s", secs / 60, secs % 60)
        } else if secs > 0 {
            format!("{}.{:03}s", secs, millis)
        } else if millis > 0 {
            format!("{}.{:03}ms", millis, micros)
        } else {
            format!("{}us", duration.as_micros())
        }
    }

    /// Parse human-readable duration string
    pub fn parse_duration(duration_str: &str) -> Result<Duration> {
        humantime::parse_duration(duration_str).map_err(|e| {
            GalleonError::InvalidInput(format!("Invalid duration '{}': {}", duration_str, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(TimeUtils::format_duration(Duration::from_secs(7260)), "2h01m");
        assert_eq!(TimeUtils::format_duration(Duration::from_secs(75)), "1m15s");
        assert_eq!(TimeUtils::format_duration(Duration::from_millis(1500)), "1.500s");
        assert_eq!(TimeUtils::format_duration(Duration::from_micros(250)), "250us");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(TimeUtils::parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(TimeUtils::parse_duration("1h 30m").unwrap(), Duration::from_secs(5400));
        assert!(TimeUtils::parse_duration("soon").is_err());
    }
}
