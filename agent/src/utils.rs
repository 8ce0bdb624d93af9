//! Utility functions

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::AgentError;

/// Version information for the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Smallest backoff unit. One minute in production.
const BACKOFF_SMALLEST_UNIT: Duration = Duration::from_secs(60);

/// Stepped exponential backoff: start with one minute and try three times,
/// then double the interval (capped at `max_interval`) and try again. After
/// three attempts at the cap the caller has tried enough.
pub fn exponential_backoff_time(tried: u32, max_interval: Duration) -> Result<Duration, AgentError> {
    backoff_time_with_unit(tried, max_interval, BACKOFF_SMALLEST_UNIT)
}

fn backoff_time_with_unit(
    tried: u32,
    max_interval: Duration,
    smallest_unit: Duration,
) -> Result<Duration, AgentError> {
    const PER_INTERVAL_ATTEMPTS: u32 = 3;

    let mut interval = smallest_unit;
    let mut next_interval = interval;

    let mut c = 0u32;
    while c <= tried {
        interval = next_interval;
        next_interval *= 2;
        if interval >= max_interval {
            if tried - c >= PER_INTERVAL_ATTEMPTS {
                // At max interval and already tried three times. Give up.
                return Err(AgentError::TriedMax);
            }

            // Never back off shorter than the smallest unit.
            if max_interval < smallest_unit {
                return Ok(smallest_unit);
            }
            return Ok(max_interval);
        }
        c += PER_INTERVAL_ATTEMPTS;
    }

    Ok(interval)
}

/// Parse a `key=value` line file (e.g. `device_type=beaglebone`) and return
/// the value for `key`.
pub fn read_key_value(contents: &str, key: &str) -> Option<String> {
    for line in contents.lines() {
        if let Some((k, v)) = line.split_once('=') {
            if k.trim() == key {
                return Some(v.trim().to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    #[test]
    fn test_backoff_schedule() {
        // With a five minute cap: 1m x3, 2m x3, 4m x3, 5m x3, then give up.
        let cap = minutes(5);
        let expected = [1u64, 1, 1, 2, 2, 2, 4, 4, 4, 5, 5, 5];
        for (tried, want) in expected.iter().enumerate() {
            assert_eq!(
                exponential_backoff_time(tried as u32, cap).unwrap(),
                minutes(*want),
                "tried={}",
                tried
            );
        }
        assert!(matches!(
            exponential_backoff_time(12, cap),
            Err(AgentError::TriedMax)
        ));
    }

    #[test]
    fn test_backoff_cap_below_unit() {
        // A cap below the smallest unit still backs off one unit.
        assert_eq!(
            exponential_backoff_time(0, Duration::from_secs(1)).unwrap(),
            minutes(1)
        );
        assert!(matches!(
            exponential_backoff_time(3, Duration::from_secs(1)),
            Err(AgentError::TriedMax)
        ));
    }

    #[test]
    fn test_backoff_small_unit() {
        let unit = Duration::from_millis(10);
        assert_eq!(
            backoff_time_with_unit(0, Duration::from_millis(40), unit).unwrap(),
            unit
        );
        assert_eq!(
            backoff_time_with_unit(5, Duration::from_millis(40), unit).unwrap(),
            Duration::from_millis(20)
        );
    }

    #[test]
    fn test_read_key_value() {
        let contents = "artifact_name=release-2\ndevice_type=vexpress-qemu\n";
        assert_eq!(
            read_key_value(contents, "device_type").as_deref(),
            Some("vexpress-qemu")
        );
        assert_eq!(
            read_key_value(contents, "artifact_name").as_deref(),
            Some("release-2")
        );
        assert_eq!(read_key_value(contents, "rootfs"), None);
    }
}
