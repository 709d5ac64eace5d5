//! Small helpers shared by every mqflux crate.
//!
//! - Duration parsing from human strings (`"1h30m"`, `"500ms"`) with serde helpers
//! - Wall-clock timestamps in seconds, milliseconds and nanoseconds
//! - [`MonotonicClock`], a wall clock that never runs backwards
//! - [`Counter`], a current/max gauge used by the stats surfaces
//!
//! ```
//! use mqflux_utils::to_duration;
//!
//! assert_eq!(to_duration("1h30m15s").as_secs(), 5415);
//! assert_eq!(to_duration("250ms").as_millis(), 250);
//! ```

#![deny(unsafe_code)]

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::{Deserialize, Deserializer};

mod counter;

pub use counter::Counter;

/// Timestamp in seconds since Unix epoch
pub type Timestamp = i64;

/// Timestamp in milliseconds since Unix epoch
pub type TimestampMillis = i64;

/// Timestamp in nanoseconds since Unix epoch
pub type TimestampNanos = i64;

/// Deserialize Duration from human-readable string format
#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// Deserialize optional Duration from string, an empty string is `None`
#[inline]
pub fn deserialize_duration_option<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    if v.is_empty() {
        Ok(None)
    } else {
        Ok(Some(to_duration(&v)))
    }
}

/// Convert human-readable duration string to Duration
///
/// # Supported units:
/// - ms: milliseconds
/// - s: seconds
/// - m: minutes
/// - h: hours
/// - d: days
/// - w: weeks
///
/// Unknown units and malformed parts count as zero.
#[inline]
pub fn to_duration(text: &str) -> Duration {
    let text = text.to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'w', 'Y'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().trim().parse::<u64>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'Y' => v,
                's' => v * 1000,
                'm' => v * 60000,
                'h' => v * 3600000,
                'd' => v * 86400000,
                'w' => v * 604800000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}

#[inline]
fn since_epoch() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_else(|_| {
        let now = chrono::Utc::now();
        Duration::new(now.timestamp().max(0) as u64, now.timestamp_subsec_nanos())
    })
}

/// Current timestamp in seconds
#[inline]
pub fn timestamp_secs() -> Timestamp {
    since_epoch().as_secs() as i64
}

/// Current timestamp in milliseconds
#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    since_epoch().as_millis() as i64
}

/// Current timestamp in nanoseconds
#[inline]
pub fn timestamp_nanos() -> TimestampNanos {
    since_epoch().as_nanos() as i64
}

/// Format a millisecond timestamp as local time
#[inline]
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    if t <= 0 {
        "".into()
    } else {
        use chrono::TimeZone;
        if let chrono::LocalResult::Single(t) = chrono::Local.timestamp_millis_opt(t) {
            t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
        } else {
            "".into()
        }
    }
}

/// Format the current time as local time with millisecond precision
#[inline]
pub fn format_timestamp_millis_now() -> String {
    format_timestamp_millis(timestamp_millis())
}

/// Nanosecond wall clock whose readings never decrease.
///
/// When the system clock steps backwards the last reading is returned
/// until the wall clock catches up again.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { last: AtomicI64::new(0) }
    }

    #[inline]
    pub fn now_nanos(&self) -> TimestampNanos {
        let now = timestamp_nanos();
        let prev = self.last.fetch_max(now, Ordering::SeqCst);
        prev.max(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_units() {
        assert_eq!(to_duration("1s"), Duration::from_secs(1));
        assert_eq!(to_duration("10m"), Duration::from_secs(600));
        assert_eq!(to_duration("1h30m15s").as_secs(), 5415);
        assert_eq!(to_duration("2w3d12h").as_secs(), 1_512_000);
        assert_eq!(to_duration("100ms"), Duration::from_millis(100));
        assert_eq!(to_duration("1s500ms"), Duration::from_millis(1500));
        assert_eq!(to_duration("abc"), Duration::ZERO);
    }

    #[test]
    fn duration_from_config_value() {
        #[derive(serde::Deserialize)]
        struct Cfg {
            #[serde(deserialize_with = "deserialize_duration")]
            timeout: Duration,
            #[serde(default, deserialize_with = "deserialize_duration_option")]
            ttl: Option<Duration>,
        }
        let cfg: Cfg = serde_json::from_str(r#"{"timeout":"30s","ttl":""}"#).unwrap();
        assert_eq!(cfg.timeout, Duration::from_secs(30));
        assert_eq!(cfg.ttl, None);
    }

    #[test]
    fn monotonic_clock_never_decreases() {
        let clock = MonotonicClock::new();
        let mut prev = clock.now_nanos();
        for _ in 0..1000 {
            let now = clock.now_nanos();
            assert!(now >= prev);
            prev = now;
        }
        assert!(prev > 1_600_000_000_000_000_000);
    }

    #[test]
    fn timestamps_agree() {
        let secs = timestamp_secs();
        let millis = timestamp_millis();
        assert!((millis / 1000 - secs).abs() <= 1);
        assert!(!format_timestamp_millis_now().is_empty());
        assert_eq!(format_timestamp_millis(0), "");
    }
}
