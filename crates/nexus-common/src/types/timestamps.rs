//! Timestamp type for lock events and deadlock records.

use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch.
///
/// Lock events carry the time the lock manager stamped on them. Wait
/// intervals are differences between two of these, whichever clock the
/// later one came from.
///
/// ```rust
/// use nexus_common::types::Timestamp;
/// use std::time::Duration;
///
/// let granted = Timestamp::from_secs(10);
/// let blocked = granted.add(Duration::from_millis(1500));
/// assert_eq!(blocked.saturating_duration_since(granted), Duration::from_millis(1500));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The epoch itself; also the "nothing seen yet" watermark.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw microsecond count.
    #[inline]
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Whole seconds, saturating at the end of the range.
    #[inline]
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000_000))
    }

    /// Reads the system clock. A clock set before 1970 reads as [`Self::ZERO`].
    #[must_use]
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(u64::try_from(since_epoch.as_micros()).unwrap_or(u64::MAX))
    }

    /// Raw microsecond count, as carried on the wire.
    #[inline]
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Time from `earlier` to `self`; zero when `earlier` is the later one.
    #[inline]
    #[must_use]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    /// Moves forward by `duration`, saturating.
    #[inline]
    #[must_use]
    pub fn add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(micros_of(duration)))
    }

    /// Moves back by `duration`, stopping at the epoch.
    #[inline]
    #[must_use]
    pub fn sub(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(micros_of(duration)))
    }
}

#[inline]
fn micros_of(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}us)", self.0)
    }
}

impl fmt::Display for Timestamp {
    /// RFC 3339 in UTC with microseconds; raw microseconds for the epoch
    /// and anything chrono cannot represent.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let utc = i64::try_from(self.0)
            .ok()
            .filter(|&micros| micros > 0)
            .and_then(DateTime::from_timestamp_micros);
        match utc {
            Some(utc) => f.write_str(&utc.to_rfc3339_opts(SecondsFormat::Micros, true)),
            None => write!(f, "{}us", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_and_units() {
        assert!(Timestamp::now() > Timestamp::from_secs(1_600_000_000));
        assert_eq!(Timestamp::from_secs(3).as_micros(), 3_000_000);
        assert_eq!(Timestamp::from_secs(u64::MAX).as_micros(), u64::MAX);
    }

    #[test]
    fn test_saturating_arithmetic() {
        let ts = Timestamp::from_secs(1);
        let later = ts.add(Duration::from_millis(250));
        assert_eq!(later.as_micros(), 1_250_000);
        assert_eq!(later.sub(Duration::from_millis(250)), ts);

        assert_eq!(later.saturating_duration_since(ts), Duration::from_millis(250));
        assert_eq!(ts.saturating_duration_since(later), Duration::ZERO);

        assert_eq!(ts.sub(Duration::from_secs(5)), Timestamp::ZERO);
        assert_eq!(later.add(Duration::MAX).as_micros(), u64::MAX);
    }

    #[test]
    fn test_rfc3339_display() {
        let ts = Timestamp::from_secs(1_700_000_000).add(Duration::from_micros(42));
        assert_eq!(ts.to_string(), "2023-11-14T22:13:20.000042Z");
        assert_eq!(Timestamp::ZERO.to_string(), "0us");
        assert_eq!(format!("{:?}", Timestamp::from_micros(7)), "Timestamp(7us)");
    }
}
