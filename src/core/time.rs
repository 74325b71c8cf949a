//! Time primitives.
//!
//! WallClockSource: injected wall clock (admission, day keys, message stamps).
//! DayKey: event-day bucket as the user sees it, e.g. "14nov".
//!
//! Timers are scheduled on `std::time::Instant` and never touch the wall
//! clock; only admission and presentation do.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Month, OffsetDateTime, UtcOffset};

use super::error::{CoreError, InvalidId};

/// Wall clock in milliseconds since the Unix epoch.
///
/// Injected into the engine so tests can drive admission and day rollover
/// without sleeping.
pub trait WallClockSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Default source backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClockSource for SystemClock {
    fn now_ms(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

pub fn system_clock() -> Arc<dyn WallClockSource> {
    Arc::new(SystemClock)
}

/// Event-day bucket: day-of-month followed by the lowercase three-letter
/// month, computed in local time ("14nov"). Scopes one-use admission.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DayKey(String);

impl DayKey {
    /// Day key for a wall-clock instant, in the local timezone when the
    /// offset is determinable, UTC otherwise.
    pub fn from_ms_local(now_ms: u64) -> Self {
        let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
        Self::from_ms_at(now_ms, offset)
    }

    /// Day key for a wall-clock instant at an explicit offset.
    pub fn from_ms_at(now_ms: u64, offset: UtcOffset) -> Self {
        let datetime = OffsetDateTime::from_unix_timestamp((now_ms / 1000) as i64)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
            .to_offset(offset);
        Self(format!(
            "{}{}",
            datetime.day(),
            month_abbrev(datetime.month())
        ))
    }

    /// Parse a stored or wire day key. Lenient on width: "3nov" and "14nov"
    /// are both valid.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let raw = s.trim();
        let digits = raw.chars().take_while(|c| c.is_ascii_digit()).count();
        let valid = (1..=2).contains(&digits)
            && raw.len() == digits + 3
            && raw[digits..].chars().all(|c| c.is_ascii_lowercase());
        if !valid {
            return Err(InvalidId::Day {
                raw: raw.to_string(),
                reason: "expected day-of-month followed by three-letter month".into(),
            }
            .into());
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DayKey({:?})", self.0)
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn month_abbrev(month: Month) -> &'static str {
    match month {
        Month::January => "jan",
        Month::February => "feb",
        Month::March => "mar",
        Month::April => "apr",
        Month::May => "may",
        Month::June => "jun",
        Month::July => "jul",
        Month::August => "aug",
        Month::September => "sep",
        Month::October => "oct",
        Month::November => "nov",
        Month::December => "dec",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-11-14 12:00:00 UTC
    const NOV_14_NOON: u64 = 1_731_585_600_000;

    #[test]
    fn day_key_formats_day_and_month() {
        let key = DayKey::from_ms_at(NOV_14_NOON, UtcOffset::UTC);
        assert_eq!(key.as_str(), "14nov");
    }

    #[test]
    fn day_key_has_no_zero_padding() {
        // 2025-03-03 00:30:00 UTC
        let key = DayKey::from_ms_at(1_740_961_800_000, UtcOffset::UTC);
        assert_eq!(key.as_str(), "3mar");
    }

    #[test]
    fn day_key_respects_offset() {
        // One hour before midnight UTC is already the next day at +02:00.
        let near_midnight = NOV_14_NOON + 11 * 3600 * 1000;
        let utc = DayKey::from_ms_at(near_midnight, UtcOffset::UTC);
        let east = DayKey::from_ms_at(near_midnight, UtcOffset::from_hms(2, 0, 0).unwrap());
        assert_eq!(utc.as_str(), "14nov");
        assert_eq!(east.as_str(), "15nov");
    }

    #[test]
    fn parse_accepts_valid_keys() {
        assert_eq!(DayKey::parse("14nov").unwrap().as_str(), "14nov");
        assert_eq!(DayKey::parse(" 3mar ").unwrap().as_str(), "3mar");
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        assert!(DayKey::parse("").is_err());
        assert!(DayKey::parse("nov14").is_err());
        assert!(DayKey::parse("14NOV").is_err());
        assert!(DayKey::parse("14november").is_err());
        assert!(DayKey::parse("143nov").is_err());
    }
}
