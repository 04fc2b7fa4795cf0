//! Canonical time
//!
//! All persisted timestamps are UTC, truncated to whole milliseconds and
//! rendered as `YYYY-MM-DDTHH:MM:SS.mmmZ`. Truncation happens on construction,
//! so a `Timestamp` always round-trips through its string form unchanged.

use crate::errors::{Result, VigilError};
use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const CANONICAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Millisecond-precision UTC instant
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Truncate a chrono instant to canonical precision
    pub fn from_datetime(value: DateTime<Utc>) -> Self {
        Self(value.trunc_subsecs(3))
    }

    /// Build from milliseconds since the Unix epoch
    pub fn from_unix_millis(millis: i64) -> Result<Self> {
        Utc.timestamp_millis_opt(millis)
            .single()
            .map(Self)
            .ok_or_else(|| VigilError::invalid(format!("timestamp {millis}ms out of range")))
    }

    /// Milliseconds since the Unix epoch
    pub fn unix_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Underlying chrono value
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Canonical string rendering
    pub fn to_canonical(&self) -> String {
        self.0.format(CANONICAL_FORMAT).to_string()
    }

    /// Add whole seconds, `None` on overflow
    pub fn checked_add_secs(&self, secs: u64) -> Option<Self> {
        let millis = i64::try_from(secs).ok()?.checked_mul(1000)?;
        Self::from_unix_millis(self.unix_millis().checked_add(millis)?).ok()
    }

    /// Signed milliseconds from `earlier` to `self`
    pub fn millis_since(&self, earlier: &Timestamp) -> i64 {
        self.unix_millis().saturating_sub(earlier.unix_millis())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical())
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.to_canonical())
    }
}

impl FromStr for Timestamp {
    type Err = VigilError;

    fn from_str(value: &str) -> Result<Self> {
        let parsed = DateTime::parse_from_rfc3339(value)
            .map_err(|e| VigilError::serialization(format!("bad timestamp '{value}': {e}")))?;
        Ok(Self::from_datetime(parsed.with_timezone(&Utc)))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_canonical())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current canonical instant
    fn now(&self) -> Timestamp;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_datetime(Utc::now())
    }
}

/// Manually driven clock for deterministic tests and replays
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<Timestamp>,
}

impl ManualClock {
    /// Start at the given instant
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Start at a fixed, arbitrary epoch (2024-01-01T00:00:00.000Z)
    pub fn at_epoch() -> Self {
        Self::new(Timestamp(
            Utc.timestamp_millis_opt(1_704_067_200_000)
                .single()
                .unwrap_or_default(),
        ))
    }

    /// Move forward by whole seconds
    pub fn advance_secs(&self, secs: u64) {
        let mut current = self.current.lock();
        if let Some(next) = current.checked_add_secs(secs) {
            *current = next;
        }
    }

    /// Move forward by milliseconds
    pub fn advance_millis(&self, millis: i64) {
        let mut current = self.current.lock();
        if let Ok(next) = Timestamp::from_unix_millis(current.unix_millis().saturating_add(millis))
        {
            *current = next;
        }
    }

    /// Jump to an instant
    pub fn set(&self, value: Timestamp) {
        *self.current.lock() = value;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.current.lock()
    }
}
