//! Timestamps and requested timestamp sets.
//!
//! Timestamps are whole seconds since the Unix epoch, matching the
//! resolution of OSM edit metadata. [`Timestamps`] is the ordered,
//! deduplicated set of instants a query asks about; its [`Timestamps::floor`]
//! is the floor lookup shared by the history iterator and by
//! timestamp aggregation.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Duration, Months, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in time, in seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a timestamp from seconds since the epoch.
    pub const fn from_epoch_seconds(seconds: i64) -> Self {
        Self(seconds)
    }

    /// Seconds since the epoch.
    pub const fn epoch_seconds(&self) -> i64 {
        self.0
    }

    /// The current time, truncated to whole seconds.
    pub fn now() -> Self {
        Self::from(Utc::now())
    }

    /// Parse an ISO-8601 timestamp.
    ///
    /// Accepts full RFC 3339 (`2014-01-01T00:00:00Z`), a zone-less date-time
    /// (interpreted as UTC) and a plain date.
    pub fn parse(input: &str) -> EngineResult<Self> {
        let input = input.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
            return Ok(Self(dt.timestamp()));
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S") {
            return Ok(Self(dt.and_utc().timestamp()));
        }
        if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
            if let Some(dt) = date.and_hms_opt(0, 0, 0) {
                return Ok(Self(dt.and_utc().timestamp()));
            }
        }
        Err(EngineError::InvalidTimestamp(input.to_string()))
    }

    /// Convert to a chrono date-time, if representable.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.0, 0)
    }

    /// Advance this timestamp by a calendar period.
    pub fn checked_add(&self, period: &Period) -> EngineResult<Self> {
        let overflow = || EngineError::InvalidTimestamp(format!("{self} + {period} overflows"));
        let mut dt = self.to_datetime().ok_or_else(overflow)?;
        if period.months > 0 {
            dt = dt
                .checked_add_months(Months::new(period.months))
                .ok_or_else(overflow)?;
        }
        if period.seconds > 0 {
            dt = dt
                .checked_add_signed(Duration::seconds(period.seconds))
                .ok_or_else(overflow)?;
        }
        Ok(Self(dt.timestamp()))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%SZ")),
            None => write!(f, "@{}", self.0),
        }
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }
}

/// A calendar period such as `P1M` or `PT6H`.
///
/// Months (and years) use calendar arithmetic, so `P1M` from January 31st
/// lands on the last day of February.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    months: u32,
    seconds: i64,
}

impl Period {
    /// A period of whole months.
    pub fn months(months: u32) -> Self {
        Self { months, seconds: 0 }
    }

    /// A period of whole days.
    pub fn days(days: i64) -> Self {
        Self {
            months: 0,
            seconds: days * 86_400,
        }
    }

    /// A period of whole hours.
    pub fn hours(hours: i64) -> Self {
        Self {
            months: 0,
            seconds: hours * 3_600,
        }
    }

    /// Parse an ISO-8601 duration (`P[nY][nM][nW][nD][T[nH][nM][nS]]`).
    pub fn parse(input: &str) -> EngineResult<Self> {
        let invalid = || EngineError::InvalidTimestamp(format!("invalid period '{input}'"));
        let upper = input.trim().to_ascii_uppercase();
        let mut chars = upper.chars();
        if chars.next() != Some('P') {
            return Err(invalid());
        }

        let mut months: u32 = 0;
        let mut seconds: i64 = 0;
        let mut in_time = false;
        let mut digits = String::new();
        for c in chars {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            if c == 'T' {
                if in_time || !digits.is_empty() {
                    return Err(invalid());
                }
                in_time = true;
                continue;
            }
            let n: i64 = digits.parse().map_err(|_| invalid())?;
            digits.clear();
            match (in_time, c) {
                (false, 'Y') => months += u32::try_from(n * 12).map_err(|_| invalid())?,
                (false, 'M') => months += u32::try_from(n).map_err(|_| invalid())?,
                (false, 'W') => seconds += n * 7 * 86_400,
                (false, 'D') => seconds += n * 86_400,
                (true, 'H') => seconds += n * 3_600,
                (true, 'M') => seconds += n * 60,
                (true, 'S') => seconds += n,
                _ => return Err(invalid()),
            }
        }
        if !digits.is_empty() || (months == 0 && seconds == 0) {
            return Err(invalid());
        }
        Ok(Self { months, seconds })
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P")?;
        if self.months > 0 {
            write!(f, "{}M", self.months)?;
        }
        if self.seconds > 0 {
            write!(f, "T{}S", self.seconds)?;
        }
        Ok(())
    }
}

/// An ordered, deduplicated, non-empty set of requested timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Timestamps {
    values: Vec<Timestamp>,
}

impl Timestamps {
    /// A single instant.
    pub fn single(timestamp: Timestamp) -> Self {
        Self {
            values: vec![timestamp],
        }
    }

    /// An explicit list of instants, sorted and deduplicated.
    pub fn list(timestamps: impl IntoIterator<Item = Timestamp>) -> EngineResult<Self> {
        let mut values: Vec<Timestamp> = timestamps.into_iter().collect();
        if values.is_empty() {
            return Err(EngineError::invalid_configuration(
                "timestamp list must not be empty",
            ));
        }
        values.sort_unstable();
        values.dedup();
        Ok(Self { values })
    }

    /// The two endpoints of a time range.
    pub fn range(start: Timestamp, end: Timestamp) -> EngineResult<Self> {
        if end < start {
            return Err(EngineError::invalid_configuration(format!(
                "range end {end} precedes start {start}"
            )));
        }
        Self::list([start, end])
    }

    /// Regular instants from `start`, stepping by `period`, up to and
    /// including `end`.
    pub fn interval(start: Timestamp, end: Timestamp, period: Period) -> EngineResult<Self> {
        if end < start {
            return Err(EngineError::invalid_configuration(format!(
                "interval end {end} precedes start {start}"
            )));
        }
        if period.months == 0 && period.seconds <= 0 {
            return Err(EngineError::invalid_configuration(format!(
                "interval period {period} does not advance"
            )));
        }
        let mut values = Vec::new();
        let mut current = start;
        while current <= end {
            values.push(current);
            current = current.checked_add(&period)?;
        }
        Ok(Self { values })
    }

    /// Parse `start/end/period` (e.g. `2010-01-01/2015-01-01/P1Y`), a
    /// `start/end` range, or a single timestamp.
    pub fn parse(input: &str) -> EngineResult<Self> {
        let parts: Vec<&str> = input.split('/').collect();
        match parts.as_slice() {
            [single] => Ok(Self::single(Timestamp::parse(single)?)),
            [start, end] => Self::range(Timestamp::parse(start)?, Timestamp::parse(end)?),
            [start, end, period] => Self::interval(
                Timestamp::parse(start)?,
                Timestamp::parse(end)?,
                Period::parse(period)?,
            ),
            _ => Err(EngineError::InvalidTimestamp(input.to_string())),
        }
    }

    /// The earliest requested instant.
    pub fn first(&self) -> Timestamp {
        self.values[0]
    }

    /// The latest requested instant.
    pub fn last(&self) -> Timestamp {
        self.values[self.values.len() - 1]
    }

    /// Number of requested instants.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Always false; the set is never empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate the instants in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Timestamp> + '_ {
        self.values.iter().copied()
    }

    /// The instants as a sorted slice.
    pub fn as_slice(&self) -> &[Timestamp] {
        &self.values
    }

    /// The greatest requested instant that is `<= timestamp`.
    pub fn floor(&self, timestamp: Timestamp) -> Option<Timestamp> {
        let idx = self.values.partition_point(|t| *t <= timestamp);
        idx.checked_sub(1).map(|i| self.values[i])
    }
}

/// Start of the default query range, 2008-01-01T00:00:00Z.
const DEFAULT_START: Timestamp = Timestamp::from_epoch_seconds(1_199_145_600);

impl Default for Timestamps {
    /// Monthly instants from 2008-01-01 up to now.
    fn default() -> Self {
        Self::interval(DEFAULT_START, Timestamp::now(), Period::months(1))
            .unwrap_or_else(|_| Self::single(DEFAULT_START))
    }
}
