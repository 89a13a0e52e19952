//! Closed date intervals used for case windows and archive coverage.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::error::ConfigurationError;

/// A closed interval `[start, end]` of calendar dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawInterval", into = "RawInterval")]
pub struct DateInterval {
    start: NaiveDate,
    end: NaiveDate,
}

#[derive(Serialize, Deserialize)]
struct RawInterval {
    start: NaiveDate,
    end: NaiveDate,
}

impl TryFrom<RawInterval> for DateInterval {
    type Error = ConfigurationError;

    fn try_from(raw: RawInterval) -> Result<Self, Self::Error> {
        Self::new(raw.start, raw.end)
    }
}

impl From<DateInterval> for RawInterval {
    fn from(interval: DateInterval) -> Self {
        Self {
            start: interval.start,
            end: interval.end,
        }
    }
}

impl DateInterval {
    /// Build an interval, rejecting `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ConfigurationError> {
        if start > end {
            return Err(ConfigurationError::InvalidInterval {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Whether `self` fully encloses `other`.
    pub fn contains(&self, other: &DateInterval) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    /// Whether `self` and `other` share at least one day.
    pub fn overlaps(&self, other: &DateInterval) -> bool {
        self.start <= other.end && self.end >= other.start
    }
}

impl fmt::Display for DateInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// `a` fully encloses `b`.
pub fn contains(a: &DateInterval, b: &DateInterval) -> bool {
    a.contains(b)
}

/// `a` and `b` intersect.
pub fn overlaps(a: &DateInterval, b: &DateInterval) -> bool {
    a.overlaps(b)
}
