//! Ranking periods: ISO weeks and calendar months in UTC.
//!
//! A period is identified by a key (`2025-W45`, `2025-11`) and covers the
//! half-open window `[start, end)`.

use crate::engagement::EngagementKind;
use crate::error::{EngagementError, Result};
use chrono::{DateTime, Datelike, Months, NaiveDate, TimeDelta, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Granularity of a leaderboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    /// ISO-8601 week (Monday to Monday)
    Week,
    /// Calendar month
    Month,
}

impl PeriodType {
    /// Every period type, in a stable order.
    pub const ALL: [Self; 2] = [Self::Week, Self::Month];

    /// Wire name (`week`, `month`).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Week => "week",
            Self::Month => "month",
        }
    }
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeriodType {
    type Err = EngagementError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "week" | "weekly" => Ok(Self::Week),
            "month" | "monthly" => Ok(Self::Month),
            _ => Err(EngagementError::InvalidArgument(format!(
                "Unknown period type: {s}"
            ))),
        }
    }
}

/// A concrete period with its key and UTC window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Period {
    /// Week or month
    pub period_type: PeriodType,
    /// Canonical key (`YYYY-Www` or `YYYY-MM`)
    pub key: String,
    /// Inclusive start of the window
    pub start: DateTime<Utc>,
    /// Exclusive end of the window
    pub end: DateTime<Utc>,
}

impl Period {
    /// The period of the given type that contains `at`.
    ///
    /// # Errors
    ///
    /// Returns [`EngagementError::Internal`] if `at` lies at the edge of the
    /// representable calendar.
    ///
    /// # Examples
    ///
    /// ```
    /// # use shelfmark_core::{Period, PeriodType};
    /// # use chrono::{TimeZone, Utc};
    /// let at = Utc.with_ymd_and_hms(2025, 11, 5, 12, 0, 0).unwrap();
    /// assert_eq!(Period::containing(PeriodType::Week, at).unwrap().key, "2025-W45");
    /// assert_eq!(Period::containing(PeriodType::Month, at).unwrap().key, "2025-11");
    /// ```
    pub fn containing(period_type: PeriodType, at: DateTime<Utc>) -> Result<Self> {
        let date = at.date_naive();
        match period_type {
            PeriodType::Week => {
                let week = date.iso_week();
                Self::week(week.year(), week.week())
            }
            PeriodType::Month => Self::month(date.year(), date.month()),
        }
    }

    /// Parse a period key of the given type.
    ///
    /// # Errors
    ///
    /// Returns [`EngagementError::InvalidArgument`] if the key is malformed or
    /// names a week/month that does not exist.
    pub fn parse(period_type: PeriodType, key: &str) -> Result<Self> {
        let invalid = || EngagementError::InvalidArgument(format!("Invalid {period_type} key: {key}"));
        match period_type {
            PeriodType::Week => {
                let (year, week) = key.split_once("-W").ok_or_else(invalid)?;
                let year = year.parse::<i32>().map_err(|_| invalid())?;
                let week = week.parse::<u32>().map_err(|_| invalid())?;
                Self::week(year, week).map_err(|_| invalid())
            }
            PeriodType::Month => {
                let (year, month) = key.split_once('-').ok_or_else(invalid)?;
                let year = year.parse::<i32>().map_err(|_| invalid())?;
                let month = month.parse::<u32>().map_err(|_| invalid())?;
                Self::month(year, month).map_err(|_| invalid())
            }
        }
    }

    /// Whether `at` falls inside `[start, end)`.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    fn week(year: i32, week: u32) -> Result<Self> {
        let monday = NaiveDate::from_isoywd_opt(year, week, Weekday::Mon).ok_or_else(|| {
            EngagementError::Internal(format!("No ISO week {week} in {year}"))
        })?;
        let start = monday.and_time(chrono::NaiveTime::MIN).and_utc();
        Ok(Self {
            period_type: PeriodType::Week,
            key: format!("{year:04}-W{week:02}"),
            start,
            end: start + TimeDelta::days(7),
        })
    }

    fn month(year: i32, month: u32) -> Result<Self> {
        let first = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| EngagementError::Internal(format!("No month {month} in {year}")))?;
        let next = first
            .checked_add_months(Months::new(1))
            .ok_or_else(|| EngagementError::Internal(format!("Month overflow after {year}-{month}")))?;
        Ok(Self {
            period_type: PeriodType::Month,
            key: format!("{year:04}-{month:02}"),
            start: first.and_time(chrono::NaiveTime::MIN).and_utc(),
            end: next.and_time(chrono::NaiveTime::MIN).and_utc(),
        })
    }
}

/// Identity of one leaderboard: kind × period type × period key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaderboardKey {
    /// Like or favorite
    pub kind: EngagementKind,
    /// Week or month
    pub period_type: PeriodType,
    /// Period key
    pub period_key: String,
}

impl LeaderboardKey {
    /// Leaderboard of `kind` for the given period.
    #[must_use]
    pub fn for_period(kind: EngagementKind, period: &Period) -> Self {
        Self {
            kind,
            period_type: period.period_type,
            period_key: period.key.clone(),
        }
    }
}

impl fmt::Display for LeaderboardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.period_type, self.period_key)
    }
}
