//! Quota accounting periods with deterministic UTC boundaries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Hour,
    Day,
    Month,
}

const HOUR_S: u64 = 60 * 60;
const DAY_S: u64 = 24 * HOUR_S;

impl Period {
    pub const ALL: [Period; 3] = [Period::Hour, Period::Day, Period::Month];

    /// `[start, end)` of the period containing `now_unix_s`, in unix seconds.
    ///
    /// Hour and day boundaries are pure modular arithmetic; months follow the
    /// calendar.
    pub fn bounds(self, now_unix_s: u64) -> (u64, u64) {
        match self {
            Period::Hour => {
                let start = now_unix_s - now_unix_s % HOUR_S;
                (start, start + HOUR_S)
            }
            Period::Day => {
                let start = now_unix_s - now_unix_s % DAY_S;
                (start, start + DAY_S)
            }
            Period::Month => {
                let Some(dt) = DateTime::<Utc>::from_timestamp(now_unix_s as i64, 0) else {
                    return (now_unix_s, now_unix_s);
                };
                let (year, month) = (dt.year(), dt.month());
                let (next_year, next_month) = if month == 12 {
                    (year + 1, 1)
                } else {
                    (year, month + 1)
                };

                let start = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single();
                let end = Utc.with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0).single();
                match (start, end) {
                    (Some(s), Some(e)) => (s.timestamp() as u64, e.timestamp() as u64),
                    _ => (now_unix_s, now_unix_s),
                }
            }
        }
    }

    pub fn start(self, now_unix_s: u64) -> u64 {
        self.bounds(now_unix_s).0
    }

    pub fn end(self, now_unix_s: u64) -> u64 {
        self.bounds(now_unix_s).1
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Period::Hour => "hour",
            Period::Day => "day",
            Period::Month => "month",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(Period::Hour),
            "day" => Ok(Period::Day),
            "month" => Ok(Period::Month),
            other => Err(format!("invalid period: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-15T13:27:45Z
    const NOW: u64 = 1_710_509_265;

    #[test]
    fn hour_bounds_truncate_to_the_hour() {
        let (start, end) = Period::Hour.bounds(NOW);
        assert_eq!(start % HOUR_S, 0);
        assert_eq!(end - start, HOUR_S);
        assert!(start <= NOW && NOW < end);
    }

    #[test]
    fn day_bounds_truncate_to_midnight() {
        let (start, end) = Period::Day.bounds(NOW);
        assert_eq!(start % DAY_S, 0);
        assert_eq!(end - start, DAY_S);
        assert!(start <= NOW && NOW < end);
    }

    #[test]
    fn month_bounds_follow_the_calendar() {
        let (start, end) = Period::Month.bounds(NOW);
        // 2024-03-01T00:00:00Z .. 2024-04-01T00:00:00Z
        assert_eq!(start, 1_709_251_200);
        assert_eq!(end, 1_711_929_600);
    }

    #[test]
    fn december_rolls_into_next_year() {
        // 2023-12-31T23:59:59Z
        let (start, end) = Period::Month.bounds(1_704_067_199);
        assert_eq!(start, 1_701_388_800); // 2023-12-01
        assert_eq!(end, 1_704_067_200); // 2024-01-01
    }

    #[test]
    fn boundaries_are_deterministic_across_the_period() {
        for period in Period::ALL {
            let (start, end) = period.bounds(NOW);
            assert_eq!(period.bounds(start), (start, end));
            assert_eq!(period.bounds(end - 1), (start, end));
            // The instant after the boundary lands in the next period.
            assert_eq!(period.bounds(end).0, end);
        }
    }
}
