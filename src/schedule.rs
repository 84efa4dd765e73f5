//! Five-field cron expressions.
//!
//! `minute hour day-of-month month day-of-week`, evaluated in UTC. Each field
//! accepts `*`, a number, a range `a-b`, a step `*/n` or `a-b/n`, and comma
//! separated lists of these. Day-of-week is `0-7` with both `0` and `7`
//! meaning Sunday. As in classic cron, when both day fields are restricted a
//! time matches if either of them does. A day field starting with `*`
//! (such as `*/2`) counts as unrestricted for that rule.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

use crate::error::{BackupError, Result};

/// Upper bound for [`Schedule::next_after`]; every valid expression fires
/// at least once within this many minutes (leap day included).
const SEARCH_MINUTES: i64 = 60 * 24 * 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    source: String,
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
    days_restricted: bool,
    weekdays_restricted: bool,
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(BackupError::InvalidConfig(format!(
                "cron expression '{expr}' must have 5 fields, found {}",
                fields.len()
            )));
        }

        let mut weekdays = parse_field(fields[4], 0, 7, "day-of-week")?;
        if weekdays & (1 << 7) != 0 {
            weekdays = (weekdays | 1) & !(1 << 7);
        }
        Ok(Self {
            source: fields.join(" "),
            minutes: parse_field(fields[0], 0, 59, "minute")?,
            hours: parse_field(fields[1], 0, 23, "hour")?,
            days: parse_field(fields[2], 1, 31, "day-of-month")?,
            months: parse_field(fields[3], 1, 12, "month")?,
            weekdays,
            days_restricted: !fields[2].starts_with('*'),
            weekdays_restricted: !fields[4].starts_with('*'),
        })
    }

    /// Whether the schedule fires in the minute containing `at`.
    pub fn is_due(&self, at: DateTime<Utc>) -> bool {
        let day_ok = bit(self.days, at.day());
        let weekday_ok = bit(self.weekdays, at.weekday().num_days_from_sunday());
        let day_match = match (self.days_restricted, self.weekdays_restricted) {
            (true, true) => day_ok || weekday_ok,
            _ => day_ok && weekday_ok,
        };
        bit(self.minutes, at.minute())
            && bit(self.hours, at.hour())
            && bit(self.months, at.month())
            && day_match
    }

    /// First firing minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut at = truncate_to_minute(after) + Duration::minutes(1);
        for _ in 0..SEARCH_MINUTES {
            if !bit(self.months, at.month()) {
                at = start_of_next_month(at)?;
                continue;
            }
            if self.is_due(at) {
                return Some(at);
            }
            at += Duration::minutes(1);
        }
        None
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl FromStr for Schedule {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        Schedule::parse(s)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// `at` with seconds and sub-seconds cleared.
pub fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

fn start_of_next_month(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if at.month() == 12 {
        (at.year() + 1, 1)
    } else {
        (at.year(), at.month() + 1)
    };
    chrono::NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}

fn bit(mask: u64, value: u32) -> bool {
    value < 64 && mask & (1u64 << value) != 0
}

fn parse_field(field: &str, min: u32, max: u32, name: &str) -> Result<u64> {
    let invalid = |why: &str| {
        BackupError::InvalidConfig(format!("cron {name} field '{field}': {why}"))
    };
    let number = |s: &str| -> Result<u32> {
        let n: u32 = s.parse().map_err(|_| invalid("not a number"))?;
        if n < min || n > max {
            return Err(invalid(&format!("{n} outside {min}-{max}")));
        }
        Ok(n)
    };

    let mut mask = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid("bad step"))?;
                if step == 0 {
                    return Err(invalid("step must be positive"));
                }
                (range, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (number(a)?, number(b)?);
            if a > b {
                return Err(invalid("range start after end"));
            }
            (a, b)
        } else {
            let n = number(range)?;
            // `5/15` means 5, 20, 35, 50
            if step > 1 { (n, max) } else { (n, n) }
        };
        for value in (lo..=hi).step_by(step as usize) {
            mask |= 1u64 << value;
        }
    }
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().expect("valid time")
    }

    #[test]
    fn daily_two_am() {
        let s = Schedule::parse("0 2 * * *").expect("parse");
        assert!(s.is_due(at(2024, 5, 1, 2, 0)));
        assert!(!s.is_due(at(2024, 5, 1, 2, 1)));
        assert_eq!(s.next_after(at(2024, 5, 1, 2, 0)), Some(at(2024, 5, 2, 2, 0)));
    }

    #[test]
    fn steps_ranges_and_lists() {
        let s = Schedule::parse("*/15 8-18/2 * * 1-5").expect("parse");
        // 2024-05-06 is a Monday.
        assert!(s.is_due(at(2024, 5, 6, 10, 45)));
        assert!(!s.is_due(at(2024, 5, 6, 11, 45)));
        assert!(!s.is_due(at(2024, 5, 5, 10, 45)));

        let s = Schedule::parse("5,35 0 1,15 * *").expect("parse");
        assert!(s.is_due(at(2024, 5, 15, 0, 35)));
        assert!(!s.is_due(at(2024, 5, 16, 0, 35)));
    }

    #[test]
    fn sunday_is_zero_or_seven() {
        let zero = Schedule::parse("0 0 * * 0").expect("parse");
        let seven = Schedule::parse("0 0 * * 7").expect("parse");
        // 2024-05-05 is a Sunday.
        assert!(zero.is_due(at(2024, 5, 5, 0, 0)));
        assert!(seven.is_due(at(2024, 5, 5, 0, 0)));
        assert_eq!(zero, Schedule { source: zero.source.clone(), ..seven });
    }

    #[test]
    fn restricted_day_fields_match_either() {
        let s = Schedule::parse("0 0 1 * 1").expect("parse");
        assert!(s.is_due(at(2024, 5, 1, 0, 0)));
        assert!(s.is_due(at(2024, 5, 6, 0, 0)));
        assert!(!s.is_due(at(2024, 5, 7, 0, 0)));
    }

    #[test]
    fn starred_step_day_field_still_requires_both() {
        let s = Schedule::parse("0 0 */2 * 1").expect("parse");
        // Monday the 13th matches both fields.
        assert!(s.is_due(at(2024, 5, 13, 0, 0)));
        // Monday the 6th and Wednesday the 1st match only one.
        assert!(!s.is_due(at(2024, 5, 6, 0, 0)));
        assert!(!s.is_due(at(2024, 5, 1, 0, 0)));
    }

    #[test]
    fn next_after_skips_months() {
        let s = Schedule::parse("30 4 29 2 *").expect("parse");
        assert_eq!(s.next_after(at(2024, 3, 1, 0, 0)), Some(at(2028, 2, 29, 4, 30)));
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        for expr in ["", "* * * *", "60 * * * *", "* 24 * * *", "*/0 * * * *", "5-1 * * * *", "a * * * *"] {
            let err = Schedule::parse(expr).expect_err(expr);
            assert_eq!(err.kind(), crate::error::ErrorKind::InvalidConfig);
        }
    }
}
