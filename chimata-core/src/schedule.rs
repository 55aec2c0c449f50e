//! Period expressions: 5-field cron and `@` descriptors.
//!
//! | Expression          | Meaning                                   |
//! |---------------------|-------------------------------------------|
//! | `*/30 * * * *`      | standard cron, local time                 |
//! | `@hourly` … `@yearly` | shorthand for the matching cron line    |
//! | `@every 1h30m`      | fixed interval from the previous fire     |
//!
//! Day-of-month and day-of-week are OR-ed when both are restricted and
//! AND-ed when either is `*`, matching the classic cron rule.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike};

use crate::error::ScheduleError;

/// How far ahead `next_after` searches before giving up (e.g. `0 0 30 2 *`).
const SEARCH_YEARS: i32 = 5;

/// A parsed, schedulable period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fire every fixed interval (whole seconds, at least one).
    Every(Duration),
    Cron(CronSpec),
}

/// Bitsets of the allowed values of each cron field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    minute: u64,
    hour: u64,
    dom: u64,
    month: u64,
    dow: u64,
    dom_star: bool,
    dow_star: bool,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [(&'static str, u32)],
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[] };
const DOM: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        ("jan", 1), ("feb", 2), ("mar", 3), ("apr", 4), ("may", 5), ("jun", 6),
        ("jul", 7), ("aug", 8), ("sep", 9), ("oct", 10), ("nov", 11), ("dec", 12),
    ],
};
// 7 is accepted as an alias for Sunday and folded onto bit 0 after parsing.
const DOW: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &[
        ("sun", 0), ("mon", 1), ("tue", 2), ("wed", 3), ("thu", 4), ("fri", 5), ("sat", 6),
    ],
};

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(ScheduleError::Empty);
        }

        if let Some(descriptor) = expr.strip_prefix('@') {
            return parse_descriptor(descriptor);
        }

        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::FieldCount { found: fields.len() });
        }

        let (minute, _) = parse_field(fields[0], &MINUTE)?;
        let (hour, _) = parse_field(fields[1], &HOUR)?;
        let (dom, dom_star) = parse_field(fields[2], &DOM)?;
        let (month, _) = parse_field(fields[3], &MONTH)?;
        let (mut dow, dow_star) = parse_field(fields[4], &DOW)?;
        if dow & (1 << 7) != 0 {
            dow = (dow & !(1 << 7)) | 1;
        }

        Ok(Schedule::Cron(CronSpec {
            minute,
            hour,
            dom,
            month,
            dow,
            dom_star,
            dow_star,
        }))
    }

    /// Next fire time strictly after `after`, or `None` when nothing matches
    /// within the search horizon.
    pub fn next_after(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        match self {
            Schedule::Every(interval) => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                after.checked_add_signed(step)
            }
            Schedule::Cron(spec) => spec.next_after(after),
        }
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Schedule::parse(s)
    }
}

impl CronSpec {
    fn next_after(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        let start = after.naive_local().with_second(0)?.with_nanosecond(0)?;
        let mut t = start + chrono::Duration::minutes(1);
        let limit = start.year() + SEARCH_YEARS;

        loop {
            if t.year() > limit {
                return None;
            }
            if !bit(self.month, t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !bit(self.hour, t.hour()) {
                t = t.with_minute(0)? + chrono::Duration::hours(1);
                continue;
            }
            if !bit(self.minute, t.minute()) {
                t += chrono::Duration::minutes(1);
                continue;
            }

            // Skip wall-clock times that fall in a DST gap.
            let candidate = match Local.from_local_datetime(&t) {
                LocalResult::Single(dt) => Some(dt),
                LocalResult::Ambiguous(earliest, _) => Some(earliest),
                LocalResult::None => None,
            };
            match candidate {
                Some(dt) if dt > after => return Some(dt),
                _ => t += chrono::Duration::minutes(1),
            }
        }
    }

    fn day_matches(&self, t: NaiveDateTime) -> bool {
        let dom_match = bit(self.dom, t.day());
        let dow_match = bit(self.dow, t.weekday().num_days_from_sunday());
        if self.dom_star || self.dow_star {
            dom_match && dow_match
        } else {
            dom_match || dow_match
        }
    }
}

fn bit(set: u64, value: u32) -> bool {
    set & (1 << value) != 0
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn parse_descriptor(descriptor: &str) -> Result<Schedule, ScheduleError> {
    let line = match descriptor {
        "yearly" | "annually" => "0 0 1 1 *",
        "monthly" => "0 0 1 * *",
        "weekly" => "0 0 * * 0",
        "daily" | "midnight" => "0 0 * * *",
        "hourly" => "0 * * * *",
        other => {
            if let Some(rest) = other.strip_prefix("every") {
                return parse_duration(rest.trim()).map(Schedule::Every);
            }
            return Err(ScheduleError::UnknownDescriptor(format!("@{other}")));
        }
    };
    Schedule::parse(line)
}

/// Parse `1h30m`, `45s`, `1500ms`. Truncated to whole seconds, minimum one.
pub fn parse_duration(value: &str) -> Result<Duration, ScheduleError> {
    let err = |reason: &str| ScheduleError::Duration {
        value: value.to_string(),
        reason: reason.to_string(),
    };
    if value.is_empty() {
        return Err(err("missing duration"));
    }

    let mut total_ms: u64 = 0;
    let mut rest = value;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(err("expected a number"));
        }
        let amount: u64 = rest[..digits].parse().map_err(|_| err("number out of range"))?;
        rest = &rest[digits..];

        let unit_len = rest.chars().take_while(|c| c.is_ascii_alphabetic()).count();
        let unit_ms = match &rest[..unit_len] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "" => return Err(err("missing unit")),
            _ => return Err(err("unknown unit (expected ms, s, m or h)")),
        };
        rest = &rest[unit_len..];

        total_ms = amount
            .checked_mul(unit_ms)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| err("duration overflows"))?;
    }

    let secs = (total_ms / 1_000).max(1);
    Ok(Duration::from_secs(secs))
}

fn parse_field(expr: &str, spec: &FieldSpec) -> Result<(u64, bool), ScheduleError> {
    let mut bits = 0u64;
    let mut star = false;
    for part in expr.split(',') {
        let (part_bits, part_star) = parse_range(part, spec).map_err(|reason| ScheduleError::Field {
            field: spec.name,
            value: expr.to_string(),
            reason,
        })?;
        bits |= part_bits;
        star |= part_star;
    }
    Ok((bits, star))
}

fn parse_range(part: &str, spec: &FieldSpec) -> Result<(u64, bool), String> {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step
                .parse()
                .map_err(|_| format!("invalid step '{step}'"))?;
            if step == 0 {
                return Err("step must be at least 1".to_string());
            }
            (range, Some(step))
        }
        None => (part, None),
    };

    let (start, end, is_star) = if range == "*" || range == "?" {
        (spec.min, spec.max, true)
    } else if let Some((lo, hi)) = range.split_once('-') {
        (parse_value(lo, spec)?, parse_value(hi, spec)?, false)
    } else {
        let value = parse_value(range, spec)?;
        // `5/15` runs from 5 to the field maximum.
        let end = if step.is_some() { spec.max } else { value };
        (value, end, false)
    };

    if start > end {
        return Err(format!("range start {start} is after end {end}"));
    }

    let step = step.unwrap_or(1);
    let mut bits = 0u64;
    let mut value = start;
    while value <= end {
        bits |= 1 << value;
        value += step;
    }
    Ok((bits, is_star && step == 1))
}

fn parse_value(token: &str, spec: &FieldSpec) -> Result<u32, String> {
    let lower = token.to_ascii_lowercase();
    if let Some((_, value)) = spec.names.iter().find(|(name, _)| *name == lower) {
        return Ok(*value);
    }
    let value: u32 = token
        .parse()
        .map_err(|_| format!("'{token}' is not a number"))?;
    if value < spec.min || value > spec.max {
        return Err(format!(
            "{value} is outside {}-{}",
            spec.min, spec.max
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .expect("unambiguous local time")
    }

    #[test]
    fn every_adds_interval() {
        let schedule = Schedule::parse("@every 90s").unwrap();
        assert_eq!(schedule, Schedule::Every(Duration::from_secs(90)));
        let start = local(2024, 1, 10, 12, 0);
        assert_eq!(
            schedule.next_after(start),
            Some(start + chrono::Duration::seconds(90))
        );
    }

    #[test]
    fn step_minutes_fire_on_boundaries() {
        let schedule = Schedule::parse("*/15 * * * *").unwrap();
        let next = schedule.next_after(local(2024, 1, 10, 12, 7)).unwrap();
        assert_eq!(next, local(2024, 1, 10, 12, 15));
        let after_boundary = schedule.next_after(local(2024, 1, 10, 12, 15)).unwrap();
        assert_eq!(after_boundary, local(2024, 1, 10, 12, 30));
    }

    #[test]
    fn daily_rolls_over_month_and_year() {
        let schedule = Schedule::parse("@daily").unwrap();
        let next = schedule.next_after(local(2024, 12, 31, 8, 0)).unwrap();
        assert_eq!(next, local(2025, 1, 1, 0, 0));
    }

    #[test]
    fn restricted_dom_and_dow_are_ored() {
        // 2024-01-10 is a Wednesday; the 15th comes after Friday the 12th.
        let schedule = Schedule::parse("0 3 15 * FRI").unwrap();
        let next = schedule.next_after(local(2024, 1, 10, 12, 0)).unwrap();
        assert_eq!(next, local(2024, 1, 12, 3, 0));
    }

    #[test]
    fn sunday_as_seven() {
        let schedule = Schedule::parse("0 0 * * 7").unwrap();
        // 2024-01-14 is a Sunday.
        let next = schedule.next_after(local(2024, 1, 10, 0, 0)).unwrap();
        assert_eq!(next, local(2024, 1, 14, 0, 0));
    }

    #[test]
    fn impossible_date_gives_none() {
        let schedule = Schedule::parse("0 0 30 2 *").unwrap();
        assert_eq!(schedule.next_after(local(2024, 1, 1, 0, 0)), None);
    }

    #[test]
    fn sub_second_interval_rounds_up() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
    }
}
