//! Billing-cycle arithmetic anchored at a subscription's `created_at`.
//!
//! Periods are laid out as `created_at + k * natural_period` for integer
//! `k`, using calendar-aware steps for months and years. Because month
//! arithmetic clamps to the end of shorter months, boundaries are always
//! computed from the anchor instead of by repeatedly adding one period.

use chrono::{DateTime, Datelike, Duration, Months, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl PeriodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodType::Hourly => "hourly",
            PeriodType::Daily => "daily",
            PeriodType::Weekly => "weekly",
            PeriodType::Monthly => "monthly",
            PeriodType::Yearly => "yearly",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hourly" | "hour" => Some(PeriodType::Hourly),
            "daily" | "day" => Some(PeriodType::Daily),
            "weekly" | "week" => Some(PeriodType::Weekly),
            "monthly" | "month" => Some(PeriodType::Monthly),
            "yearly" | "year" | "annual" => Some(PeriodType::Yearly),
            _ => None,
        }
    }

    pub fn noun(&self) -> &'static str {
        match self {
            PeriodType::Hourly => "hour",
            PeriodType::Daily => "day",
            PeriodType::Weekly => "week",
            PeriodType::Monthly => "month",
            PeriodType::Yearly => "year",
        }
    }
}

/// key: period-calculator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeriodCalculator {
    pub period_type: PeriodType,
    pub period_length: i32,
}

impl PeriodCalculator {
    pub fn new(period_type: PeriodType, period_length: i32) -> Self {
        Self {
            period_type,
            period_length: period_length.max(1),
        }
    }

    /// `start` moved forward (or backward for negative counts) by
    /// `nb_periods` natural periods.
    pub fn end_of_period(&self, start: DateTime<Utc>, nb_periods: i64) -> DateTime<Utc> {
        let steps = nb_periods * i64::from(self.period_length);
        match self.period_type {
            PeriodType::Hourly => start + Duration::hours(steps),
            PeriodType::Daily => start + Duration::days(steps),
            PeriodType::Weekly => start + Duration::weeks(steps),
            PeriodType::Monthly => shift_months(start, steps),
            PeriodType::Yearly => shift_months(start, steps * 12),
        }
    }

    /// Index `k` of the period `[anchor + k, anchor + k + 1)` holding `at_time`.
    pub fn period_index(&self, anchor: DateTime<Utc>, at_time: DateTime<Utc>) -> i64 {
        let length = i64::from(self.period_length);
        let estimate = match self.period_type {
            PeriodType::Hourly => (at_time - anchor).num_hours().div_euclid(length),
            PeriodType::Daily => (at_time - anchor).num_days().div_euclid(length),
            PeriodType::Weekly => (at_time - anchor).num_weeks().div_euclid(length),
            PeriodType::Monthly => month_delta(anchor, at_time).div_euclid(length),
            PeriodType::Yearly => {
                i64::from(at_time.year() - anchor.year()).div_euclid(length)
            }
        };

        // Integer estimates can be off by one around month ends and DST-free
        // truncation; walk until the window contains `at_time`.
        let mut index = estimate;
        loop {
            let lower = self.end_of_period(anchor, index);
            let upper = self.end_of_period(anchor, index + 1);
            if at_time < lower {
                index -= 1;
            } else if at_time >= upper {
                index += 1;
            } else {
                return index;
            }
        }
    }

    /// Half-open interval `[lower, upper)` of the period containing `at_time`.
    pub fn period_for(
        &self,
        anchor: DateTime<Utc>,
        at_time: DateTime<Utc>,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        let index = self.period_index(anchor, at_time);
        (
            self.end_of_period(anchor, index),
            self.end_of_period(anchor, index + 1),
        )
    }

    /// Fractional number of periods between `start` and `until`.
    ///
    /// Partial periods at both ends are measured with a period-type specific
    /// ratio; the fully contained periods in between are counted from the
    /// boundary indices rather than by dividing durations.
    pub fn nb_periods(
        &self,
        anchor: DateTime<Utc>,
        start: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> f64 {
        if until <= start {
            return 0.0;
        }
        let start_index = self.period_index(anchor, start);
        let until_index = self.period_index(anchor, until);
        let start_upper = self.end_of_period(anchor, start_index + 1);
        if start_index == until_index {
            let lower = self.end_of_period(anchor, start_index);
            return self.partial(start, until, lower, start_upper);
        }

        let start_lower = self.end_of_period(anchor, start_index);
        let until_lower = self.end_of_period(anchor, until_index);
        let until_upper = self.end_of_period(anchor, until_index + 1);
        let head = self.partial(start, start_upper, start_lower, start_upper);
        let whole = (until_index - start_index - 1) as f64;
        let tail = self.partial(until_lower, until, until_lower, until_upper);
        head + whole + tail
    }

    fn partial(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        lower: DateTime<Utc>,
        upper: DateTime<Utc>,
    ) -> f64 {
        let length = f64::from(self.period_length);
        let elapsed = seconds_between(from, to);
        match self.period_type {
            PeriodType::Hourly => elapsed / 3600.0 / length,
            PeriodType::Daily => elapsed / 3600.0 / 24.0 / length,
            PeriodType::Weekly => elapsed / 86400.0 / 7.0 / length,
            PeriodType::Monthly => {
                let span = seconds_between(lower, upper);
                if span <= 0.0 {
                    0.0
                } else {
                    elapsed / span
                }
            }
            PeriodType::Yearly => fractional_months(from, to) / 12.0 / length,
        }
    }

    /// `"3 months"`, `"1 year"`.
    pub fn describe(&self, nb_periods: i64) -> String {
        let count = nb_periods * i64::from(self.period_length);
        let noun = self.period_type.noun();
        if count == 1 {
            format!("{count} {noun}")
        } else {
            format!("{count} {noun}s")
        }
    }
}

fn shift_months(at: DateTime<Utc>, months: i64) -> DateTime<Utc> {
    let magnitude = Months::new(months.unsigned_abs().min(u64::from(u32::MAX)) as u32);
    let shifted = if months >= 0 {
        at.checked_add_months(magnitude)
    } else {
        at.checked_sub_months(magnitude)
    };
    shifted.unwrap_or(at)
}

fn month_delta(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    i64::from(to.year() - from.year()) * 12 + i64::from(to.month()) - i64::from(from.month())
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

fn fractional_months(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let mut whole = month_delta(from, to).max(0);
    while whole > 0 && shift_months(from, whole) > to {
        whole -= 1;
    }
    let lower = shift_months(from, whole);
    let upper = shift_months(from, whole + 1);
    let span = seconds_between(lower, upper);
    let rest = if span > 0.0 {
        seconds_between(lower, to) / span
    } else {
        0.0
    };
    whole as f64 + rest
}

static PERIOD_NUMBER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\((\d+)\s+(hour|day|week|month|year)s?\)").expect("invalid regex")
});

/// Recovers the `(count, unit)` suffix written by order descriptions, e.g.
/// `"... (3 months)"`. Only used for postings recorded without the
/// structured `nb_periods` column.
pub fn period_number(descr: &str) -> Option<(i64, PeriodType)> {
    let captures = PERIOD_NUMBER_RE.captures_iter(descr).last()?;
    let count = captures.get(1)?.as_str().parse::<i64>().ok()?;
    let period_type = PeriodType::from_str(captures.get(2)?.as_str())?;
    Some((count, period_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).single().unwrap()
    }

    #[test]
    fn end_of_period_is_calendar_aware() {
        let monthly = PeriodCalculator::new(PeriodType::Monthly, 1);
        assert_eq!(monthly.end_of_period(at(2014, 1, 31, 0), 1), at(2014, 2, 28, 0));
        assert_eq!(monthly.end_of_period(at(2014, 1, 31, 0), 2), at(2014, 3, 31, 0));
        let yearly = PeriodCalculator::new(PeriodType::Yearly, 1);
        assert_eq!(yearly.end_of_period(at(2016, 2, 29, 0), 1), at(2017, 2, 28, 0));
        let weekly = PeriodCalculator::new(PeriodType::Weekly, 2);
        assert_eq!(weekly.end_of_period(at(2014, 9, 10, 0), 1), at(2014, 9, 24, 0));
    }

    #[test]
    fn monthly_period_for_walks_from_anchor() {
        let monthly = PeriodCalculator::new(PeriodType::Monthly, 1);
        let created_at = at(2014, 9, 10, 0);
        let probe = monthly.end_of_period(created_at, 3);
        assert_eq!(
            monthly.period_for(created_at, probe),
            (at(2014, 12, 10, 0), at(2015, 1, 10, 0))
        );
        // One second before the boundary still belongs to the previous period.
        assert_eq!(
            monthly.period_for(created_at, probe - Duration::seconds(1)),
            (at(2014, 11, 10, 0), at(2014, 12, 10, 0))
        );
    }

    #[test]
    fn period_for_handles_month_end_anchor() {
        let monthly = PeriodCalculator::new(PeriodType::Monthly, 1);
        let created_at = at(2015, 1, 31, 12);
        assert_eq!(
            monthly.period_for(created_at, at(2015, 3, 1, 0)),
            (at(2015, 2, 28, 12), at(2015, 3, 31, 12))
        );
        assert_eq!(
            monthly.period_for(created_at, at(2015, 2, 28, 11)),
            (at(2015, 1, 31, 12), at(2015, 2, 28, 12))
        );
    }

    #[test]
    fn period_for_before_anchor_is_negative_index() {
        let daily = PeriodCalculator::new(PeriodType::Daily, 1);
        let created_at = at(2014, 9, 10, 6);
        assert_eq!(daily.period_index(created_at, at(2014, 9, 9, 12)), -1);
    }

    #[test]
    fn nb_periods_fractional_for_uniform_periods() {
        let daily = PeriodCalculator::new(PeriodType::Daily, 1);
        let created_at = at(2014, 9, 10, 0);
        let until = created_at + Duration::hours(36);
        assert!((daily.nb_periods(created_at, created_at, until) - 1.5).abs() < 1e-9);

        let hourly = PeriodCalculator::new(PeriodType::Hourly, 1);
        let until = created_at + Duration::minutes(90);
        assert!((hourly.nb_periods(created_at, created_at, until) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn nb_periods_counts_whole_months_by_boundaries() {
        let monthly = PeriodCalculator::new(PeriodType::Monthly, 1);
        let created_at = at(2014, 1, 31, 0);
        let until = monthly.end_of_period(created_at, 5);
        assert!((monthly.nb_periods(created_at, created_at, until) - 5.0).abs() < 1e-9);
        // Half of February 2015 (28 days) measured against the actual period span.
        let created_at = at(2015, 1, 15, 0);
        let until = at(2015, 2, 15, 0) + Duration::days(14);
        assert!((monthly.nb_periods(created_at, created_at, until) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn nb_periods_yearly_uses_months() {
        let yearly = PeriodCalculator::new(PeriodType::Yearly, 1);
        let created_at = at(2014, 1, 1, 0);
        let until = at(2015, 7, 1, 0);
        assert!((yearly.nb_periods(created_at, created_at, until) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn nb_periods_partial_start_and_end() {
        let weekly = PeriodCalculator::new(PeriodType::Weekly, 1);
        let created_at = at(2014, 9, 1, 0);
        let start = created_at + Duration::days(3) + Duration::hours(12);
        let until = created_at + Duration::weeks(3) + Duration::days(7) / 2;
        let expected = 0.5 + 2.0 + 0.5;
        assert!((weekly.nb_periods(created_at, start, until) - expected).abs() < 1e-9);
        assert_eq!(weekly.nb_periods(created_at, until, start), 0.0);
    }

    #[test]
    fn describes_and_parses_period_counts() {
        let monthly = PeriodCalculator::new(PeriodType::Monthly, 1);
        assert_eq!(monthly.describe(1), "1 month");
        assert_eq!(monthly.describe(3), "3 months");
        assert_eq!(
            period_number("subscription to Open Space until 2014/12/10 (3 months)"),
            Some((3, PeriodType::Monthly))
        );
        assert_eq!(period_number("Pro-rated adjustment"), None);
    }
}
