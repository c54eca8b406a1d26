//! Billing period boundary arithmetic.
//!
//! Periods are derived from the subscription's billing-cycle anchor: the
//! anchor's day-of-month is kept when the target month allows it and clamped
//! to the month's last day otherwise, so a day-31 anchor yields Feb 28/29,
//! Mar 31, Apr 30 and so on without drifting.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;

use super::error::{BillingError, BillingResult};
use super::models::IntervalUnit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeriodBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// key: interval-calculator -> next period boundaries
pub fn compute_next_period(
    anchor: DateTime<Utc>,
    unit: IntervalUnit,
    interval_count: i32,
    last_period_end: Option<DateTime<Utc>>,
) -> BillingResult<PeriodBounds> {
    if interval_count <= 0 {
        return Err(BillingError::InvalidInterval {
            count: interval_count,
        });
    }

    let start = last_period_end.unwrap_or(anchor);
    let end = match unit {
        IntervalUnit::Month => shift_months(
            start,
            interval_count,
            interval_count,
            anchor.day(),
            anchor.time(),
        )?,
        IntervalUnit::Year => shift_months(
            start,
            interval_count * 12,
            interval_count,
            anchor.day(),
            start.time(),
        )?,
        IntervalUnit::Day | IntervalUnit::Week => {
            return Err(BillingError::UnsupportedInterval(unit.as_str().to_string()))
        }
    };

    if let Some(previous_end) = last_period_end {
        if start < previous_end {
            return Err(BillingError::NonContiguousPeriod {
                start,
                previous_end,
            });
        }
    }
    if end <= start {
        return Err(BillingError::ZeroOrNegativeDuration { start, end });
    }

    Ok(PeriodBounds { start, end })
}

/// Parses a stored or user supplied interval unit.
pub fn parse_interval_unit(value: &str) -> BillingResult<IntervalUnit> {
    value
        .trim()
        .to_ascii_lowercase()
        .parse::<IntervalUnit>()
        .map_err(|_| BillingError::UnsupportedInterval(value.to_string()))
}

fn shift_months(
    start: DateTime<Utc>,
    months: i32,
    interval_count: i32,
    anchor_day: u32,
    time: NaiveTime,
) -> BillingResult<DateTime<Utc>> {
    let overflow = || BillingError::InvalidInterval {
        count: interval_count,
    };

    let total = start
        .year()
        .checked_mul(12)
        .and_then(|value| value.checked_add(start.month0() as i32))
        .and_then(|value| value.checked_add(months))
        .ok_or_else(overflow)?;
    let year = total.div_euclid(12);
    let month = total.rem_euclid(12) as u32 + 1;
    let day = anchor_day.min(days_in_month(year, month).ok_or_else(overflow)?);

    let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(overflow)?;
    Ok(Utc.from_utc_datetime(&date.and_time(time)))
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 {
        (year.checked_add(1)?, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?
        .pred_opt()
        .map(|last| last.day())
}
