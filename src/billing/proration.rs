use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::{BillingError, BillingResult};
use super::interval::PeriodBounds;

/// Time-weighted split of a billing period around an adjustment date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProrationSplit {
    pub before_ms: i64,
    pub after_ms: i64,
    pub before_pct: f64,
    pub after_pct: f64,
}

/// key: proration-engine -> split period around adjustment
///
/// Zero-length periods are a caller error and never produce a split.
pub fn split_around_date(
    adjustment_date: DateTime<Utc>,
    period: PeriodBounds,
) -> BillingResult<ProrationSplit> {
    if period.end <= period.start {
        return Err(BillingError::ZeroOrNegativeDuration {
            start: period.start,
            end: period.end,
        });
    }
    if adjustment_date < period.start || adjustment_date > period.end {
        return Err(BillingError::AdjustmentOutOfRange {
            date: adjustment_date,
            start: period.start,
            end: period.end,
        });
    }

    let total_ms = (period.end - period.start).num_milliseconds();
    let before_ms = (adjustment_date - period.start).num_milliseconds();
    let after_ms = total_ms - before_ms;
    let before_pct = before_ms as f64 / total_ms as f64;

    Ok(ProrationSplit {
        before_ms,
        after_ms,
        before_pct,
        after_pct: 1.0 - before_pct,
    })
}

/// Share of `unit_price` owed for `pct` of a period, in whole minor units.
/// Rounds half away from zero so credits and charges mirror each other.
pub fn prorated_unit_amount(unit_price: i64, pct: f64) -> i64 {
    (unit_price as f64 * pct).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn period() -> PeriodBounds {
        let start = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        PeriodBounds {
            start,
            end: start + Duration::days(30),
        }
    }

    #[test]
    fn split_at_boundaries_and_midpoint() {
        let bounds = period();

        let at_start = split_around_date(bounds.start, bounds).unwrap();
        assert_eq!(at_start.before_pct, 0.0);
        assert_eq!(at_start.after_pct, 1.0);

        let at_end = split_around_date(bounds.end, bounds).unwrap();
        assert_eq!(at_end.before_pct, 1.0);
        assert_eq!(at_end.after_pct, 0.0);
        assert_eq!(at_end.after_ms, 0);

        let midpoint = split_around_date(bounds.start + Duration::days(15), bounds).unwrap();
        assert!((midpoint.before_pct - 0.5).abs() < 1e-9);
        assert!((midpoint.after_pct - 0.5).abs() < 1e-9);
        assert_eq!(midpoint.before_ms, midpoint.after_ms);
    }

    #[test]
    fn dates_outside_the_period_are_rejected() {
        let bounds = period();
        for date in [
            bounds.start - Duration::milliseconds(1),
            bounds.end + Duration::milliseconds(1),
            bounds.end + Duration::days(90),
        ] {
            let err = split_around_date(date, bounds).expect_err("out of range");
            assert!(matches!(err, BillingError::AdjustmentOutOfRange { .. }));
        }
    }

    #[test]
    fn zero_length_period_is_an_error() {
        let start = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        let err = split_around_date(start, PeriodBounds { start, end: start })
            .expect_err("zero duration");
        assert!(matches!(err, BillingError::ZeroOrNegativeDuration { .. }));
    }

    #[test]
    fn prorated_amounts_round_half_away_from_zero() {
        assert_eq!(prorated_unit_amount(200, 0.5), 100);
        assert_eq!(prorated_unit_amount(5, 0.5), 3);
        assert_eq!(prorated_unit_amount(-5, 0.5), -3);
        assert_eq!(-prorated_unit_amount(5, 0.5), -3);
        assert_eq!(prorated_unit_amount(999, 1.0 / 3.0), 333);
        assert_eq!(prorated_unit_amount(1000, 0.0), 0);
    }
}
