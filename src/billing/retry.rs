use chrono::{DateTime, Duration, Utc};
use sqlx::PgConnection;
use tracing::info;

use crate::db::billing_runs::{self, NewBillingRun};

use super::error::BillingResult;
use super::models::BillingRun;

/// Backoff in days between collection attempts for one billing period. The
/// initial attempt plus one retry per entry are allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    days: Vec<u32>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::new(vec![3, 5, 5])
    }
}

impl RetrySchedule {
    pub fn new(days: Vec<u32>) -> Self {
        Self { days }
    }

    pub fn days(&self) -> &[u32] {
        &self.days
    }

    pub fn max_attempts(&self) -> usize {
        self.days.len() + 1
    }

    /// When the next attempt should run given how many runs the period
    /// already has, or `None` once the schedule is exhausted.
    pub fn next_retry_at(&self, attempts: usize, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if attempts == 0 || attempts >= self.max_attempts() {
            return None;
        }
        let days = self.days[attempts - 1];
        Some(now + Duration::days(i64::from(days)))
    }
}

/// key: retry-scheduler -> follow-up run after a failed attempt
pub async fn schedule_retry(
    conn: &mut PgConnection,
    failed_run: &BillingRun,
    now: DateTime<Utc>,
    schedule: &RetrySchedule,
) -> BillingResult<Option<BillingRun>> {
    let runs = billing_runs::list_for_period(&mut *conn, failed_run.billing_period_id).await?;
    let Some(scheduled_for) = schedule.next_retry_at(runs.len(), now) else {
        info!(
            billing_run_id = %failed_run.id,
            billing_period_id = %failed_run.billing_period_id,
            attempts = runs.len(),
            "retry schedule exhausted"
        );
        return Ok(None);
    };

    let retry = billing_runs::insert(
        &mut *conn,
        &NewBillingRun {
            billing_period_id: failed_run.billing_period_id,
            subscription_id: failed_run.subscription_id,
            scheduled_for,
            payment_method_id: failed_run.payment_method_id,
            gateway_payment_intent_id: failed_run.gateway_payment_intent_id.as_deref(),
            last_gateway_event_at: failed_run.last_gateway_event_at,
        },
    )
    .await?;

    info!(
        billing_run_id = %retry.id,
        failed_run_id = %failed_run.id,
        %scheduled_for,
        attempt = runs.len() + 1,
        "scheduled billing run retry"
    );
    Ok(Some(retry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn retries_follow_the_backoff_schedule() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let schedule = RetrySchedule::default();

        assert_eq!(schedule.next_retry_at(1, now), Some(now + Duration::days(3)));
        assert_eq!(schedule.next_retry_at(2, now), Some(now + Duration::days(5)));
        assert_eq!(schedule.next_retry_at(3, now), Some(now + Duration::days(5)));
    }

    #[test]
    fn exhausted_schedule_yields_nothing() {
        let now = Utc::now();
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.max_attempts(), 4);
        for attempts in 4..8 {
            assert_eq!(schedule.next_retry_at(attempts, now), None);
        }

        let empty = RetrySchedule::new(Vec::new());
        assert_eq!(empty.next_retry_at(1, now), None);
    }
}
