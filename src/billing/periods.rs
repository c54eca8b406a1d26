//! Billing period lifecycle: opening, closing and rolling a subscription onto
//! its next period.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgConnection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{
    billing_period_items, billing_periods,
    billing_runs::{self, NewBillingRun},
    payments, subscription_items, subscriptions,
};

use super::error::{BillingError, BillingResult};
use super::interval::{compute_next_period, PeriodBounds};
use super::models::{
    BillingPeriod, BillingPeriodStatus, BillingRun, NewBillingPeriodItem, Subscription,
    SubscriptionStatus,
};

/// Amount owed for a period against what has been collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeriodTotals {
    pub due: i64,
    pub settled: i64,
}

impl PeriodTotals {
    pub fn remaining(&self) -> i64 {
        self.due - self.settled
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PeriodTransition {
    pub subscription: Subscription,
    pub closed_period: BillingPeriod,
    pub next_period: Option<BillingPeriod>,
    pub billing_run: Option<BillingRun>,
}

pub async fn period_totals(conn: &mut PgConnection, period_id: Uuid) -> BillingResult<PeriodTotals> {
    let due = billing_period_items::total_for_period(&mut *conn, period_id).await?;
    let settled = payments::settled_for_period(&mut *conn, period_id).await?;
    Ok(PeriodTotals { due, settled })
}

/// Status a period should settle into at `now`. `payment_failed` reflects
/// whether the latest collection attempt failed outright.
pub fn settled_status(
    period: &BillingPeriod,
    totals: PeriodTotals,
    now: DateTime<Utc>,
    payment_failed: bool,
) -> BillingPeriodStatus {
    if period.status.is_terminal() {
        return period.status;
    }
    if totals.remaining() <= 0 {
        if period.has_ended(now) {
            BillingPeriodStatus::Completed
        } else if period.status == BillingPeriodStatus::PastDue {
            BillingPeriodStatus::Active
        } else {
            period.status
        }
    } else if payment_failed {
        BillingPeriodStatus::PastDue
    } else {
        period.status
    }
}

pub(crate) async fn move_period(
    conn: &mut PgConnection,
    period: &BillingPeriod,
    next: BillingPeriodStatus,
) -> BillingResult<BillingPeriod> {
    if period.status == next {
        return Ok(period.clone());
    }
    if !period.status.can_transition_to(next) {
        return Err(BillingError::IllegalTransition {
            entity: "billing period",
            from: period.status.as_str(),
            to: next.as_str(),
        });
    }

    let updated = billing_periods::set_status(&mut *conn, period.id, next).await?;
    debug!(
        billing_period_id = %period.id,
        from = %period.status,
        to = %next,
        "billing period status changed"
    );
    Ok(updated)
}

pub(crate) async fn move_subscription(
    conn: &mut PgConnection,
    subscription: &Subscription,
    next: SubscriptionStatus,
) -> BillingResult<Subscription> {
    if subscription.status == next {
        return Ok(subscription.clone());
    }
    if !subscription.status.can_transition_to(next) {
        return Err(BillingError::IllegalTransition {
            entity: "subscription",
            from: subscription.status.as_str(),
            to: next.as_str(),
        });
    }

    let updated = subscriptions::set_status(&mut *conn, subscription.id, next).await?;
    info!(
        subscription_id = %subscription.id,
        from = %subscription.status,
        to = %next,
        "subscription status changed"
    );
    Ok(updated)
}

/// Recomputes a period's status from its balance after a payment outcome.
pub async fn refresh_period_status(
    conn: &mut PgConnection,
    period_id: Uuid,
    now: DateTime<Utc>,
    payment_failed: bool,
) -> BillingResult<BillingPeriod> {
    let period = billing_periods::get(&mut *conn, period_id)
        .await?
        .ok_or_else(|| BillingError::not_found("billing period", period_id))?;
    if period.status.is_terminal() {
        return Ok(period);
    }

    let totals = period_totals(conn, period.id).await?;
    let next = settled_status(&period, totals, now, payment_failed);
    if next != period.status && !period.status.can_transition_to(next) {
        warn!(
            billing_period_id = %period.id,
            from = %period.status,
            to = %next,
            "skipping billing period status change"
        );
        return Ok(period);
    }
    move_period(conn, &period, next).await
}

/// key: period-manager-close -> settle an ended period
pub async fn close_period(
    conn: &mut PgConnection,
    period: &BillingPeriod,
    now: DateTime<Utc>,
) -> BillingResult<BillingPeriod> {
    if period.status.is_terminal() {
        return Ok(period.clone());
    }
    if !period.has_ended(now) {
        return Err(BillingError::PeriodNotYetEnded {
            period_id: period.id,
            ends_at: period.end_date,
        });
    }

    let mut current = period.clone();
    if current.status == BillingPeriodStatus::Upcoming {
        current = move_period(conn, &current, BillingPeriodStatus::Active).await?;
    }

    let totals = period_totals(conn, current.id).await?;
    let next = if totals.remaining() <= 0 {
        BillingPeriodStatus::Completed
    } else {
        BillingPeriodStatus::PastDue
    };
    let closed = move_period(conn, &current, next).await?;
    info!(
        billing_period_id = %closed.id,
        status = %closed.status,
        due = totals.due,
        settled = totals.settled,
        "closed billing period"
    );
    Ok(closed)
}

/// Returns the period following `last_period_end`, reusing one that already
/// exists. The flag is `true` when a new period was inserted.
pub async fn generate_next_period(
    conn: &mut PgConnection,
    subscription: &Subscription,
    last_period_end: Option<DateTime<Utc>>,
    status: BillingPeriodStatus,
) -> BillingResult<(BillingPeriod, bool)> {
    let bounds = compute_next_period(
        subscription.billing_cycle_anchor,
        subscription.interval_unit,
        subscription.interval_count,
        last_period_end,
    )?;

    if let Some(existing) = billing_periods::find_future(&mut *conn, subscription.id, bounds.start).await? {
        debug!(
            subscription_id = %subscription.id,
            billing_period_id = %existing.id,
            "reusing existing future billing period"
        );
        return Ok((existing, false));
    }

    let period = insert_period(conn, subscription, bounds, status).await?;
    Ok((period, true))
}

async fn insert_period(
    conn: &mut PgConnection,
    subscription: &Subscription,
    bounds: PeriodBounds,
    status: BillingPeriodStatus,
) -> BillingResult<BillingPeriod> {
    let period = billing_periods::insert(
        &mut *conn,
        subscription.id,
        bounds.start,
        bounds.end,
        status,
        false,
    )
    .await?;

    let items = subscription_items::list_for_subscription(&mut *conn, subscription.id).await?;
    let mut materialized = 0;
    for item in items.iter().filter(|item| item.is_active_at(bounds.start)) {
        billing_period_items::insert(&mut *conn, period.id, &NewBillingPeriodItem::regular(item))
            .await?;
        materialized += 1;
    }

    info!(
        subscription_id = %subscription.id,
        billing_period_id = %period.id,
        start = %bounds.start,
        end = %bounds.end,
        items = materialized,
        "created billing period"
    );
    Ok(period)
}

/// Trial periods span `[start, trial_end]` and never carry charges.
pub async fn open_trial_period(
    conn: &mut PgConnection,
    subscription: &Subscription,
    start: DateTime<Utc>,
    trial_end: DateTime<Utc>,
) -> BillingResult<BillingPeriod> {
    if trial_end <= start {
        return Err(BillingError::ZeroOrNegativeDuration {
            start,
            end: trial_end,
        });
    }

    let period = billing_periods::insert(
        &mut *conn,
        subscription.id,
        start,
        trial_end,
        BillingPeriodStatus::Active,
        true,
    )
    .await?;
    info!(
        subscription_id = %subscription.id,
        billing_period_id = %period.id,
        %trial_end,
        "created trial billing period"
    );
    Ok(period)
}

pub(crate) async fn schedule_run(
    conn: &mut PgConnection,
    subscription: &Subscription,
    period: &BillingPeriod,
    scheduled_for: DateTime<Utc>,
) -> BillingResult<Option<BillingRun>> {
    let Some(payment_method_id) = subscription.billing_payment_method_id() else {
        return Ok(None);
    };

    let run = billing_runs::insert(
        &mut *conn,
        &NewBillingRun {
            billing_period_id: period.id,
            subscription_id: subscription.id,
            scheduled_for,
            payment_method_id,
            gateway_payment_intent_id: None,
            last_gateway_event_at: None,
        },
    )
    .await?;
    info!(
        subscription_id = %subscription.id,
        billing_period_id = %period.id,
        billing_run_id = %run.id,
        %scheduled_for,
        "scheduled billing run"
    );
    Ok(Some(run))
}

/// A cancellation scheduled at or after the prospective period's end means
/// that period is never opened.
pub fn renewal_declined(cancel_scheduled_at: Option<DateTime<Utc>>, next: PeriodBounds) -> bool {
    cancel_scheduled_at.map_or(false, |cancel_at| cancel_at >= next.end)
}

/// key: period-manager-transition -> roll subscription onto next period
pub async fn transition_subscription_billing_period(
    conn: &mut PgConnection,
    period_id: Uuid,
    now: DateTime<Utc>,
) -> BillingResult<PeriodTransition> {
    let period = billing_periods::get(&mut *conn, period_id)
        .await?
        .ok_or_else(|| BillingError::not_found("billing period", period_id))?;
    let subscription = subscriptions::lock_for_update(&mut *conn, period.subscription_id)
        .await?
        .ok_or_else(|| BillingError::not_found("subscription", period.subscription_id))?;

    let closed_period = close_period(conn, &period, now).await?;
    let unchanged = |subscription: Subscription, closed_period: BillingPeriod| PeriodTransition {
        subscription,
        closed_period,
        next_period: None,
        billing_run: None,
    };

    if subscription.is_terminal() {
        return Ok(unchanged(subscription, closed_period));
    }

    if let Some(cancel_at) = subscription.cancel_scheduled_at {
        if cancel_at <= now {
            let canceled = subscriptions::mark_canceled(&mut *conn, subscription.id, now).await?;
            info!(
                subscription_id = %subscription.id,
                %cancel_at,
                "canceled subscription at scheduled cancellation"
            );
            return Ok(unchanged(canceled, closed_period));
        }
    }

    if let Some(existing) =
        billing_periods::find_future(&mut *conn, subscription.id, closed_period.end_date).await?
    {
        debug!(
            subscription_id = %subscription.id,
            billing_period_id = %existing.id,
            "next billing period already exists"
        );
        return Ok(unchanged(subscription, closed_period));
    }

    let bounds = compute_next_period(
        subscription.billing_cycle_anchor,
        subscription.interval_unit,
        subscription.interval_count,
        Some(closed_period.end_date),
    )?;
    if renewal_declined(subscription.cancel_scheduled_at, bounds) {
        info!(
            subscription_id = %subscription.id,
            cancel_at = ?subscription.cancel_scheduled_at,
            next_period_end = %bounds.end,
            "scheduled cancellation declines the next billing period"
        );
        let past_due = move_subscription(conn, &subscription, SubscriptionStatus::PastDue).await?;
        return Ok(unchanged(past_due, closed_period));
    }

    let (next_period, _) = generate_next_period(
        conn,
        &subscription,
        Some(closed_period.end_date),
        BillingPeriodStatus::Active,
    )
    .await?;
    let next_period = if next_period.status == BillingPeriodStatus::Upcoming {
        move_period(conn, &next_period, BillingPeriodStatus::Active).await?
    } else {
        next_period
    };

    let billing_run = schedule_run(conn, &subscription, &next_period, next_period.start_date).await?;
    let next_status = if billing_run.is_none() {
        SubscriptionStatus::PastDue
    } else if subscription.status == SubscriptionStatus::Trialing {
        SubscriptionStatus::Active
    } else {
        subscription.status
    };
    if next_status != subscription.status && !subscription.status.can_transition_to(next_status) {
        return Err(BillingError::IllegalTransition {
            entity: "subscription",
            from: subscription.status.as_str(),
            to: next_status.as_str(),
        });
    }

    let subscription = subscriptions::set_current_period(
        &mut *conn,
        subscription.id,
        next_period.start_date,
        next_period.end_date,
        next_status,
    )
    .await?;
    if billing_run.is_none() {
        warn!(
            subscription_id = %subscription.id,
            "no payment method on file; subscription marked past due"
        );
    }

    Ok(PeriodTransition {
        subscription,
        closed_period,
        next_period: Some(next_period),
        billing_run,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn period(status: BillingPeriodStatus) -> BillingPeriod {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        BillingPeriod {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            start_date: start,
            end_date: start + Duration::days(31),
            status,
            trial_period: false,
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn paid_periods_complete_only_after_they_end() {
        let active = period(BillingPeriodStatus::Active);
        let paid = PeriodTotals { due: 1000, settled: 1000 };

        let during = active.start_date + Duration::days(2);
        assert_eq!(settled_status(&active, paid, during, false), BillingPeriodStatus::Active);
        assert_eq!(
            settled_status(&active, paid, active.end_date, false),
            BillingPeriodStatus::Completed
        );
    }

    #[test]
    fn failed_payments_push_unpaid_periods_past_due() {
        let active = period(BillingPeriodStatus::Active);
        let unpaid = PeriodTotals { due: 1000, settled: 0 };
        let during = active.start_date + Duration::days(2);

        assert_eq!(settled_status(&active, unpaid, during, true), BillingPeriodStatus::PastDue);
        assert_eq!(settled_status(&active, unpaid, during, false), BillingPeriodStatus::Active);
    }

    #[test]
    fn past_due_periods_recover_once_settled() {
        let past_due = period(BillingPeriodStatus::PastDue);
        let paid = PeriodTotals { due: 500, settled: 700 };
        let during = past_due.start_date + Duration::days(2);

        assert_eq!(settled_status(&past_due, paid, during, false), BillingPeriodStatus::Active);
        assert_eq!(
            settled_status(&past_due, paid, past_due.end_date + Duration::days(1), false),
            BillingPeriodStatus::Completed
        );
    }

    #[test]
    fn terminal_periods_keep_their_status() {
        let completed = period(BillingPeriodStatus::Completed);
        let unpaid = PeriodTotals { due: 1000, settled: 0 };
        assert_eq!(
            settled_status(&completed, unpaid, completed.end_date, true),
            BillingPeriodStatus::Completed
        );
    }

    #[test]
    fn cancellation_at_or_after_next_end_declines_renewal() {
        let next = period(BillingPeriodStatus::Upcoming).bounds();

        assert!(renewal_declined(Some(next.end), next));
        assert!(renewal_declined(Some(next.end + Duration::days(14)), next));
        assert!(!renewal_declined(Some(next.end - Duration::seconds(1)), next));
        assert!(!renewal_declined(None, next));
    }
}
