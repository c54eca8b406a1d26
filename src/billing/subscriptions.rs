use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use tracing::info;
use uuid::Uuid;

use crate::db::{
    billing_periods, billing_runs, customers,
    subscription_items,
    subscriptions::{self, NewSubscription},
};

use super::error::{BillingError, BillingResult};
use super::models::{
    BillingPeriod, BillingPeriodStatus, BillingRun, IntervalUnit, Subscription, SubscriptionItem,
    SubscriptionStatus,
};
use super::periods;

#[derive(Debug, Clone, Deserialize)]
pub struct NewItem {
    pub name: String,
    pub quantity: i32,
    pub unit_price: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubscription {
    pub customer_id: Uuid,
    pub items: Vec<NewItem>,
    pub interval_unit: IntervalUnit,
    #[serde(default = "default_interval_count")]
    pub interval_count: i32,
    #[serde(default)]
    pub billing_cycle_anchor: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trial_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub default_payment_method_id: Option<Uuid>,
    #[serde(default)]
    pub backup_payment_method_id: Option<Uuid>,
    #[serde(default)]
    pub currency: Option<String>,
}

fn default_interval_count() -> i32 {
    1
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionDetails {
    pub subscription: Subscription,
    pub items: Vec<SubscriptionItem>,
    pub current_period: Option<BillingPeriod>,
    pub billing_run: Option<BillingRun>,
}

pub fn validate_item(name: &str, quantity: i32, unit_price: i64) -> BillingResult<()> {
    if name.trim().is_empty() {
        return Err(BillingError::InvalidSubscriptionItem(
            "name must not be empty".into(),
        ));
    }
    if quantity <= 0 {
        return Err(BillingError::InvalidSubscriptionItem(format!(
            "`{name}` quantity must be positive, got {quantity}"
        )));
    }
    if unit_price < 0 {
        return Err(BillingError::InvalidSubscriptionItem(format!(
            "`{name}` unit price must not be negative, got {unit_price}"
        )));
    }
    Ok(())
}

/// Status a new subscription starts in.
pub fn initial_status(has_trial: bool, has_payment_method: bool) -> SubscriptionStatus {
    if has_trial {
        SubscriptionStatus::Trialing
    } else if has_payment_method {
        SubscriptionStatus::Active
    } else {
        SubscriptionStatus::Incomplete
    }
}

/// key: subscription-create -> subscription, first period, first run
pub async fn create_subscription(
    conn: &mut PgConnection,
    input: &CreateSubscription,
    default_currency: &str,
    now: DateTime<Utc>,
) -> BillingResult<SubscriptionDetails> {
    for item in &input.items {
        validate_item(&item.name, item.quantity, item.unit_price)?;
    }
    if input.interval_count <= 0 {
        return Err(BillingError::InvalidInterval {
            count: input.interval_count,
        });
    }
    if !matches!(input.interval_unit, IntervalUnit::Month | IntervalUnit::Year) {
        return Err(BillingError::UnsupportedInterval(
            input.interval_unit.as_str().to_string(),
        ));
    }

    let customer = customers::get_customer(&mut *conn, input.customer_id)
        .await?
        .ok_or_else(|| BillingError::not_found("customer", input.customer_id))?;
    for payment_method_id in [input.default_payment_method_id, input.backup_payment_method_id]
        .into_iter()
        .flatten()
    {
        let payment_method = customers::get_payment_method(&mut *conn, payment_method_id)
            .await?
            .ok_or_else(|| BillingError::not_found("payment method", payment_method_id))?;
        if payment_method.customer_id != customer.id {
            return Err(BillingError::not_found("payment method", payment_method_id));
        }
    }
    if let Some(existing) = subscriptions::find_live_for_customer(&mut *conn, customer.id).await? {
        return Err(BillingError::ActiveSubscriptionExists(existing.id));
    }

    let start = input.billing_cycle_anchor.unwrap_or(now);
    let anchor = input.trial_end.unwrap_or(start);
    let has_payment_method =
        input.default_payment_method_id.is_some() || input.backup_payment_method_id.is_some();
    let status = initial_status(input.trial_end.is_some(), has_payment_method);
    let currency = input
        .currency
        .as_deref()
        .unwrap_or(default_currency)
        .to_ascii_lowercase();

    let subscription = subscriptions::insert(
        &mut *conn,
        &NewSubscription {
            customer_id: customer.id,
            organization_id: customer.organization_id,
            status,
            interval_unit: input.interval_unit,
            interval_count: input.interval_count,
            billing_cycle_anchor: anchor,
            trial_end: input.trial_end,
            default_payment_method_id: input.default_payment_method_id,
            backup_payment_method_id: input.backup_payment_method_id,
            currency: &currency,
        },
    )
    .await?;

    let mut items = Vec::with_capacity(input.items.len());
    for item in &input.items {
        items.push(
            subscription_items::insert(
                &mut *conn,
                subscription.id,
                &item.name,
                item.quantity,
                item.unit_price,
                start,
            )
            .await?,
        );
    }

    let period = match input.trial_end {
        Some(trial_end) => periods::open_trial_period(conn, &subscription, start, trial_end).await?,
        None => {
            let (period, _) = periods::generate_next_period(
                conn,
                &subscription,
                None,
                BillingPeriodStatus::Active,
            )
            .await?;
            period
        }
    };

    let billing_run = if period.trial_period {
        None
    } else {
        periods::schedule_run(conn, &subscription, &period, period.start_date).await?
    };

    let subscription = subscriptions::set_current_period(
        &mut *conn,
        subscription.id,
        period.start_date,
        period.end_date,
        subscription.status,
    )
    .await?;

    info!(
        subscription_id = %subscription.id,
        customer_id = %customer.id,
        status = %subscription.status,
        billing_period_id = %period.id,
        "created subscription"
    );

    Ok(SubscriptionDetails {
        subscription,
        items,
        current_period: Some(period),
        billing_run,
    })
}

/// key: subscription-read -> subscription with live items and current period
pub async fn get_subscription(
    conn: &mut PgConnection,
    subscription_id: Uuid,
) -> BillingResult<SubscriptionDetails> {
    let subscription = subscriptions::get(&mut *conn, subscription_id)
        .await?
        .ok_or_else(|| BillingError::not_found("subscription", subscription_id))?;
    let items = subscription_items::list_unremoved(&mut *conn, subscription_id).await?;

    let current_period = match subscription.current_billing_period_start {
        Some(start) => billing_periods::find_covering(&mut *conn, subscription_id, start).await?,
        None => None,
    };
    let billing_run = match &current_period {
        Some(period) => billing_runs::list_for_period(&mut *conn, period.id)
            .await?
            .into_iter()
            .last(),
        None => None,
    };

    Ok(SubscriptionDetails {
        subscription,
        items,
        current_period,
        billing_run,
    })
}
