use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Executor, Postgres, Row};
use uuid::Uuid;

use crate::billing::models::{IntervalUnit, Subscription, SubscriptionStatus};

use super::decode_enum;

#[derive(Debug, Clone)]
pub struct NewSubscription<'a> {
    pub customer_id: Uuid,
    pub organization_id: Uuid,
    pub status: SubscriptionStatus,
    pub interval_unit: IntervalUnit,
    pub interval_count: i32,
    pub billing_cycle_anchor: DateTime<Utc>,
    pub trial_end: Option<DateTime<Utc>>,
    pub default_payment_method_id: Option<Uuid>,
    pub backup_payment_method_id: Option<Uuid>,
    pub currency: &'a str,
}

// key: subscriptions-db -> lifecycle persistence
pub async fn get<'c, E>(executor: E, subscription_id: Uuid) -> Result<Option<Subscription>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query("SELECT * FROM subscriptions WHERE id = $1")
        .bind(subscription_id)
        .fetch_optional(executor)
        .await?;

    row.map(|row| map_row(&row)).transpose()
}

/// Row-level lock serializing every workflow that moves the subscription's
/// current-period pointer.
pub async fn lock_for_update<'c, E>(
    executor: E,
    subscription_id: Uuid,
) -> Result<Option<Subscription>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query("SELECT * FROM subscriptions WHERE id = $1 FOR UPDATE")
        .bind(subscription_id)
        .fetch_optional(executor)
        .await?;

    row.map(|row| map_row(&row)).transpose()
}

pub async fn find_live_for_customer<'c, E>(
    executor: E,
    customer_id: Uuid,
) -> Result<Option<Subscription>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        SELECT * FROM subscriptions
        WHERE customer_id = $1
          AND status NOT IN ('canceled', 'incomplete_expired')
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(customer_id)
    .fetch_optional(executor)
    .await?;

    row.map(|row| map_row(&row)).transpose()
}

pub async fn insert<'c, E>(executor: E, input: &NewSubscription<'_>) -> Result<Subscription, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        INSERT INTO subscriptions (
            id,
            customer_id,
            organization_id,
            status,
            interval_unit,
            interval_count,
            billing_cycle_anchor,
            trial_end,
            default_payment_method_id,
            backup_payment_method_id,
            currency
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(input.customer_id)
    .bind(input.organization_id)
    .bind(input.status.as_str())
    .bind(input.interval_unit.as_str())
    .bind(input.interval_count)
    .bind(input.billing_cycle_anchor)
    .bind(input.trial_end)
    .bind(input.default_payment_method_id)
    .bind(input.backup_payment_method_id)
    .bind(input.currency)
    .fetch_one(executor)
    .await?;

    map_row(&row)
}

pub async fn set_status<'c, E>(
    executor: E,
    subscription_id: Uuid,
    status: SubscriptionStatus,
) -> Result<Subscription, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        UPDATE subscriptions
        SET status = $2, version = version + 1, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(subscription_id)
    .bind(status.as_str())
    .fetch_one(executor)
    .await?;

    map_row(&row)
}

pub async fn mark_canceled<'c, E>(
    executor: E,
    subscription_id: Uuid,
    canceled_at: DateTime<Utc>,
) -> Result<Subscription, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        UPDATE subscriptions
        SET status = 'canceled', canceled_at = $2, version = version + 1, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(subscription_id)
    .bind(canceled_at)
    .fetch_one(executor)
    .await?;

    map_row(&row)
}

pub async fn set_current_period<'c, E>(
    executor: E,
    subscription_id: Uuid,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    status: SubscriptionStatus,
) -> Result<Subscription, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        UPDATE subscriptions
        SET
            current_billing_period_start = $2,
            current_billing_period_end = $3,
            status = $4,
            version = version + 1,
            updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(subscription_id)
    .bind(start)
    .bind(end)
    .bind(status.as_str())
    .fetch_one(executor)
    .await?;

    map_row(&row)
}

fn map_row(row: &PgRow) -> Result<Subscription, sqlx::Error> {
    Ok(Subscription {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        organization_id: row.try_get("organization_id")?,
        status: decode_enum(row.try_get("status")?)?,
        interval_unit: decode_enum(row.try_get("interval_unit")?)?,
        interval_count: row.try_get("interval_count")?,
        billing_cycle_anchor: row.try_get("billing_cycle_anchor")?,
        current_billing_period_start: row.try_get("current_billing_period_start")?,
        current_billing_period_end: row.try_get("current_billing_period_end")?,
        trial_end: row.try_get("trial_end")?,
        default_payment_method_id: row.try_get("default_payment_method_id")?,
        backup_payment_method_id: row.try_get("backup_payment_method_id")?,
        cancel_scheduled_at: row.try_get("cancel_scheduled_at")?,
        canceled_at: row.try_get("canceled_at")?,
        currency: row.try_get("currency")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
