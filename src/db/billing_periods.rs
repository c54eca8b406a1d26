use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Executor, Postgres, Row};
use uuid::Uuid;

use crate::billing::models::{BillingPeriod, BillingPeriodStatus};

use super::decode_enum;

// key: billing-periods-db -> period persistence
pub async fn get<'c, E>(executor: E, period_id: Uuid) -> Result<Option<BillingPeriod>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query("SELECT * FROM billing_periods WHERE id = $1")
        .bind(period_id)
        .fetch_optional(executor)
        .await?;

    row.map(|row| map_row(&row)).transpose()
}

pub async fn insert<'c, E>(
    executor: E,
    subscription_id: Uuid,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    status: BillingPeriodStatus,
    trial_period: bool,
) -> Result<BillingPeriod, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        INSERT INTO billing_periods (id, subscription_id, start_date, end_date, status, trial_period)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(subscription_id)
    .bind(start_date)
    .bind(end_date)
    .bind(status.as_str())
    .bind(trial_period)
    .fetch_one(executor)
    .await?;

    map_row(&row)
}

pub async fn set_status<'c, E>(
    executor: E,
    period_id: Uuid,
    status: BillingPeriodStatus,
) -> Result<BillingPeriod, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        UPDATE billing_periods
        SET status = $2, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(period_id)
    .bind(status.as_str())
    .fetch_one(executor)
    .await?;

    map_row(&row)
}

/// Earliest period of the subscription starting at or after `from`.
pub async fn find_future<'c, E>(
    executor: E,
    subscription_id: Uuid,
    from: DateTime<Utc>,
) -> Result<Option<BillingPeriod>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        SELECT * FROM billing_periods
        WHERE subscription_id = $1
          AND start_date >= $2
          AND status <> 'canceled'
        ORDER BY start_date ASC
        LIMIT 1
        "#,
    )
    .bind(subscription_id)
    .bind(from)
    .fetch_optional(executor)
    .await?;

    row.map(|row| map_row(&row)).transpose()
}

/// Period covering `at`, inclusive of both bounds.
pub async fn find_covering<'c, E>(
    executor: E,
    subscription_id: Uuid,
    at: DateTime<Utc>,
) -> Result<Option<BillingPeriod>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        SELECT * FROM billing_periods
        WHERE subscription_id = $1
          AND start_date <= $2
          AND end_date >= $2
          AND status <> 'canceled'
        ORDER BY start_date DESC
        LIMIT 1
        "#,
    )
    .bind(subscription_id)
    .bind(at)
    .fetch_optional(executor)
    .await?;

    row.map(|row| map_row(&row)).transpose()
}

pub async fn list_for_subscription<'c, E>(
    executor: E,
    subscription_id: Uuid,
) -> Result<Vec<BillingPeriod>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(
        r#"
        SELECT * FROM billing_periods
        WHERE subscription_id = $1
        ORDER BY start_date ASC
        "#,
    )
    .bind(subscription_id)
    .fetch_all(executor)
    .await?;

    rows.iter().map(map_row).collect()
}

/// Current periods of live subscriptions whose end has passed.
pub async fn list_ended_current<'c, E>(
    executor: E,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<BillingPeriod>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(
        r#"
        SELECT p.*
        FROM billing_periods p
        JOIN subscriptions s ON s.id = p.subscription_id
        WHERE s.status NOT IN ('canceled', 'incomplete_expired')
          AND p.start_date = s.current_billing_period_start
          AND p.end_date <= $1
        ORDER BY p.end_date ASC
        LIMIT $2
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(executor)
    .await?;

    rows.iter().map(map_row).collect()
}

fn map_row(row: &PgRow) -> Result<BillingPeriod, sqlx::Error> {
    Ok(BillingPeriod {
        id: row.try_get("id")?,
        subscription_id: row.try_get("subscription_id")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        status: decode_enum(row.try_get("status")?)?,
        trial_period: row.try_get("trial_period")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
