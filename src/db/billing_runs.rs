use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgRow, Executor, Postgres, Row};
use uuid::Uuid;

use crate::billing::models::{BillingRun, BillingRunStatus};

use super::decode_enum;

#[derive(Debug, Clone)]
pub struct NewBillingRun<'a> {
    pub billing_period_id: Uuid,
    pub subscription_id: Uuid,
    pub scheduled_for: DateTime<Utc>,
    pub payment_method_id: Uuid,
    pub gateway_payment_intent_id: Option<&'a str>,
    pub last_gateway_event_at: Option<DateTime<Utc>>,
}

// key: billing-runs-db -> payment attempts
pub async fn get<'c, E>(executor: E, run_id: Uuid) -> Result<Option<BillingRun>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query("SELECT * FROM billing_runs WHERE id = $1")
        .bind(run_id)
        .fetch_optional(executor)
        .await?;

    row.map(|row| map_row(&row)).transpose()
}

pub async fn lock_for_update<'c, E>(executor: E, run_id: Uuid) -> Result<Option<BillingRun>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query("SELECT * FROM billing_runs WHERE id = $1 FOR UPDATE")
        .bind(run_id)
        .fetch_optional(executor)
        .await?;

    row.map(|row| map_row(&row)).transpose()
}

pub async fn insert<'c, E>(executor: E, input: &NewBillingRun<'_>) -> Result<BillingRun, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        INSERT INTO billing_runs (
            id,
            billing_period_id,
            subscription_id,
            status,
            scheduled_for,
            payment_method_id,
            gateway_payment_intent_id,
            last_gateway_event_at
        ) VALUES ($1, $2, $3, 'scheduled', $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(input.billing_period_id)
    .bind(input.subscription_id)
    .bind(input.scheduled_for)
    .bind(input.payment_method_id)
    .bind(input.gateway_payment_intent_id)
    .bind(input.last_gateway_event_at)
    .fetch_one(executor)
    .await?;

    map_row(&row)
}

/// Compare-and-set on `version`. Returns `None` when another writer moved the
/// run first.
pub async fn transition<'c, E>(
    executor: E,
    run_id: Uuid,
    expected_version: i64,
    status: BillingRunStatus,
    error_details: Option<&Value>,
) -> Result<Option<BillingRun>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        UPDATE billing_runs
        SET
            status = $3,
            error_details = COALESCE($4, error_details),
            started_at = COALESCE(started_at, NOW()),
            completed_at = CASE WHEN $5 THEN NOW() ELSE completed_at END,
            version = version + 1,
            updated_at = NOW()
        WHERE id = $1 AND version = $2
        RETURNING *
        "#,
    )
    .bind(run_id)
    .bind(expected_version)
    .bind(status.as_str())
    .bind(error_details)
    .bind(status.is_terminal())
    .fetch_optional(executor)
    .await?;

    row.map(|row| map_row(&row)).transpose()
}

pub async fn attach_payment_intent<'c, E>(
    executor: E,
    run_id: Uuid,
    expected_version: i64,
    intent_id: &str,
) -> Result<Option<BillingRun>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        UPDATE billing_runs
        SET gateway_payment_intent_id = $3, version = version + 1, updated_at = NOW()
        WHERE id = $1 AND version = $2
        RETURNING *
        "#,
    )
    .bind(run_id)
    .bind(expected_version)
    .bind(intent_id)
    .fetch_optional(executor)
    .await?;

    row.map(|row| map_row(&row)).transpose()
}

/// Applies a gateway-reported status only if `occurred_at` is newer than the
/// last event already applied. `None` means the event was stale.
pub async fn apply_gateway_event<'c, E>(
    executor: E,
    run_id: Uuid,
    status: BillingRunStatus,
    occurred_at: DateTime<Utc>,
) -> Result<Option<BillingRun>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        UPDATE billing_runs
        SET
            status = $2,
            last_gateway_event_at = $3,
            started_at = COALESCE(started_at, NOW()),
            completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END,
            version = version + 1,
            updated_at = NOW()
        WHERE id = $1
          AND (last_gateway_event_at IS NULL OR last_gateway_event_at < $3)
        RETURNING *
        "#,
    )
    .bind(run_id)
    .bind(status.as_str())
    .bind(occurred_at)
    .bind(status.is_terminal())
    .fetch_optional(executor)
    .await?;

    row.map(|row| map_row(&row)).transpose()
}

/// Records an event timestamp without changing the status.
pub async fn touch_gateway_event<'c, E>(
    executor: E,
    run_id: Uuid,
    occurred_at: DateTime<Utc>,
) -> Result<Option<BillingRun>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        UPDATE billing_runs
        SET last_gateway_event_at = $2, updated_at = NOW()
        WHERE id = $1
          AND (last_gateway_event_at IS NULL OR last_gateway_event_at < $2)
        RETURNING *
        "#,
    )
    .bind(run_id)
    .bind(occurred_at)
    .fetch_optional(executor)
    .await?;

    row.map(|row| map_row(&row)).transpose()
}

pub async fn list_for_period<'c, E>(
    executor: E,
    billing_period_id: Uuid,
) -> Result<Vec<BillingRun>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(
        r#"
        SELECT * FROM billing_runs
        WHERE billing_period_id = $1
        ORDER BY created_at ASC, scheduled_for ASC
        "#,
    )
    .bind(billing_period_id)
    .fetch_all(executor)
    .await?;

    rows.iter().map(map_row).collect()
}

pub async fn list_due<'c, E>(
    executor: E,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<BillingRun>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(
        r#"
        SELECT * FROM billing_runs
        WHERE status = 'scheduled'
          AND scheduled_for <= $1
        ORDER BY scheduled_for ASC
        LIMIT $2
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(executor)
    .await?;

    rows.iter().map(map_row).collect()
}

fn map_row(row: &PgRow) -> Result<BillingRun, sqlx::Error> {
    Ok(BillingRun {
        id: row.try_get("id")?,
        billing_period_id: row.try_get("billing_period_id")?,
        subscription_id: row.try_get("subscription_id")?,
        status: decode_enum(row.try_get("status")?)?,
        scheduled_for: row.try_get("scheduled_for")?,
        payment_method_id: row.try_get("payment_method_id")?,
        gateway_payment_intent_id: row.try_get("gateway_payment_intent_id")?,
        last_gateway_event_at: row.try_get("last_gateway_event_at")?,
        error_details: row.try_get("error_details")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
