use sqlx::{postgres::PgRow, Executor, Postgres, Row};
use uuid::Uuid;

use crate::billing::models::{Payment, PaymentStatus};

use super::decode_enum;

#[derive(Debug, Clone)]
pub struct NewPayment<'a> {
    pub invoice_id: Uuid,
    pub billing_period_id: Uuid,
    pub billing_run_id: Uuid,
    pub customer_id: Uuid,
    pub organization_id: Uuid,
    pub amount: i64,
    pub currency: &'a str,
    pub status: PaymentStatus,
}

// key: payments-db -> collected funds
pub async fn insert<'c, E>(executor: E, input: &NewPayment<'_>) -> Result<Payment, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        INSERT INTO payments (
            id,
            invoice_id,
            billing_period_id,
            billing_run_id,
            customer_id,
            organization_id,
            amount,
            currency,
            status
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(input.invoice_id)
    .bind(input.billing_period_id)
    .bind(input.billing_run_id)
    .bind(input.customer_id)
    .bind(input.organization_id)
    .bind(input.amount)
    .bind(input.currency)
    .bind(input.status.as_str())
    .fetch_one(executor)
    .await?;

    map_row(&row)
}

pub async fn latest_for_run<'c, E>(executor: E, billing_run_id: Uuid) -> Result<Option<Payment>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        SELECT * FROM payments
        WHERE billing_run_id = $1
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(billing_run_id)
    .fetch_optional(executor)
    .await?;

    row.map(|row| map_row(&row)).transpose()
}

pub async fn set_status<'c, E>(
    executor: E,
    payment_id: Uuid,
    status: PaymentStatus,
    gateway_charge_id: Option<&str>,
) -> Result<Payment, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        UPDATE payments
        SET
            status = $2,
            gateway_charge_id = COALESCE($3, gateway_charge_id),
            updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(payment_id)
    .bind(status.as_str())
    .bind(gateway_charge_id)
    .fetch_one(executor)
    .await?;

    map_row(&row)
}

/// Amount collected for the period net of refunds.
pub async fn settled_for_period<'c, E>(executor: E, billing_period_id: Uuid) -> Result<i64, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COALESCE(SUM(amount - refunded_amount), 0)::BIGINT
        FROM payments
        WHERE billing_period_id = $1
          AND status IN ('succeeded', 'refunded')
        "#,
    )
    .bind(billing_period_id)
    .fetch_one(executor)
    .await
}

pub async fn list_for_period<'c, E>(executor: E, billing_period_id: Uuid) -> Result<Vec<Payment>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(
        r#"
        SELECT * FROM payments
        WHERE billing_period_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(billing_period_id)
    .fetch_all(executor)
    .await?;

    rows.iter().map(map_row).collect()
}

fn map_row(row: &PgRow) -> Result<Payment, sqlx::Error> {
    Ok(Payment {
        id: row.try_get("id")?,
        invoice_id: row.try_get("invoice_id")?,
        billing_period_id: row.try_get("billing_period_id")?,
        billing_run_id: row.try_get("billing_run_id")?,
        customer_id: row.try_get("customer_id")?,
        organization_id: row.try_get("organization_id")?,
        amount: row.try_get("amount")?,
        refunded_amount: row.try_get("refunded_amount")?,
        currency: row.try_get("currency")?,
        status: decode_enum(row.try_get("status")?)?,
        gateway_charge_id: row.try_get("gateway_charge_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
