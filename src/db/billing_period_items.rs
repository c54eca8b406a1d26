use sqlx::{postgres::PgRow, Executor, Postgres, Row};
use uuid::Uuid;

use crate::billing::models::{BillingPeriodItem, NewBillingPeriodItem};

use super::decode_enum;

// key: billing-period-items-db -> materialized charges
pub async fn insert<'c, E>(
    executor: E,
    billing_period_id: Uuid,
    item: &NewBillingPeriodItem,
) -> Result<BillingPeriodItem, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        INSERT INTO billing_period_items (
            id,
            billing_period_id,
            subscription_item_id,
            kind,
            name,
            description,
            quantity,
            unit_price,
            discount_redemption_id
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(billing_period_id)
    .bind(item.subscription_item_id)
    .bind(item.kind.as_str())
    .bind(&item.name)
    .bind(item.description.as_deref())
    .bind(item.quantity)
    .bind(item.unit_price)
    .bind(item.discount_redemption_id)
    .fetch_one(executor)
    .await?;

    map_row(&row)
}

pub async fn list_for_period<'c, E>(
    executor: E,
    billing_period_id: Uuid,
) -> Result<Vec<BillingPeriodItem>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(
        r#"
        SELECT * FROM billing_period_items
        WHERE billing_period_id = $1
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(billing_period_id)
    .fetch_all(executor)
    .await?;

    rows.iter().map(map_row).collect()
}

/// Signed sum of quantity × unit price across the period's items.
pub async fn total_for_period<'c, E>(executor: E, billing_period_id: Uuid) -> Result<i64, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COALESCE(SUM(quantity::BIGINT * unit_price), 0)::BIGINT
        FROM billing_period_items
        WHERE billing_period_id = $1
        "#,
    )
    .bind(billing_period_id)
    .fetch_one(executor)
    .await
}

fn map_row(row: &PgRow) -> Result<BillingPeriodItem, sqlx::Error> {
    Ok(BillingPeriodItem {
        id: row.try_get("id")?,
        billing_period_id: row.try_get("billing_period_id")?,
        subscription_item_id: row.try_get("subscription_item_id")?,
        kind: decode_enum(row.try_get("kind")?)?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        quantity: row.try_get("quantity")?,
        unit_price: row.try_get("unit_price")?,
        discount_redemption_id: row.try_get("discount_redemption_id")?,
        created_at: row.try_get("created_at")?,
    })
}
