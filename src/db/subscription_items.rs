use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Executor, Postgres, Row};
use uuid::Uuid;

use crate::billing::models::SubscriptionItem;

// key: subscription-items-db -> billable lines with soft removal
pub async fn list_for_subscription<'c, E>(
    executor: E,
    subscription_id: Uuid,
) -> Result<Vec<SubscriptionItem>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(
        r#"
        SELECT * FROM subscription_items
        WHERE subscription_id = $1
        ORDER BY added_date ASC, created_at ASC
        "#,
    )
    .bind(subscription_id)
    .fetch_all(executor)
    .await?;

    rows.iter().map(map_row).collect()
}

/// Items not yet removed, including ones whose `added_date` lies ahead.
pub async fn list_unremoved<'c, E>(
    executor: E,
    subscription_id: Uuid,
) -> Result<Vec<SubscriptionItem>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(
        r#"
        SELECT * FROM subscription_items
        WHERE subscription_id = $1
          AND removed_date IS NULL
        ORDER BY added_date ASC, created_at ASC
        "#,
    )
    .bind(subscription_id)
    .fetch_all(executor)
    .await?;

    rows.iter().map(map_row).collect()
}

pub async fn insert<'c, E>(
    executor: E,
    subscription_id: Uuid,
    name: &str,
    quantity: i32,
    unit_price: i64,
    added_date: DateTime<Utc>,
) -> Result<SubscriptionItem, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        INSERT INTO subscription_items (id, subscription_id, name, quantity, unit_price, added_date)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(subscription_id)
    .bind(name)
    .bind(quantity)
    .bind(unit_price)
    .bind(added_date)
    .fetch_one(executor)
    .await?;

    map_row(&row)
}

pub async fn update<'c, E>(
    executor: E,
    item_id: Uuid,
    name: &str,
    quantity: i32,
    unit_price: i64,
) -> Result<SubscriptionItem, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        UPDATE subscription_items
        SET name = $2, quantity = $3, unit_price = $4, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(item_id)
    .bind(name)
    .bind(quantity)
    .bind(unit_price)
    .fetch_one(executor)
    .await?;

    map_row(&row)
}

pub async fn mark_removed<'c, E>(
    executor: E,
    item_id: Uuid,
    removed_date: DateTime<Utc>,
) -> Result<SubscriptionItem, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        UPDATE subscription_items
        SET removed_date = $2, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(item_id)
    .bind(removed_date)
    .fetch_one(executor)
    .await?;

    map_row(&row)
}

fn map_row(row: &PgRow) -> Result<SubscriptionItem, sqlx::Error> {
    Ok(SubscriptionItem {
        id: row.try_get("id")?,
        subscription_id: row.try_get("subscription_id")?,
        name: row.try_get("name")?,
        quantity: row.try_get("quantity")?,
        unit_price: row.try_get("unit_price")?,
        added_date: row.try_get("added_date")?,
        removed_date: row.try_get("removed_date")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
