use serde_json::Value;
use sqlx::{postgres::PgRow, Executor, Postgres, Row};
use uuid::Uuid;

use crate::billing::models::{BillingPeriodItem, Invoice, InvoiceLineItem, InvoiceStatus};

use super::decode_enum;

#[derive(Debug, Clone)]
pub struct NewInvoice<'a> {
    pub billing_period_id: Uuid,
    pub subscription_id: Uuid,
    pub customer_id: Uuid,
    pub organization_id: Uuid,
    pub currency: &'a str,
}

/// Human-facing invoice number derived from the row id.
pub fn invoice_number(id: Uuid) -> String {
    let simple = id.simple().to_string();
    format!("INV-{}", simple[..12].to_ascii_uppercase())
}

// key: invoices-db -> invoice persistence
pub async fn get<'c, E>(executor: E, invoice_id: Uuid) -> Result<Option<Invoice>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query("SELECT * FROM invoices WHERE id = $1")
        .bind(invoice_id)
        .fetch_optional(executor)
        .await?;

    row.map(|row| map_row(&row)).transpose()
}

pub async fn get_for_period<'c, E>(
    executor: E,
    billing_period_id: Uuid,
) -> Result<Option<Invoice>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query("SELECT * FROM invoices WHERE billing_period_id = $1 FOR UPDATE")
        .bind(billing_period_id)
        .fetch_optional(executor)
        .await?;

    row.map(|row| map_row(&row)).transpose()
}

/// Inserts a draft invoice for the period. Returns `None` when one already
/// exists.
pub async fn insert_draft<'c, E>(executor: E, input: &NewInvoice<'_>) -> Result<Option<Invoice>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let id = Uuid::new_v4();
    let row = sqlx::query(
        r#"
        INSERT INTO invoices (
            id,
            invoice_number,
            billing_period_id,
            subscription_id,
            customer_id,
            organization_id,
            status,
            currency
        ) VALUES ($1, $2, $3, $4, $5, $6, 'draft', $7)
        ON CONFLICT (billing_period_id) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(invoice_number(id))
    .bind(input.billing_period_id)
    .bind(input.subscription_id)
    .bind(input.customer_id)
    .bind(input.organization_id)
    .bind(input.currency)
    .fetch_optional(executor)
    .await?;

    row.map(|row| map_row(&row)).transpose()
}

pub async fn set_status<'c, E>(executor: E, invoice_id: Uuid, status: InvoiceStatus) -> Result<Invoice, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        UPDATE invoices
        SET status = $2, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(invoice_id)
    .bind(status.as_str())
    .fetch_one(executor)
    .await?;

    map_row(&row)
}

pub async fn set_totals<'c, E>(
    executor: E,
    invoice_id: Uuid,
    subtotal: i64,
    total_due: i64,
    fee_breakdown: &Value,
) -> Result<Invoice, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        UPDATE invoices
        SET subtotal = $2, total_due = $3, fee_breakdown = $4, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(invoice_id)
    .bind(subtotal)
    .bind(total_due)
    .bind(fee_breakdown)
    .fetch_one(executor)
    .await?;

    map_row(&row)
}

pub async fn clear_line_items<'c, E>(executor: E, invoice_id: Uuid) -> Result<u64, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query("DELETE FROM invoice_line_items WHERE invoice_id = $1")
        .bind(invoice_id)
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

pub async fn insert_line_item<'c, E>(
    executor: E,
    invoice_id: Uuid,
    item: &BillingPeriodItem,
) -> Result<InvoiceLineItem, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let description = item.description.clone().unwrap_or_else(|| item.name.clone());
    let row = sqlx::query(
        r#"
        INSERT INTO invoice_line_items (
            id,
            invoice_id,
            billing_period_item_id,
            description,
            quantity,
            unit_price,
            amount
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(invoice_id)
    .bind(item.id)
    .bind(description)
    .bind(item.quantity)
    .bind(item.unit_price)
    .bind(item.amount())
    .fetch_one(executor)
    .await?;

    map_line_item(&row)
}

pub async fn list_line_items<'c, E>(executor: E, invoice_id: Uuid) -> Result<Vec<InvoiceLineItem>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(
        r#"
        SELECT * FROM invoice_line_items
        WHERE invoice_id = $1
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(invoice_id)
    .fetch_all(executor)
    .await?;

    rows.iter().map(map_line_item).collect()
}

fn map_row(row: &PgRow) -> Result<Invoice, sqlx::Error> {
    Ok(Invoice {
        id: row.try_get("id")?,
        invoice_number: row.try_get("invoice_number")?,
        billing_period_id: row.try_get("billing_period_id")?,
        subscription_id: row.try_get("subscription_id")?,
        customer_id: row.try_get("customer_id")?,
        organization_id: row.try_get("organization_id")?,
        status: decode_enum(row.try_get("status")?)?,
        currency: row.try_get("currency")?,
        subtotal: row.try_get("subtotal")?,
        total_due: row.try_get("total_due")?,
        fee_breakdown: row.try_get("fee_breakdown")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_line_item(row: &PgRow) -> Result<InvoiceLineItem, sqlx::Error> {
    Ok(InvoiceLineItem {
        id: row.try_get("id")?,
        invoice_id: row.try_get("invoice_id")?,
        billing_period_item_id: row.try_get("billing_period_item_id")?,
        description: row.try_get("description")?,
        quantity: row.try_get("quantity")?,
        unit_price: row.try_get("unit_price")?,
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoice_numbers_are_stable_per_id() {
        let id = Uuid::parse_str("3f2504e0-4f89-11d3-9a0c-0305e82c3301").unwrap();
        assert_eq!(invoice_number(id), "INV-3F2504E04F89");
        assert_eq!(invoice_number(id), invoice_number(id));
    }
}
