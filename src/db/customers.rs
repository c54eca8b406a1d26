use sqlx::{postgres::PgRow, Executor, Postgres, Row};
use uuid::Uuid;

use crate::billing::models::{Customer, Organization, PaymentMethod, PaymentMethodKind};

use super::decode_enum;

// key: billing-db -> organizations,customers,payment methods
pub async fn get_organization<'c, E>(
    executor: E,
    organization_id: Uuid,
) -> Result<Option<Organization>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        SELECT id, name, platform_fee_basis_points, default_currency, created_at
        FROM organizations
        WHERE id = $1
        "#,
    )
    .bind(organization_id)
    .fetch_optional(executor)
    .await?;

    row.map(|row| map_organization(&row)).transpose()
}

pub async fn insert_organization<'c, E>(
    executor: E,
    name: &str,
    platform_fee_basis_points: i32,
    default_currency: &str,
) -> Result<Organization, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        INSERT INTO organizations (id, name, platform_fee_basis_points, default_currency)
        VALUES ($1, $2, $3, $4)
        RETURNING id, name, platform_fee_basis_points, default_currency, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(platform_fee_basis_points)
    .bind(default_currency)
    .fetch_one(executor)
    .await?;

    map_organization(&row)
}

pub async fn get_customer<'c, E>(
    executor: E,
    customer_id: Uuid,
) -> Result<Option<Customer>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        SELECT id, organization_id, email, name, gateway_customer_ref, created_at
        FROM customers
        WHERE id = $1
        "#,
    )
    .bind(customer_id)
    .fetch_optional(executor)
    .await?;

    row.map(|row| map_customer(&row)).transpose()
}

pub async fn insert_customer<'c, E>(
    executor: E,
    organization_id: Uuid,
    email: &str,
    gateway_customer_ref: Option<&str>,
) -> Result<Customer, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        INSERT INTO customers (id, organization_id, email, gateway_customer_ref)
        VALUES ($1, $2, $3, $4)
        RETURNING id, organization_id, email, name, gateway_customer_ref, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(email)
    .bind(gateway_customer_ref)
    .fetch_one(executor)
    .await?;

    map_customer(&row)
}

pub async fn get_payment_method<'c, E>(
    executor: E,
    payment_method_id: Uuid,
) -> Result<Option<PaymentMethod>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        SELECT id, customer_id, kind, gateway_payment_method_ref, created_at
        FROM payment_methods
        WHERE id = $1
        "#,
    )
    .bind(payment_method_id)
    .fetch_optional(executor)
    .await?;

    row.map(|row| map_payment_method(&row)).transpose()
}

pub async fn insert_payment_method<'c, E>(
    executor: E,
    customer_id: Uuid,
    kind: PaymentMethodKind,
    gateway_payment_method_ref: Option<&str>,
) -> Result<PaymentMethod, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        INSERT INTO payment_methods (id, customer_id, kind, gateway_payment_method_ref)
        VALUES ($1, $2, $3, $4)
        RETURNING id, customer_id, kind, gateway_payment_method_ref, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(customer_id)
    .bind(kind.as_str())
    .bind(gateway_payment_method_ref)
    .fetch_one(executor)
    .await?;

    map_payment_method(&row)
}

fn map_organization(row: &PgRow) -> Result<Organization, sqlx::Error> {
    Ok(Organization {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        platform_fee_basis_points: row.try_get("platform_fee_basis_points")?,
        default_currency: row.try_get("default_currency")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_customer(row: &PgRow) -> Result<Customer, sqlx::Error> {
    Ok(Customer {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        gateway_customer_ref: row.try_get("gateway_customer_ref")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_payment_method(row: &PgRow) -> Result<PaymentMethod, sqlx::Error> {
    Ok(PaymentMethod {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        kind: decode_enum(row.try_get("kind")?)?,
        gateway_payment_method_ref: row.try_get("gateway_payment_method_ref")?,
        created_at: row.try_get("created_at")?,
    })
}
