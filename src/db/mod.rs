//! Record store access. Every function takes an `Executor` so callers decide
//! whether it runs against the pool or inside an explicit transaction.

pub mod billing_period_items;
pub mod billing_periods;
pub mod billing_runs;
pub mod customers;
pub mod invoices;
pub mod payments;
pub mod subscription_items;
pub mod subscriptions;

use std::str::FromStr;

use crate::billing::error::UnknownVariant;

pub(crate) fn decode_enum<T>(value: String) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = UnknownVariant>,
{
    value
        .parse::<T>()
        .map_err(|err| sqlx::Error::Decode(Box::new(err)))
}
