use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use tracing::info;
use uuid::Uuid;

use crate::db::{
    billing_period_items, billing_periods,
    billing_runs::{self, NewBillingRun},
    subscription_items, subscriptions,
};

use super::error::{BillingError, BillingResult};
use super::models::{
    BillingPeriodItem, BillingPeriodItemKind, BillingRun, Invoice, NewBillingPeriodItem, Payment,
    Subscription, SubscriptionItem,
};
use super::proration::{prorated_unit_amount, split_around_date, ProrationSplit};
use super::subscriptions::validate_item;

/// When an item change takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentTiming {
    Immediately,
    AtEndOfCurrentBillingPeriod,
}

impl FromStr for AdjustmentTiming {
    type Err = BillingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "immediately" => Ok(AdjustmentTiming::Immediately),
            "at_end_of_current_billing_period" => Ok(AdjustmentTiming::AtEndOfCurrentBillingPeriod),
            _ => Err(BillingError::InvalidTiming(value.to_string())),
        }
    }
}

/// Desired item. Items carrying an `id` update the existing item; items
/// without one are new.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ItemInput {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    pub quantity: i32,
    pub unit_price: i64,
}

#[derive(Debug, Clone)]
pub struct AdjustmentRequest {
    pub items: Vec<ItemInput>,
    pub timing: AdjustmentTiming,
    pub prorate_current_billing_period: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdjustmentOutcome {
    pub subscription: Subscription,
    pub effective_date: DateTime<Utc>,
    pub items: Vec<SubscriptionItem>,
    pub proration: Option<ProrationSplit>,
    pub proration_items: Vec<BillingPeriodItem>,
    pub billing_run: Option<BillingRun>,
    pub invoice: Option<Invoice>,
    pub payment: Option<Payment>,
}

#[derive(Debug, Default)]
pub struct ItemDiff<'a> {
    pub removed: Vec<&'a SubscriptionItem>,
    pub kept: Vec<(&'a SubscriptionItem, &'a ItemInput)>,
    pub added: Vec<&'a ItemInput>,
}

/// Matches desired items against existing ones by id.
pub fn diff_items<'a>(
    existing: &'a [SubscriptionItem],
    desired: &'a [ItemInput],
) -> BillingResult<ItemDiff<'a>> {
    let by_id: HashMap<Uuid, &SubscriptionItem> =
        existing.iter().map(|item| (item.id, item)).collect();
    let mut diff = ItemDiff::default();
    let mut seen = Vec::new();

    for input in desired {
        match input.id {
            Some(id) => {
                let current = by_id.get(&id).ok_or_else(|| {
                    BillingError::InvalidSubscriptionItem(format!(
                        "item {id} does not belong to the subscription"
                    ))
                })?;
                if seen.contains(&id) {
                    return Err(BillingError::InvalidSubscriptionItem(format!(
                        "item {id} listed more than once"
                    )));
                }
                seen.push(id);
                diff.kept.push((*current, input));
            }
            None => diff.added.push(input),
        }
    }
    diff.removed = existing
        .iter()
        .filter(|item| !seen.contains(&item.id))
        .collect();

    Ok(diff)
}

/// Removed items that were actually being billed at `at`. Items whose
/// `added_date` is still ahead were never charged and earn no credit.
pub fn billed_removals<'a>(
    removed: &[&'a SubscriptionItem],
    at: DateTime<Utc>,
) -> Vec<&'a SubscriptionItem> {
    removed
        .iter()
        .copied()
        .filter(|item| item.is_active_at(at))
        .collect()
}

/// Signed charges covering the remainder of the period: credits for removed
/// items, charges for new ones. Rounded per unit.
pub fn proration_items(
    split: &ProrationSplit,
    removed: &[&SubscriptionItem],
    added: &[(SubscriptionItem, &ItemInput)],
) -> Vec<NewBillingPeriodItem> {
    let credits = removed.iter().map(|item| NewBillingPeriodItem {
        subscription_item_id: Some(item.id),
        kind: BillingPeriodItemKind::Proration,
        name: item.name.clone(),
        description: Some(format!("Unused time on {}", item.name)),
        quantity: item.quantity,
        unit_price: -prorated_unit_amount(item.unit_price, split.after_pct),
        discount_redemption_id: None,
    });
    let charges = added.iter().map(|(item, _)| NewBillingPeriodItem {
        subscription_item_id: Some(item.id),
        kind: BillingPeriodItemKind::Proration,
        name: item.name.clone(),
        description: Some(format!("Remaining time on {}", item.name)),
        quantity: item.quantity,
        unit_price: prorated_unit_amount(item.unit_price, split.after_pct),
        discount_redemption_id: None,
    });
    credits.chain(charges).collect()
}

/// key: item-adjuster -> apply item set changes with optional proration
pub async fn adjust_subscription(
    conn: &mut PgConnection,
    subscription_id: Uuid,
    request: &AdjustmentRequest,
    now: DateTime<Utc>,
) -> BillingResult<AdjustmentOutcome> {
    let subscription = subscriptions::lock_for_update(&mut *conn, subscription_id)
        .await?
        .ok_or_else(|| BillingError::not_found("subscription", subscription_id))?;
    if subscription.is_terminal() {
        return Err(BillingError::TerminalSubscription(subscription.id));
    }
    for item in &request.items {
        validate_item(&item.name, item.quantity, item.unit_price)?;
    }

    let effective_date = match request.timing {
        AdjustmentTiming::Immediately => now,
        AdjustmentTiming::AtEndOfCurrentBillingPeriod => subscription
            .current_billing_period_end
            .ok_or(BillingError::NoCurrentBillingPeriod(subscription.id))?,
    };

    let existing = subscription_items::list_unremoved(&mut *conn, subscription.id).await?;
    let diff = diff_items(&existing, &request.items)?;

    for item in &diff.removed {
        subscription_items::mark_removed(&mut *conn, item.id, effective_date).await?;
    }
    for (current, input) in &diff.kept {
        if current.name != input.name
            || current.quantity != input.quantity
            || current.unit_price != input.unit_price
        {
            subscription_items::update(
                &mut *conn,
                current.id,
                &input.name,
                input.quantity,
                input.unit_price,
            )
            .await?;
        }
    }
    let mut added = Vec::with_capacity(diff.added.len());
    for input in &diff.added {
        let item = subscription_items::insert(
            &mut *conn,
            subscription.id,
            &input.name,
            input.quantity,
            input.unit_price,
            effective_date,
        )
        .await?;
        added.push((item, *input));
    }

    info!(
        subscription_id = %subscription.id,
        timing = ?request.timing,
        %effective_date,
        removed = diff.removed.len(),
        kept = diff.kept.len(),
        added = added.len(),
        "adjusted subscription items"
    );

    let mut outcome = AdjustmentOutcome {
        subscription: subscription.clone(),
        effective_date,
        items: Vec::new(),
        proration: None,
        proration_items: Vec::new(),
        billing_run: None,
        invoice: None,
        payment: None,
    };

    if request.timing == AdjustmentTiming::Immediately && request.prorate_current_billing_period {
        let period = billing_periods::find_covering(&mut *conn, subscription.id, now)
            .await?
            .ok_or(BillingError::NoCurrentBillingPeriod(subscription.id))?;
        let split = split_around_date(effective_date, period.bounds())?;

        let credited = billed_removals(&diff.removed, effective_date);
        for item in proration_items(&split, &credited, &added) {
            outcome
                .proration_items
                .push(billing_period_items::insert(&mut *conn, period.id, &item).await?);
        }

        let payment_method_id = subscription
            .billing_payment_method_id()
            .ok_or(BillingError::NoPaymentMethod(subscription.id))?;
        let run = billing_runs::insert(
            &mut *conn,
            &NewBillingRun {
                billing_period_id: period.id,
                subscription_id: subscription.id,
                scheduled_for: now,
                payment_method_id,
                gateway_payment_intent_id: None,
                last_gateway_event_at: None,
            },
        )
        .await?;
        info!(
            subscription_id = %subscription.id,
            billing_period_id = %period.id,
            billing_run_id = %run.id,
            after_pct = split.after_pct,
            "prorated current billing period"
        );

        outcome.proration = Some(split);
        outcome.billing_run = Some(run);
    }

    outcome.items = subscription_items::list_unremoved(&mut *conn, subscription.id).await?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    use crate::billing::interval::PeriodBounds;

    fn existing(name: &str, quantity: i32, unit_price: i64) -> SubscriptionItem {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        SubscriptionItem {
            id: Uuid::new_v4(),
            subscription_id: Uuid::nil(),
            name: name.into(),
            quantity,
            unit_price,
            added_date: at,
            removed_date: None,
            created_at: at,
            updated_at: at,
        }
    }

    fn input(id: Option<Uuid>, name: &str, quantity: i32, unit_price: i64) -> ItemInput {
        ItemInput {
            id,
            name: name.into(),
            quantity,
            unit_price,
        }
    }

    #[test]
    fn timing_parses_known_values_only() {
        assert_eq!(
            "immediately".parse::<AdjustmentTiming>().unwrap(),
            AdjustmentTiming::Immediately
        );
        assert_eq!(
            "at-end-of-current-billing-period".parse::<AdjustmentTiming>().unwrap(),
            AdjustmentTiming::AtEndOfCurrentBillingPeriod
        );
        assert!(matches!(
            "next_tuesday".parse::<AdjustmentTiming>(),
            Err(BillingError::InvalidTiming(_))
        ));
    }

    #[test]
    fn diff_separates_removed_kept_and_added() {
        let items = vec![existing("basic", 2, 200), existing("support", 1, 50)];
        let desired = vec![
            input(Some(items[1].id), "support", 2, 50),
            input(None, "pro", 3, 300),
        ];

        let diff = diff_items(&items, &desired).unwrap();
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].name, "basic");
        assert_eq!(diff.kept.len(), 1);
        assert_eq!(diff.kept[0].1.quantity, 2);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].name, "pro");
    }

    #[test]
    fn unknown_or_duplicate_ids_are_rejected() {
        let items = vec![existing("basic", 1, 100)];
        let unknown = vec![input(Some(Uuid::new_v4()), "basic", 1, 100)];
        assert!(matches!(
            diff_items(&items, &unknown),
            Err(BillingError::InvalidSubscriptionItem(_))
        ));

        let duplicate = vec![
            input(Some(items[0].id), "basic", 1, 100),
            input(Some(items[0].id), "basic", 2, 100),
        ];
        assert!(diff_items(&items, &duplicate).is_err());
    }

    #[test]
    fn midpoint_swap_credits_and_charges_half_the_period() {
        let start = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        let bounds = PeriodBounds {
            start,
            end: start + Duration::days(30),
        };
        let split = split_around_date(start + Duration::days(15), bounds).unwrap();

        let removed = existing("basic", 2, 200);
        let new_input = input(None, "pro", 3, 300);
        let added = existing("pro", 3, 300);

        let items = proration_items(&split, &[&removed], &[(added, &new_input)]);
        let amounts: Vec<i64> = items.iter().map(NewBillingPeriodItem::amount).collect();
        assert_eq!(amounts, vec![-200, 450]);
        assert!(items
            .iter()
            .all(|item| item.kind == BillingPeriodItemKind::Proration));
    }

    #[test]
    fn odd_prices_round_to_whole_units() {
        let start = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        let bounds = PeriodBounds {
            start,
            end: start + Duration::days(3),
        };
        let split = split_around_date(start + Duration::days(1), bounds).unwrap();

        let removed = existing("basic", 1, 1001);
        let items = proration_items(&split, &[&removed], &[]);
        assert_eq!(items[0].unit_price, -667);
    }

    #[test]
    fn items_not_yet_billed_earn_no_credit() {
        let billed = existing("basic", 1, 400);
        let mut pending = existing("pro", 1, 900);
        pending.added_date = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        let now = Utc.with_ymd_and_hms(2024, 1, 16, 12, 0, 0).unwrap();
        let credited = billed_removals(&[&billed, &pending], now);

        assert_eq!(credited.len(), 1);
        assert_eq!(credited[0].id, billed.id);
    }
}
