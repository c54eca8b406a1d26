use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use recurring_billing::billing::models::{
    BillingPeriodItemKind, BillingPeriodStatus, BillingRunStatus, IntervalUnit, InvoiceStatus,
    PaymentMethodKind, SubscriptionStatus,
};
use recurring_billing::billing::{
    AdjustmentRequest, AdjustmentTiming, BillingError, BillingService, ChargeRequest, Clock,
    ChargeResult, CreateSubscription, FixedClock, GatewayError, GatewayPaymentStatus, ItemInput,
    NewItem, PaymentGateway,
};
use recurring_billing::db::{billing_period_items, billing_periods, customers};
use sqlx::PgPool;
use uuid::Uuid;

struct RecordingGateway {
    status: GatewayPaymentStatus,
    clock: Arc<FixedClock>,
    charges: Mutex<Vec<ChargeRequest>>,
}

#[async_trait]
impl PaymentGateway for RecordingGateway {
    async fn create_and_confirm_charge(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeResult, GatewayError> {
        self.charges.lock().unwrap().push(request.clone());
        Ok(ChargeResult {
            id: format!("pi_{}", request.idempotency_key.simple()),
            status: self.status,
            created: self.clock.now(),
        })
    }
}

fn jan_first() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

struct Fixture {
    service: BillingService,
    clock: Arc<FixedClock>,
    gateway: Arc<RecordingGateway>,
    customer_id: Uuid,
    payment_method_id: Uuid,
}

async fn fixture(pool: &PgPool) -> Fixture {
    sqlx::migrate!("./migrations").run(pool).await.unwrap();

    let organization = customers::insert_organization(pool, "Acme Billing", 0, "usd")
        .await
        .unwrap();
    let customer =
        customers::insert_customer(pool, organization.id, "buyer@example.com", Some("cus_1"))
            .await
            .unwrap();
    let payment_method =
        customers::insert_payment_method(pool, customer.id, PaymentMethodKind::Card, Some("pm_1"))
            .await
            .unwrap();

    let clock = Arc::new(FixedClock::new(jan_first()));
    let gateway = Arc::new(RecordingGateway {
        status: GatewayPaymentStatus::Succeeded,
        clock: clock.clone(),
        charges: Mutex::new(Vec::new()),
    });
    let service = BillingService::new(pool.clone(), gateway.clone()).with_clock(clock.clone());

    Fixture {
        service,
        clock,
        gateway,
        customer_id: customer.id,
        payment_method_id: payment_method.id,
    }
}

fn monthly(customer_id: Uuid, payment_method_id: Option<Uuid>, items: Vec<NewItem>) -> CreateSubscription {
    CreateSubscription {
        customer_id,
        items,
        interval_unit: IntervalUnit::Month,
        interval_count: 1,
        billing_cycle_anchor: None,
        trial_end: None,
        default_payment_method_id: payment_method_id,
        backup_payment_method_id: None,
        currency: None,
    }
}

fn item(name: &str, quantity: i32, unit_price: i64) -> NewItem {
    NewItem {
        name: name.to_string(),
        quantity,
        unit_price,
    }
}

// key: billing-tests -> creation opens the first period and schedules a run
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn creating_a_subscription_opens_first_period(pool: PgPool) {
    let fx = fixture(&pool).await;

    let details = fx
        .service
        .create_subscription(&monthly(
            fx.customer_id,
            Some(fx.payment_method_id),
            vec![item("Seat", 1, 1000)],
        ))
        .await
        .unwrap();

    assert_eq!(details.subscription.status, SubscriptionStatus::Active);
    assert_eq!(details.subscription.current_billing_period_start, Some(jan_first()));
    assert_eq!(
        details.subscription.current_billing_period_end,
        Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap())
    );

    let periods = billing_periods::list_for_subscription(&pool, details.subscription.id)
        .await
        .unwrap();
    assert_eq!(periods.len(), 1);
    let items = billing_period_items::list_for_period(&pool, periods[0].id)
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].amount(), 1000);

    let run = details.billing_run.expect("first run scheduled");
    assert_eq!(run.status, BillingRunStatus::Scheduled);
    assert_eq!(run.scheduled_for, jan_first());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn trial_subscriptions_start_trialing_without_a_run(pool: PgPool) {
    let fx = fixture(&pool).await;
    let trial_end = jan_first() + Duration::days(14);

    let mut input = monthly(
        fx.customer_id,
        Some(fx.payment_method_id),
        vec![item("Seat", 1, 1000)],
    );
    input.trial_end = Some(trial_end);
    let details = fx.service.create_subscription(&input).await.unwrap();

    assert_eq!(details.subscription.status, SubscriptionStatus::Trialing);
    assert_eq!(details.subscription.current_billing_period_end, Some(trial_end));
    assert!(details.billing_run.is_none());
    let period = details.current_period.expect("trial period");
    assert!(period.trial_period);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn second_live_subscription_is_rejected(pool: PgPool) {
    let fx = fixture(&pool).await;
    let input = monthly(
        fx.customer_id,
        Some(fx.payment_method_id),
        vec![item("Seat", 1, 1000)],
    );
    fx.service.create_subscription(&input).await.unwrap();

    let err = fx.service.create_subscription(&input).await.unwrap_err();
    assert!(matches!(err, BillingError::ActiveSubscriptionExists(_)));
}

// key: billing-tests -> immediate proration at the period midpoint
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn immediate_adjustment_prorates_the_current_period(pool: PgPool) {
    let fx = fixture(&pool).await;
    let details = fx
        .service
        .create_subscription(&monthly(
            fx.customer_id,
            Some(fx.payment_method_id),
            vec![item("Basic seat", 2, 200)],
        ))
        .await
        .unwrap();
    let subscription_id = details.subscription.id;

    // January has 31 days so the midpoint falls at noon on the 16th.
    fx.clock
        .set(Utc.with_ymd_and_hms(2024, 1, 16, 12, 0, 0).unwrap());
    let outcome = fx
        .service
        .adjust_subscription(
            subscription_id,
            &AdjustmentRequest {
                items: vec![ItemInput {
                    id: None,
                    name: "Pro seat".to_string(),
                    quantity: 3,
                    unit_price: 300,
                }],
                timing: AdjustmentTiming::Immediately,
                prorate_current_billing_period: true,
            },
        )
        .await
        .unwrap();

    let split = outcome.proration.expect("proration split");
    assert!((split.after_pct - 0.5).abs() < 1e-9);

    let amounts: Vec<i64> = outcome.proration_items.iter().map(|item| item.amount()).collect();
    assert_eq!(amounts, vec![-200, 450]);
    assert!(outcome
        .proration_items
        .iter()
        .all(|item| item.kind == BillingPeriodItemKind::Proration));
    let run = outcome.billing_run.expect("proration run");
    assert_eq!(run.status, BillingRunStatus::Succeeded);
    let payment = outcome.payment.expect("proration payment");
    assert_eq!(payment.amount, 400 - 200 + 450);
    assert_eq!(outcome.invoice.expect("invoice").status, InvoiceStatus::Paid);
    assert_eq!(fx.gateway.charges.lock().unwrap().len(), 1);

    let current = fx.service.get_subscription(subscription_id).await.unwrap();
    assert_eq!(current.items.len(), 1);
    assert_eq!(current.items[0].name, "Pro seat");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn adjusting_at_period_end_defers_item_changes(pool: PgPool) {
    let fx = fixture(&pool).await;
    let details = fx
        .service
        .create_subscription(&monthly(
            fx.customer_id,
            Some(fx.payment_method_id),
            vec![item("Basic seat", 1, 500)],
        ))
        .await
        .unwrap();

    let outcome = fx
        .service
        .adjust_subscription(
            details.subscription.id,
            &AdjustmentRequest {
                items: vec![],
                timing: AdjustmentTiming::AtEndOfCurrentBillingPeriod,
                prorate_current_billing_period: true,
            },
        )
        .await
        .unwrap();

    assert_eq!(
        outcome.effective_date,
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    );
    assert!(outcome.proration.is_none());
    assert!(outcome.billing_run.is_none());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn canceled_subscriptions_reject_adjustments(pool: PgPool) {
    let fx = fixture(&pool).await;
    let details = fx
        .service
        .create_subscription(&monthly(
            fx.customer_id,
            Some(fx.payment_method_id),
            vec![item("Seat", 1, 1000)],
        ))
        .await
        .unwrap();
    sqlx::query("UPDATE subscriptions SET status = 'canceled', canceled_at = NOW() WHERE id = $1")
        .bind(details.subscription.id)
        .execute(&pool)
        .await
        .unwrap();

    let err = fx
        .service
        .adjust_subscription(
            details.subscription.id,
            &AdjustmentRequest {
                items: vec![],
                timing: AdjustmentTiming::Immediately,
                prorate_current_billing_period: false,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::TerminalSubscription(_)));
}

// key: billing-tests -> rollover creates exactly one next period
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn transitioning_twice_creates_one_next_period(pool: PgPool) {
    let fx = fixture(&pool).await;
    let details = fx
        .service
        .create_subscription(&monthly(
            fx.customer_id,
            Some(fx.payment_method_id),
            vec![item("Seat", 1, 1000)],
        ))
        .await
        .unwrap();
    let first_period = details.current_period.expect("first period");

    let early = fx
        .service
        .transition_subscription_billing_period(first_period.id)
        .await
        .unwrap_err();
    assert!(matches!(early, BillingError::PeriodNotYetEnded { .. }));

    fx.clock
        .set(Utc.with_ymd_and_hms(2024, 2, 1, 1, 0, 0).unwrap());
    let first = fx
        .service
        .transition_subscription_billing_period(first_period.id)
        .await
        .unwrap();
    let next = first.next_period.expect("next period");
    assert_eq!(next.start_date, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
    assert_eq!(next.end_date, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
    assert_eq!(next.status, BillingPeriodStatus::Active);
    assert_eq!(first.closed_period.status, BillingPeriodStatus::PastDue);
    assert!(first.billing_run.is_some());
    assert_eq!(
        first.subscription.current_billing_period_start,
        Some(next.start_date)
    );

    let second = fx
        .service
        .transition_subscription_billing_period(first_period.id)
        .await
        .unwrap();
    assert!(second.next_period.is_none());
    assert!(second.billing_run.is_none());

    let periods = billing_periods::list_for_subscription(&pool, details.subscription.id)
        .await
        .unwrap();
    assert_eq!(periods.len(), 2);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn scheduled_cancellation_ends_the_subscription_at_rollover(pool: PgPool) {
    let fx = fixture(&pool).await;
    let details = fx
        .service
        .create_subscription(&monthly(
            fx.customer_id,
            Some(fx.payment_method_id),
            vec![item("Seat", 1, 1000)],
        ))
        .await
        .unwrap();
    sqlx::query("UPDATE subscriptions SET cancel_scheduled_at = $2 WHERE id = $1")
        .bind(details.subscription.id)
        .bind(Utc.with_ymd_and_hms(2024, 1, 20, 0, 0, 0).unwrap())
        .execute(&pool)
        .await
        .unwrap();

    fx.clock
        .set(Utc.with_ymd_and_hms(2024, 2, 1, 1, 0, 0).unwrap());
    let transition = fx
        .service
        .transition_subscription_billing_period(details.current_period.unwrap().id)
        .await
        .unwrap();

    assert_eq!(transition.subscription.status, SubscriptionStatus::Canceled);
    assert!(transition.next_period.is_none());
    assert!(fx.gateway.charges.lock().unwrap().is_empty());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn cancellation_after_the_next_period_declines_renewal(pool: PgPool) {
    let fx = fixture(&pool).await;
    let details = fx
        .service
        .create_subscription(&monthly(
            fx.customer_id,
            Some(fx.payment_method_id),
            vec![item("Seat", 1, 1000)],
        ))
        .await
        .unwrap();
    sqlx::query("UPDATE subscriptions SET cancel_scheduled_at = $2 WHERE id = $1")
        .bind(details.subscription.id)
        .bind(Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap())
        .execute(&pool)
        .await
        .unwrap();

    fx.clock
        .set(Utc.with_ymd_and_hms(2024, 2, 1, 1, 0, 0).unwrap());
    let transition = fx
        .service
        .transition_subscription_billing_period(details.current_period.unwrap().id)
        .await
        .unwrap();

    assert!(transition.next_period.is_none());
    assert!(transition.billing_run.is_none());
    assert_eq!(transition.subscription.status, SubscriptionStatus::PastDue);
    let periods = billing_periods::list_for_subscription(&pool, details.subscription.id)
        .await
        .unwrap();
    assert_eq!(periods.len(), 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn rollover_without_a_payment_method_marks_past_due(pool: PgPool) {
    let fx = fixture(&pool).await;
    let details = fx
        .service
        .create_subscription(&monthly(fx.customer_id, None, vec![item("Seat", 1, 1000)]))
        .await
        .unwrap();
    assert_eq!(details.subscription.status, SubscriptionStatus::Incomplete);
    assert!(details.billing_run.is_none());

    fx.clock
        .set(Utc.with_ymd_and_hms(2024, 2, 1, 1, 0, 0).unwrap());
    let transition = fx
        .service
        .transition_subscription_billing_period(details.current_period.unwrap().id)
        .await
        .unwrap();

    let next = transition.next_period.expect("next period");
    assert_eq!(next.start_date, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
    assert!(transition.billing_run.is_none());
    assert_eq!(transition.subscription.status, SubscriptionStatus::PastDue);
    assert_eq!(
        transition.subscription.current_billing_period_start,
        Some(next.start_date)
    );
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn trial_rolls_into_a_paid_period_anchored_at_trial_end(pool: PgPool) {
    let fx = fixture(&pool).await;
    let trial_end = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
    let mut input = monthly(
        fx.customer_id,
        Some(fx.payment_method_id),
        vec![item("Seat", 1, 1000)],
    );
    input.trial_end = Some(trial_end);
    let details = fx.service.create_subscription(&input).await.unwrap();
    assert_eq!(details.subscription.billing_cycle_anchor, trial_end);

    fx.clock
        .set(Utc.with_ymd_and_hms(2024, 1, 15, 1, 0, 0).unwrap());
    let transition = fx
        .service
        .transition_subscription_billing_period(details.current_period.unwrap().id)
        .await
        .unwrap();

    assert_eq!(transition.closed_period.status, BillingPeriodStatus::Completed);
    let next = transition.next_period.expect("first paid period");
    assert!(!next.trial_period);
    assert_eq!(next.start_date, trial_end);
    assert_eq!(next.end_date, Utc.with_ymd_and_hms(2024, 2, 15, 0, 0, 0).unwrap());
    let items = billing_period_items::list_for_period(&pool, next.id)
        .await
        .unwrap();
    assert_eq!(items.iter().map(|item| item.amount()).sum::<i64>(), 1000);

    let run = transition.billing_run.expect("paid period run");
    assert_eq!(run.scheduled_for, trial_end);
    assert_eq!(transition.subscription.status, SubscriptionStatus::Active);
}
