use std::sync::Arc;

use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db;

use super::adapters::{
    BillingNotifier, FeeCalculator, LoggingNotifier, Notification, PaymentGateway,
    StandardFeeCalculator,
};
use super::adjustments::{self, AdjustmentOutcome, AdjustmentRequest};
use super::clock::{Clock, SystemClock};
use super::error::BillingResult;
use super::executor::{self, ExecutionContext, RunExecution};
use super::periods::{self, PeriodTransition};
use super::reconciliation::{self, GatewayEvent, Reconciliation};
use super::retry::RetrySchedule;
use super::subscriptions::{self, CreateSubscription, SubscriptionDetails};

/// key: billing-service -> transaction owning entry points
#[derive(Clone)]
pub struct BillingService {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    gateway: Arc<dyn PaymentGateway>,
    fees: Arc<dyn FeeCalculator>,
    notifier: Arc<dyn BillingNotifier>,
    retry_schedule: RetrySchedule,
    default_currency: String,
}

impl BillingService {
    pub fn new(pool: PgPool, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
            gateway,
            fees: Arc::new(StandardFeeCalculator::default()),
            notifier: Arc::new(LoggingNotifier),
            retry_schedule: RetrySchedule::default(),
            default_currency: "usd".to_string(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_fee_calculator(mut self, fees: Arc<dyn FeeCalculator>) -> Self {
        self.fees = fees;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn BillingNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_retry_schedule(mut self, retry_schedule: RetrySchedule) -> Self {
        self.retry_schedule = retry_schedule;
        self
    }

    pub fn with_default_currency(mut self, currency: impl Into<String>) -> Self {
        self.default_currency = currency.into();
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub async fn create_subscription(
        &self,
        input: &CreateSubscription,
    ) -> BillingResult<SubscriptionDetails> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let details =
            subscriptions::create_subscription(&mut *tx, input, &self.default_currency, now).await?;
        tx.commit().await?;
        Ok(details)
    }

    pub async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<SubscriptionDetails> {
        let mut conn = self.pool.acquire().await?;
        subscriptions::get_subscription(&mut *conn, subscription_id).await
    }

    pub async fn adjust_subscription(
        &self,
        subscription_id: Uuid,
        request: &AdjustmentRequest,
    ) -> BillingResult<AdjustmentOutcome> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let mut outcome =
            adjustments::adjust_subscription(&mut *tx, subscription_id, request, now).await?;
        tx.commit().await?;

        let Some(run_id) = outcome.billing_run.as_ref().map(|run| run.id) else {
            return Ok(outcome);
        };
        match self.execute_billing_run(run_id).await {
            Ok(execution) => {
                outcome.billing_run = Some(execution.billing_run);
                outcome.invoice = execution.invoice;
                outcome.payment = execution.payment;
                if let Some(subscription) = db::subscriptions::get(&self.pool, subscription_id).await? {
                    outcome.subscription = subscription;
                }
            }
            Err(err) => warn!(
                ?err,
                billing_run_id = %run_id,
                "immediate proration run left scheduled for the next scheduler tick"
            ),
        }
        Ok(outcome)
    }

    pub async fn transition_subscription_billing_period(
        &self,
        period_id: Uuid,
    ) -> BillingResult<PeriodTransition> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let transition =
            periods::transition_subscription_billing_period(&mut *tx, period_id, now).await?;
        tx.commit().await?;
        Ok(transition)
    }

    pub async fn execute_billing_run(&self, run_id: Uuid) -> BillingResult<RunExecution> {
        let ctx = ExecutionContext {
            gateway: self.gateway.as_ref(),
            fees: self.fees.as_ref(),
            retry_schedule: &self.retry_schedule,
            now: self.clock.now(),
        };
        let mut tx = self.pool.begin().await?;
        let mut execution = executor::execute_billing_run(&mut *tx, run_id, &ctx).await?;
        tx.commit().await?;

        self.dispatch_notifications(std::mem::take(&mut execution.notifications));
        Ok(execution)
    }

    pub async fn process_gateway_event(&self, event: &GatewayEvent) -> BillingResult<Reconciliation> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let mut outcome =
            reconciliation::process_gateway_event(&mut *tx, event, now, &self.retry_schedule)
                .await?;
        tx.commit().await?;

        self.dispatch_notifications(std::mem::take(&mut outcome.notifications));
        Ok(outcome)
    }

    fn dispatch_notifications(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        debug!(count = notifications.len(), "dispatching billing notifications");
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            for notification in notifications {
                notifier.notify(notification).await;
            }
        });
    }
}
