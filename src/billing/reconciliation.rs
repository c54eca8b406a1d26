use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::PgConnection;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{billing_runs, invoices, payments, subscriptions};

use super::adapters::{GatewayPaymentStatus, Notification};
use super::error::{BillingError, BillingResult};
use super::models::{
    BillingPeriod, BillingRun, BillingRunStatus, Invoice, InvoiceStatus, Payment, Subscription,
    SubscriptionStatus,
};
use super::periods::{move_subscription, refresh_period_status};
use super::retry::{schedule_retry, RetrySchedule};
use super::service::BillingService;

/// Status change pushed by the payment gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEvent {
    #[serde(default)]
    pub id: Option<String>,
    pub subject_id: String,
    pub status: GatewayPaymentStatus,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl GatewayEvent {
    pub fn billing_run_id(&self) -> BillingResult<Uuid> {
        self.metadata
            .get("billing_run_id")
            .and_then(Value::as_str)
            .and_then(|value| Uuid::parse_str(value).ok())
            .ok_or(BillingError::MissingEventMetadata("billing_run_id"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDisposition {
    Applied,
    Stale,
    Ignored,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reconciliation {
    pub disposition: EventDisposition,
    pub billing_run: BillingRun,
    pub invoice: Option<Invoice>,
    pub payment: Option<Payment>,
    pub period: Option<BillingPeriod>,
    pub subscription: Option<Subscription>,
    pub retry_run: Option<BillingRun>,
    #[serde(skip)]
    pub notifications: Vec<Notification>,
}

impl Reconciliation {
    fn unchanged(disposition: EventDisposition, billing_run: BillingRun) -> Self {
        Self {
            disposition,
            billing_run,
            invoice: None,
            payment: None,
            period: None,
            subscription: None,
            retry_run: None,
            notifications: Vec::new(),
        }
    }
}

/// key: payment-event-reconciler -> apply gateway events idempotently
pub async fn process_gateway_event(
    conn: &mut PgConnection,
    event: &GatewayEvent,
    now: DateTime<Utc>,
    retry_schedule: &RetrySchedule,
) -> BillingResult<Reconciliation> {
    let run_id = event.billing_run_id()?;
    let run = billing_runs::lock_for_update(&mut *conn, run_id)
        .await?
        .ok_or_else(|| BillingError::not_found("billing run", run_id))?;

    if run.gateway_payment_intent_id.as_deref() != Some(event.subject_id.as_str()) {
        return Err(BillingError::MismatchedPaymentIntent {
            run_id: run.id,
            expected: run.gateway_payment_intent_id.clone(),
            received: event.subject_id.clone(),
        });
    }
    if !run.accepts_event_at(event.created) {
        debug!(
            billing_run_id = %run.id,
            event_created = %event.created,
            last_event_at = ?run.last_gateway_event_at,
            "ignoring stale gateway event"
        );
        return Ok(Reconciliation::unchanged(EventDisposition::Stale, run));
    }

    apply_gateway_status(
        conn,
        run,
        event.status,
        &event.subject_id,
        Some(event.created),
        now,
        retry_schedule,
    )
    .await
}

/// Moves a run and its invoice, payment, period and subscription to match a
/// gateway status. Webhook events carry `occurred_at` and go through the
/// out-of-order guard; the synchronous charge result has none and is applied
/// with a version compare-and-set, leaving `last_gateway_event_at` untouched.
pub async fn apply_gateway_status(
    conn: &mut PgConnection,
    run: BillingRun,
    status: GatewayPaymentStatus,
    charge_id: &str,
    occurred_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    retry_schedule: &RetrySchedule,
) -> BillingResult<Reconciliation> {
    let next = status.run_status();
    if !run.status.can_transition_to(next) {
        warn!(
            billing_run_id = %run.id,
            from = %run.status,
            to = %next,
            "gateway status does not apply to billing run"
        );
        let run = match occurred_at {
            Some(occurred_at) => billing_runs::touch_gateway_event(&mut *conn, run.id, occurred_at)
                .await?
                .unwrap_or(run),
            None => run,
        };
        return Ok(Reconciliation::unchanged(EventDisposition::Ignored, run));
    }

    let run = match occurred_at {
        Some(occurred_at) => {
            let Some(applied) =
                billing_runs::apply_gateway_event(&mut *conn, run.id, next, occurred_at).await?
            else {
                return Ok(Reconciliation::unchanged(EventDisposition::Stale, run));
            };
            applied
        }
        None => billing_runs::transition(&mut *conn, run.id, run.version, next, None)
            .await?
            .ok_or(BillingError::ConcurrentModification(run.id))?,
    };
    info!(
        billing_run_id = %run.id,
        status = %run.status,
        gateway_status = ?status,
        "applied gateway status to billing run"
    );

    let payment = match payments::latest_for_run(&mut *conn, run.id).await? {
        Some(payment) => Some(
            payments::set_status(
                &mut *conn,
                payment.id,
                status.payment_status(),
                Some(charge_id),
            )
            .await?,
        ),
        None => None,
    };

    let invoice = invoices::get_for_period(&mut *conn, run.billing_period_id)
        .await?
        .ok_or(BillingError::MissingInvoice(run.billing_period_id))?;
    let invoice = match InvoiceStatus::for_run_status(next) {
        Some(target) if invoice.status != target && invoice.status.can_transition_to(target) => {
            invoices::set_status(&mut *conn, invoice.id, target).await?
        }
        _ => invoice,
    };

    let payment_failed = matches!(next, BillingRunStatus::Failed | BillingRunStatus::Aborted);
    let period = refresh_period_status(conn, run.billing_period_id, now, payment_failed).await?;

    let mut reconciliation = Reconciliation {
        disposition: EventDisposition::Applied,
        billing_run: run.clone(),
        invoice: Some(invoice),
        payment,
        period: Some(period),
        subscription: None,
        retry_run: None,
        notifications: Vec::new(),
    };

    match next {
        BillingRunStatus::Succeeded => {
            let subscription = lock_subscription(conn, run.subscription_id).await?;
            let subscription = if matches!(
                subscription.status,
                SubscriptionStatus::PastDue | SubscriptionStatus::Incomplete
            ) {
                move_subscription(conn, &subscription, SubscriptionStatus::Active).await?
            } else {
                subscription
            };
            reconciliation.notifications.push(Notification::PaymentSucceeded {
                subscription_id: subscription.id,
                billing_run_id: run.id,
                invoice_id: reconciliation.invoice.as_ref().map(|invoice| invoice.id),
                amount: reconciliation
                    .payment
                    .as_ref()
                    .map_or(0, |payment| payment.amount),
            });
            reconciliation.subscription = Some(subscription);
        }
        BillingRunStatus::Failed => {
            let retry_run = schedule_retry(conn, &run, now, retry_schedule).await?;
            let subscription = mark_past_due(conn, run.subscription_id).await?;
            reconciliation.notifications.push(Notification::PaymentFailed {
                subscription_id: subscription.id,
                billing_run_id: run.id,
                retry_at: retry_run.as_ref().map(|retry| retry.scheduled_for),
            });
            reconciliation.subscription = Some(subscription);
            reconciliation.retry_run = retry_run;
        }
        BillingRunStatus::Aborted => {
            reconciliation.subscription = Some(mark_past_due(conn, run.subscription_id).await?);
        }
        BillingRunStatus::AwaitingPaymentConfirmation => {
            reconciliation
                .notifications
                .push(Notification::AwaitingConfirmation {
                    subscription_id: run.subscription_id,
                    billing_run_id: run.id,
                });
        }
        BillingRunStatus::Scheduled | BillingRunStatus::InProgress | BillingRunStatus::Abandoned => {}
    }

    Ok(reconciliation)
}

async fn lock_subscription(conn: &mut PgConnection, subscription_id: Uuid) -> BillingResult<Subscription> {
    subscriptions::lock_for_update(&mut *conn, subscription_id)
        .await?
        .ok_or_else(|| BillingError::not_found("subscription", subscription_id))
}

async fn mark_past_due(conn: &mut PgConnection, subscription_id: Uuid) -> BillingResult<Subscription> {
    let subscription = lock_subscription(conn, subscription_id).await?;
    if subscription.status.can_transition_to(SubscriptionStatus::PastDue) {
        move_subscription(conn, &subscription, SubscriptionStatus::PastDue).await
    } else {
        Ok(subscription)
    }
}

/// key: billing-reconciliation -> background worker for gateway callbacks
#[derive(Debug)]
pub enum ReconciliationJob {
    GatewayEvent(GatewayEvent),
}

/// key: billing-reconciliation-handle -> enqueue interface
#[derive(Clone)]
pub struct ReconciliationHandle {
    sender: Sender<ReconciliationJob>,
}

impl ReconciliationHandle {
    /// Handle plus the receiving end the worker drains.
    pub fn channel(capacity: usize) -> (Self, Receiver<ReconciliationJob>) {
        let (sender, receiver) = channel(capacity);
        (Self { sender }, receiver)
    }

    pub async fn dispatch(&self, job: ReconciliationJob) -> Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|err| anyhow!("failed to enqueue billing reconciliation job: {err}"))
    }
}

pub fn start_reconciliation_worker(service: BillingService) -> ReconciliationHandle {
    let (handle, mut rx) = ReconciliationHandle::channel(64);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                ReconciliationJob::GatewayEvent(event) => {
                    match service.process_gateway_event(&event).await {
                        Ok(outcome) => info!(
                            event_id = ?event.id,
                            subject_id = %event.subject_id,
                            disposition = ?outcome.disposition,
                            run_status = %outcome.billing_run.status,
                            "reconciled gateway event"
                        ),
                        Err(err) => error!(
                            ?err,
                            event_id = ?event.id,
                            subject_id = %event.subject_id,
                            "failed to reconcile gateway event",
                        ),
                    }
                }
            }
        }
    });

    handle
}
