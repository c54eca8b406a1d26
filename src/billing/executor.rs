use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::PgConnection;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{
    billing_period_items, billing_periods, billing_runs, customers, invoices,
    invoices::NewInvoice,
    payments::{self, NewPayment},
    subscriptions,
};

use super::adapters::{
    ChargeRequest, FeeBreakdown, FeeCalculator, GatewayError, Notification, PaymentGateway,
};
use super::error::{BillingError, BillingResult};
use super::models::{
    BillingPeriod, BillingPeriodStatus, BillingRun, BillingRunStatus, Invoice, InvoiceStatus,
    Payment, PaymentStatus, Subscription, SubscriptionStatus,
};
use super::periods::{move_period, move_subscription, refresh_period_status};
use super::reconciliation::{apply_gateway_status, EventDisposition};
use super::retry::RetrySchedule;

/// Collaborators the executor drives.
pub struct ExecutionContext<'a> {
    pub gateway: &'a dyn PaymentGateway,
    pub fees: &'a dyn FeeCalculator,
    pub retry_schedule: &'a RetrySchedule,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunExecution {
    pub billing_run: BillingRun,
    pub executed: bool,
    pub amount_charged: i64,
    pub fees: Option<FeeBreakdown>,
    pub invoice: Option<Invoice>,
    pub payment: Option<Payment>,
    pub period: Option<BillingPeriod>,
    pub retry_run: Option<BillingRun>,
    #[serde(skip)]
    pub notifications: Vec<Notification>,
}

impl RunExecution {
    fn skipped(billing_run: BillingRun) -> Self {
        Self {
            billing_run,
            executed: false,
            amount_charged: 0,
            fees: None,
            invoice: None,
            payment: None,
            period: None,
            retry_run: None,
            notifications: Vec::new(),
        }
    }
}

/// key: billing-run-executor -> collect the balance of a period
pub async fn execute_billing_run(
    conn: &mut PgConnection,
    run_id: Uuid,
    ctx: &ExecutionContext<'_>,
) -> BillingResult<RunExecution> {
    let run = billing_runs::lock_for_update(&mut *conn, run_id)
        .await?
        .ok_or_else(|| BillingError::not_found("billing run", run_id))?;
    if run.status != BillingRunStatus::Scheduled {
        debug!(billing_run_id = %run.id, status = %run.status, "billing run already executed");
        return Ok(RunExecution::skipped(run));
    }

    let period = billing_periods::get(&mut *conn, run.billing_period_id)
        .await?
        .ok_or_else(|| BillingError::not_found("billing period", run.billing_period_id))?;
    let subscription = subscriptions::get(&mut *conn, run.subscription_id)
        .await?
        .ok_or_else(|| BillingError::not_found("subscription", run.subscription_id))?;
    let customer = customers::get_customer(&mut *conn, subscription.customer_id)
        .await?
        .ok_or_else(|| BillingError::not_found("customer", subscription.customer_id))?;
    let organization = customers::get_organization(&mut *conn, subscription.organization_id)
        .await?
        .ok_or_else(|| BillingError::not_found("organization", subscription.organization_id))?;
    let payment_method = customers::get_payment_method(&mut *conn, run.payment_method_id)
        .await?
        .ok_or_else(|| BillingError::not_found("payment method", run.payment_method_id))?;

    let items = billing_period_items::list_for_period(&mut *conn, period.id).await?;
    let fees = ctx.fees.compute_due(&items, &organization, &payment_method);
    let settled = payments::settled_for_period(&mut *conn, period.id).await?;
    let amount = (fees.total_due - settled).max(0);

    let mut invoice = ensure_invoice(conn, &period, &subscription).await?;
    if !invoice.status.is_terminal() {
        invoices::clear_line_items(&mut *conn, invoice.id).await?;
        for item in &items {
            invoices::insert_line_item(&mut *conn, invoice.id, item).await?;
        }
        invoice = invoices::set_totals(
            &mut *conn,
            invoice.id,
            fees.subtotal,
            fees.total_due,
            &json!(fees),
        )
        .await?;
    }

    let mut execution = RunExecution {
        fees: Some(fees),
        ..RunExecution::skipped(run.clone())
    };
    execution.executed = true;

    if invoice.status.is_terminal() {
        let run = transition_run(conn, &run, BillingRunStatus::Succeeded, None).await?;
        let period = if invoice.status == InvoiceStatus::Uncollectible {
            let past_due = if period.status.can_transition_to(BillingPeriodStatus::PastDue) {
                move_period(conn, &period, BillingPeriodStatus::PastDue).await?
            } else {
                period
            };
            Some(past_due)
        } else {
            Some(refresh_period_status(conn, period.id, ctx.now, false).await?)
        };
        info!(
            billing_run_id = %run.id,
            invoice_id = %invoice.id,
            invoice_status = %invoice.status,
            "invoice already settled; billing run short-circuited"
        );
        execution.billing_run = run;
        execution.invoice = Some(invoice);
        execution.period = period;
        return Ok(execution);
    }

    if amount <= 0 {
        let invoice = invoices::set_status(&mut *conn, invoice.id, InvoiceStatus::Paid).await?;
        let run = transition_run(conn, &run, BillingRunStatus::Succeeded, None).await?;
        let period = refresh_period_status(conn, period.id, ctx.now, false).await?;
        info!(
            billing_run_id = %run.id,
            invoice_id = %invoice.id,
            "nothing due; billing run succeeded without a charge"
        );
        execution.billing_run = run;
        execution.invoice = Some(invoice);
        execution.period = Some(period);
        return Ok(execution);
    }

    let payment = payments::insert(
        &mut *conn,
        &NewPayment {
            invoice_id: invoice.id,
            billing_period_id: period.id,
            billing_run_id: run.id,
            customer_id: customer.id,
            organization_id: organization.id,
            amount,
            currency: &invoice.currency,
            status: PaymentStatus::Processing,
        },
    )
    .await?;
    let run = transition_run(
        conn,
        &run,
        BillingRunStatus::AwaitingPaymentConfirmation,
        None,
    )
    .await?;
    let invoice = invoices::set_status(
        &mut *conn,
        invoice.id,
        InvoiceStatus::AwaitingPaymentConfirmation,
    )
    .await?;

    let mut metadata = BTreeMap::new();
    metadata.insert("billing_run_id".to_string(), run.id.to_string());
    metadata.insert("billing_period_id".to_string(), period.id.to_string());
    metadata.insert("subscription_id".to_string(), subscription.id.to_string());
    let request = ChargeRequest {
        idempotency_key: run.id,
        amount,
        currency: invoice.currency.clone(),
        customer_ref: customer.gateway_customer_ref.clone(),
        payment_method_ref: payment_method.gateway_payment_method_ref.clone(),
        metadata,
    };
    info!(
        billing_run_id = %run.id,
        subscription_id = %subscription.id,
        amount,
        currency = %request.currency,
        "charging payment method"
    );

    let charge = match ctx.gateway.create_and_confirm_charge(&request).await {
        Ok(charge) if charge.id.trim().is_empty() => {
            let err = BillingError::MissingGatewayCharge(run.id);
            let details = json!({ "kind": "missing_charge", "message": err.to_string() });
            return fail_run(conn, execution, run, payment, invoice, &subscription, details, ctx).await;
        }
        Ok(charge) => charge,
        Err(err) => {
            let details = gateway_error_details(&err, amount);
            return fail_run(conn, execution, run, payment, invoice, &subscription, details, ctx).await;
        }
    };

    let run = billing_runs::attach_payment_intent(&mut *conn, run.id, run.version, &charge.id)
        .await?
        .ok_or(BillingError::ConcurrentModification(run.id))?;
    let reconciled = apply_gateway_status(
        conn,
        run,
        charge.status,
        &charge.id,
        None,
        ctx.now,
        ctx.retry_schedule,
    )
    .await?;
    if reconciled.disposition != EventDisposition::Applied {
        warn!(
            billing_run_id = %reconciled.billing_run.id,
            disposition = ?reconciled.disposition,
            "charge result was not applied to billing run"
        );
    }

    execution.amount_charged = amount;
    execution.billing_run = reconciled.billing_run;
    execution.invoice = reconciled.invoice.or(Some(invoice));
    execution.payment = reconciled.payment.or(Some(payment));
    execution.period = reconciled.period;
    execution.retry_run = reconciled.retry_run;
    execution.notifications = reconciled.notifications;
    Ok(execution)
}

async fn ensure_invoice(
    conn: &mut PgConnection,
    period: &BillingPeriod,
    subscription: &Subscription,
) -> BillingResult<Invoice> {
    if let Some(invoice) = invoices::get_for_period(&mut *conn, period.id).await? {
        return Ok(invoice);
    }

    let created = invoices::insert_draft(
        &mut *conn,
        &NewInvoice {
            billing_period_id: period.id,
            subscription_id: subscription.id,
            customer_id: subscription.customer_id,
            organization_id: subscription.organization_id,
            currency: &subscription.currency,
        },
    )
    .await?;
    match created {
        Some(invoice) => {
            info!(
                invoice_id = %invoice.id,
                invoice_number = %invoice.invoice_number,
                billing_period_id = %period.id,
                "created draft invoice"
            );
            Ok(invoice)
        }
        None => invoices::get_for_period(&mut *conn, period.id)
            .await?
            .ok_or(BillingError::MissingInvoice(period.id)),
    }
}

async fn transition_run(
    conn: &mut PgConnection,
    run: &BillingRun,
    next: BillingRunStatus,
    error_details: Option<&serde_json::Value>,
) -> BillingResult<BillingRun> {
    if !run.status.can_transition_to(next) {
        return Err(BillingError::IllegalTransition {
            entity: "billing run",
            from: run.status.as_str(),
            to: next.as_str(),
        });
    }
    billing_runs::transition(&mut *conn, run.id, run.version, next, error_details)
        .await?
        .ok_or(BillingError::ConcurrentModification(run.id))
}

fn gateway_error_details(err: &GatewayError, amount: i64) -> serde_json::Value {
    let mut details = json!({
        "kind": err.kind(),
        "message": err.to_string(),
        "amount": amount,
    });
    if let GatewayError::Rejected { status, body } = err {
        details["status"] = json!(status);
        details["body"] = json!(body);
    }
    details
}

/// Gateway failures end the attempt: the run is marked failed with the error
/// captured and the caller sees the updated state rather than an error.
#[allow(clippy::too_many_arguments)]
async fn fail_run(
    conn: &mut PgConnection,
    mut execution: RunExecution,
    run: BillingRun,
    payment: Payment,
    invoice: Invoice,
    subscription: &Subscription,
    details: serde_json::Value,
    ctx: &ExecutionContext<'_>,
) -> BillingResult<RunExecution> {
    error!(
        billing_run_id = %run.id,
        subscription_id = %subscription.id,
        error = %details,
        "billing run charge failed"
    );

    let run = transition_run(conn, &run, BillingRunStatus::Failed, Some(&details)).await?;
    let payment = payments::set_status(&mut *conn, payment.id, PaymentStatus::Failed, None).await?;
    let invoice = invoices::set_status(&mut *conn, invoice.id, InvoiceStatus::Open).await?;
    let period = refresh_period_status(conn, run.billing_period_id, ctx.now, true).await?;

    let locked = subscriptions::lock_for_update(&mut *conn, subscription.id)
        .await?
        .ok_or_else(|| BillingError::not_found("subscription", subscription.id))?;
    if locked.status.can_transition_to(SubscriptionStatus::PastDue) {
        move_subscription(conn, &locked, SubscriptionStatus::PastDue).await?;
    }

    execution.notifications.push(Notification::PaymentFailed {
        subscription_id: subscription.id,
        billing_run_id: run.id,
        retry_at: None,
    });
    execution.billing_run = run;
    execution.payment = Some(payment);
    execution.invoice = Some(invoice);
    execution.period = Some(period);
    Ok(execution)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_charges_capture_status_and_body() {
        let details = gateway_error_details(
            &GatewayError::Rejected {
                status: 402,
                body: "card_declined".into(),
            },
            1200,
        );
        assert_eq!(details["kind"], "rejected");
        assert_eq!(details["status"], 402);
        assert_eq!(details["body"], "card_declined");
        assert_eq!(details["amount"], 1200);
    }

    #[test]
    fn missing_references_are_reported_by_kind() {
        let details = gateway_error_details(&GatewayError::MissingCustomer, 10);
        assert_eq!(details["kind"], "missing_customer");
        assert!(details.get("status").is_none());
    }
}
