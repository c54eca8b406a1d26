use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::{
    BillingPeriodItem, BillingRunStatus, Organization, PaymentMethod, PaymentMethodKind,
    PaymentStatus,
};

/// Status values reported by the payment gateway for a payment intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayPaymentStatus {
    Succeeded,
    RequiresPaymentMethod,
    RequiresAction,
    RequiresCapture,
    RequiresConfirmation,
    Canceled,
    Processing,
}

impl GatewayPaymentStatus {
    pub fn run_status(&self) -> BillingRunStatus {
        match self {
            GatewayPaymentStatus::Succeeded => BillingRunStatus::Succeeded,
            GatewayPaymentStatus::RequiresPaymentMethod => BillingRunStatus::Failed,
            GatewayPaymentStatus::RequiresAction
            | GatewayPaymentStatus::RequiresCapture
            | GatewayPaymentStatus::RequiresConfirmation => BillingRunStatus::InProgress,
            GatewayPaymentStatus::Canceled => BillingRunStatus::Aborted,
            GatewayPaymentStatus::Processing => BillingRunStatus::AwaitingPaymentConfirmation,
        }
    }

    pub fn payment_status(&self) -> PaymentStatus {
        match self {
            GatewayPaymentStatus::Succeeded => PaymentStatus::Succeeded,
            GatewayPaymentStatus::RequiresPaymentMethod => PaymentStatus::Failed,
            GatewayPaymentStatus::Canceled => PaymentStatus::Canceled,
            _ => PaymentStatus::Processing,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub idempotency_key: Uuid,
    pub amount: i64,
    pub currency: String,
    pub customer_ref: Option<String>,
    pub payment_method_ref: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeResult {
    pub id: String,
    pub status: GatewayPaymentStatus,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("customer has no gateway reference")]
    MissingCustomer,
    #[error("payment method has no gateway reference")]
    MissingPaymentMethod,
    #[error("gateway rejected charge with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::MissingCustomer => "missing_customer",
            GatewayError::MissingPaymentMethod => "missing_payment_method",
            GatewayError::Rejected { .. } => "rejected",
            GatewayError::Transport(_) => "transport",
        }
    }
}

/// key: payment-gateway -> create and confirm charges
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_and_confirm_charge(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeResult, GatewayError>;
}

/// key: payment-gateway-http -> payment intents over REST
pub struct HttpPaymentGateway {
    base: String,
    api_key: String,
    client: Client,
}

impl HttpPaymentGateway {
    pub fn new(
        base: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

#[derive(Serialize)]
struct PaymentIntentBody<'a> {
    amount: i64,
    currency: &'a str,
    customer: &'a str,
    payment_method: &'a str,
    confirm: bool,
    metadata: &'a BTreeMap<String, String>,
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_and_confirm_charge(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeResult, GatewayError> {
        let customer = request
            .customer_ref
            .as_deref()
            .ok_or(GatewayError::MissingCustomer)?;
        let payment_method = request
            .payment_method_ref
            .as_deref()
            .ok_or(GatewayError::MissingPaymentMethod)?;

        let url = format!("{}/v1/payment_intents", self.base);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", request.idempotency_key.to_string())
            .json(&PaymentIntentBody {
                amount: request.amount,
                currency: &request.currency,
                customer,
                payment_method,
                confirm: true,
                metadata: &request.metadata,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), %body, "payment gateway rejected charge");
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<ChargeResult>().await?)
    }
}

/// Fee computation for a billing period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeBreakdown {
    pub subtotal: i64,
    pub platform_fee_basis_points: i32,
    pub platform_fee: i64,
    pub payment_method_kind: PaymentMethodKind,
    pub processing_fee: i64,
    pub total_due: i64,
}

/// key: fee-calculator -> amount due for a period
pub trait FeeCalculator: Send + Sync {
    fn compute_due(
        &self,
        items: &[BillingPeriodItem],
        organization: &Organization,
        payment_method: &PaymentMethod,
    ) -> FeeBreakdown;
}

/// Fees are retained from the organization's payout and never added to the
/// customer's charge.
#[derive(Debug, Clone)]
pub struct StandardFeeCalculator {
    pub card_basis_points: i64,
    pub card_fixed_fee: i64,
    pub bank_basis_points: i64,
    pub bank_fee_cap: i64,
}

impl Default for StandardFeeCalculator {
    fn default() -> Self {
        Self {
            card_basis_points: 290,
            card_fixed_fee: 30,
            bank_basis_points: 80,
            bank_fee_cap: 500,
        }
    }
}

impl FeeCalculator for StandardFeeCalculator {
    fn compute_due(
        &self,
        items: &[BillingPeriodItem],
        organization: &Organization,
        payment_method: &PaymentMethod,
    ) -> FeeBreakdown {
        let subtotal: i64 = items.iter().map(BillingPeriodItem::amount).sum();
        let total_due = subtotal.max(0);

        let (platform_fee, processing_fee) = if total_due == 0 {
            (0, 0)
        } else {
            let platform = basis_points_of(
                total_due,
                i64::from(organization.platform_fee_basis_points),
            );
            let processing = match payment_method.kind {
                PaymentMethodKind::Card => {
                    basis_points_of(total_due, self.card_basis_points) + self.card_fixed_fee
                }
                PaymentMethodKind::BankAccount => {
                    basis_points_of(total_due, self.bank_basis_points).min(self.bank_fee_cap)
                }
            };
            (platform, processing)
        };

        FeeBreakdown {
            subtotal,
            platform_fee_basis_points: organization.platform_fee_basis_points,
            platform_fee,
            payment_method_kind: payment_method.kind,
            processing_fee,
            total_due,
        }
    }
}

fn basis_points_of(amount: i64, basis_points: i64) -> i64 {
    let value = i128::from(amount) * i128::from(basis_points);
    let rounded = (value + 5_000) / 10_000;
    i64::try_from(rounded).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    PaymentSucceeded {
        subscription_id: Uuid,
        billing_run_id: Uuid,
        invoice_id: Option<Uuid>,
        amount: i64,
    },
    PaymentFailed {
        subscription_id: Uuid,
        billing_run_id: Uuid,
        retry_at: Option<DateTime<Utc>>,
    },
    AwaitingConfirmation {
        subscription_id: Uuid,
        billing_run_id: Uuid,
    },
}

/// key: billing-notifier -> customer facing payment notices
#[async_trait]
pub trait BillingNotifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

#[async_trait]
impl BillingNotifier for LoggingNotifier {
    async fn notify(&self, notification: Notification) {
        match notification {
            Notification::PaymentSucceeded {
                subscription_id,
                billing_run_id,
                invoice_id,
                amount,
            } => info!(
                %subscription_id,
                %billing_run_id,
                ?invoice_id,
                amount,
                "payment succeeded notification"
            ),
            Notification::PaymentFailed {
                subscription_id,
                billing_run_id,
                retry_at,
            } => info!(
                %subscription_id,
                %billing_run_id,
                ?retry_at,
                "payment failed notification"
            ),
            Notification::AwaitingConfirmation {
                subscription_id,
                billing_run_id,
            } => info!(
                %subscription_id,
                %billing_run_id,
                "payment awaiting confirmation notification"
            ),
        }
    }
}
