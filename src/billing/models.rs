use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::error::UnknownVariant;
use super::interval::PeriodBounds;

/// key: billing-models -> organizations,customers,payment methods
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub platform_fee_basis_points: i32,
    pub default_currency: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub gateway_customer_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodKind {
    Card,
    BankAccount,
}

impl PaymentMethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethodKind::Card => "card",
            PaymentMethodKind::BankAccount => "bank_account",
        }
    }
}

impl FromStr for PaymentMethodKind {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "card" => Ok(PaymentMethodKind::Card),
            "bank_account" => Ok(PaymentMethodKind::BankAccount),
            other => Err(UnknownVariant::new("payment method kind", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub kind: PaymentMethodKind,
    pub gateway_payment_method_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// key: billing-subscription-status -> lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    IncompleteExpired,
    Trialing,
    Active,
    PastDue,
    CancellationScheduled,
    Paused,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::CancellationScheduled => "cancellation_scheduled",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled | SubscriptionStatus::IncompleteExpired
        )
    }

    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;

        if *self == next {
            return !self.is_terminal();
        }
        match self {
            Incomplete => matches!(
                next,
                Active | Trialing | PastDue | IncompleteExpired | Canceled
            ),
            Trialing => matches!(
                next,
                Active | PastDue | CancellationScheduled | Paused | Canceled
            ),
            Active => matches!(next, PastDue | CancellationScheduled | Paused | Canceled),
            PastDue => matches!(next, Active | CancellationScheduled | Canceled),
            CancellationScheduled => matches!(next, Active | PastDue | Canceled),
            Paused => matches!(next, Active | PastDue | Canceled),
            Canceled | IncompleteExpired => false,
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Ok(SubscriptionStatus::IncompleteExpired),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "cancellation_scheduled" => Ok(SubscriptionStatus::CancellationScheduled),
            "paused" => Ok(SubscriptionStatus::Paused),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(UnknownVariant::new("subscription status", other)),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Day,
    Week,
    Month,
    Year,
}

impl IntervalUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Day => "day",
            IntervalUnit::Week => "week",
            IntervalUnit::Month => "month",
            IntervalUnit::Year => "year",
        }
    }
}

impl FromStr for IntervalUnit {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "day" => Ok(IntervalUnit::Day),
            "week" => Ok(IntervalUnit::Week),
            "month" => Ok(IntervalUnit::Month),
            "year" => Ok(IntervalUnit::Year),
            other => Err(UnknownVariant::new("interval unit", other)),
        }
    }
}

impl fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// key: billing-subscription-model -> customer subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub organization_id: Uuid,
    pub status: SubscriptionStatus,
    pub interval_unit: IntervalUnit,
    pub interval_count: i32,
    pub billing_cycle_anchor: DateTime<Utc>,
    pub current_billing_period_start: Option<DateTime<Utc>>,
    pub current_billing_period_end: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub default_payment_method_id: Option<Uuid>,
    pub backup_payment_method_id: Option<Uuid>,
    pub cancel_scheduled_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub currency: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Default payment method, falling back to the backup one.
    pub fn billing_payment_method_id(&self) -> Option<Uuid> {
        self.default_payment_method_id
            .or(self.backup_payment_method_id)
    }
}

/// key: billing-subscription-item -> billable line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub unit_price: i64,
    pub added_date: DateTime<Utc>,
    pub removed_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionItem {
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.added_date <= at && self.removed_date.map_or(true, |removed| removed > at)
    }

    pub fn amount(&self) -> i64 {
        i64::from(self.quantity) * self.unit_price
    }
}

/// key: billing-period-status -> period state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriodStatus {
    Upcoming,
    Active,
    PastDue,
    Completed,
    Canceled,
    ScheduledToCancel,
}

impl BillingPeriodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriodStatus::Upcoming => "upcoming",
            BillingPeriodStatus::Active => "active",
            BillingPeriodStatus::PastDue => "past_due",
            BillingPeriodStatus::Completed => "completed",
            BillingPeriodStatus::Canceled => "canceled",
            BillingPeriodStatus::ScheduledToCancel => "scheduled_to_cancel",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BillingPeriodStatus::Completed | BillingPeriodStatus::Canceled
        )
    }

    pub fn can_transition_to(&self, next: BillingPeriodStatus) -> bool {
        use BillingPeriodStatus::*;

        if *self == next {
            return !self.is_terminal();
        }
        match self {
            Upcoming => matches!(next, Active | Canceled | ScheduledToCancel),
            Active => matches!(next, Completed | PastDue | Canceled | ScheduledToCancel),
            PastDue => matches!(next, Completed | Active | Canceled),
            ScheduledToCancel => matches!(next, Active | Completed | PastDue | Canceled),
            Completed | Canceled => false,
        }
    }
}

impl FromStr for BillingPeriodStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "upcoming" => Ok(BillingPeriodStatus::Upcoming),
            "active" => Ok(BillingPeriodStatus::Active),
            "past_due" => Ok(BillingPeriodStatus::PastDue),
            "completed" => Ok(BillingPeriodStatus::Completed),
            "canceled" => Ok(BillingPeriodStatus::Canceled),
            "scheduled_to_cancel" => Ok(BillingPeriodStatus::ScheduledToCancel),
            other => Err(UnknownVariant::new("billing period status", other)),
        }
    }
}

impl fmt::Display for BillingPeriodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub status: BillingPeriodStatus,
    pub trial_period: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_date
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start_date <= at && at <= self.end_date
    }

    pub fn bounds(&self) -> PeriodBounds {
        PeriodBounds {
            start: self.start_date,
            end: self.end_date,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriodItemKind {
    Regular,
    Proration,
}

impl BillingPeriodItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriodItemKind::Regular => "regular",
            BillingPeriodItemKind::Proration => "proration",
        }
    }
}

impl FromStr for BillingPeriodItemKind {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "regular" => Ok(BillingPeriodItemKind::Regular),
            "proration" => Ok(BillingPeriodItemKind::Proration),
            other => Err(UnknownVariant::new("billing period item kind", other)),
        }
    }
}

/// key: billing-period-item -> materialized charge line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingPeriodItem {
    pub id: Uuid,
    pub billing_period_id: Uuid,
    pub subscription_item_id: Option<Uuid>,
    pub kind: BillingPeriodItemKind,
    pub name: String,
    pub description: Option<String>,
    pub quantity: i32,
    pub unit_price: i64,
    pub discount_redemption_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl BillingPeriodItem {
    pub fn amount(&self) -> i64 {
        i64::from(self.quantity) * self.unit_price
    }
}

/// Billing period item not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBillingPeriodItem {
    pub subscription_item_id: Option<Uuid>,
    pub kind: BillingPeriodItemKind,
    pub name: String,
    pub description: Option<String>,
    pub quantity: i32,
    pub unit_price: i64,
    pub discount_redemption_id: Option<Uuid>,
}

impl NewBillingPeriodItem {
    pub fn regular(item: &SubscriptionItem) -> Self {
        Self {
            subscription_item_id: Some(item.id),
            kind: BillingPeriodItemKind::Regular,
            name: item.name.clone(),
            description: None,
            quantity: item.quantity,
            unit_price: item.unit_price,
            discount_redemption_id: None,
        }
    }

    pub fn amount(&self) -> i64 {
        i64::from(self.quantity) * self.unit_price
    }
}

/// key: billing-run-status -> payment attempt state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingRunStatus {
    Scheduled,
    InProgress,
    AwaitingPaymentConfirmation,
    Succeeded,
    Failed,
    Aborted,
    Abandoned,
}

impl BillingRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingRunStatus::Scheduled => "scheduled",
            BillingRunStatus::InProgress => "in_progress",
            BillingRunStatus::AwaitingPaymentConfirmation => "awaiting_payment_confirmation",
            BillingRunStatus::Succeeded => "succeeded",
            BillingRunStatus::Failed => "failed",
            BillingRunStatus::Aborted => "aborted",
            BillingRunStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BillingRunStatus::Succeeded
                | BillingRunStatus::Failed
                | BillingRunStatus::Aborted
                | BillingRunStatus::Abandoned
        )
    }

    /// A failed run may still be confirmed late by the gateway; every other
    /// terminal status is final.
    pub fn can_transition_to(&self, next: BillingRunStatus) -> bool {
        use BillingRunStatus::*;

        match self {
            Scheduled => matches!(
                next,
                InProgress | AwaitingPaymentConfirmation | Succeeded | Failed | Aborted | Abandoned
            ),
            InProgress => matches!(
                next,
                InProgress | AwaitingPaymentConfirmation | Succeeded | Failed | Aborted
            ),
            AwaitingPaymentConfirmation => matches!(
                next,
                InProgress | AwaitingPaymentConfirmation | Succeeded | Failed | Aborted
            ),
            Failed => matches!(next, Succeeded),
            Succeeded | Aborted | Abandoned => false,
        }
    }
}

impl FromStr for BillingRunStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "scheduled" => Ok(BillingRunStatus::Scheduled),
            "in_progress" => Ok(BillingRunStatus::InProgress),
            "awaiting_payment_confirmation" => Ok(BillingRunStatus::AwaitingPaymentConfirmation),
            "succeeded" => Ok(BillingRunStatus::Succeeded),
            "failed" => Ok(BillingRunStatus::Failed),
            "aborted" => Ok(BillingRunStatus::Aborted),
            "abandoned" => Ok(BillingRunStatus::Abandoned),
            other => Err(UnknownVariant::new("billing run status", other)),
        }
    }
}

impl fmt::Display for BillingRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// key: billing-run-model -> one collection attempt for a period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingRun {
    pub id: Uuid,
    pub billing_period_id: Uuid,
    pub subscription_id: Uuid,
    pub status: BillingRunStatus,
    pub scheduled_for: DateTime<Utc>,
    pub payment_method_id: Uuid,
    pub gateway_payment_intent_id: Option<String>,
    pub last_gateway_event_at: Option<DateTime<Utc>>,
    pub error_details: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BillingRun {
    /// Events at or before the last processed one are stale.
    pub fn accepts_event_at(&self, occurred_at: DateTime<Utc>) -> bool {
        self.last_gateway_event_at
            .map_or(true, |last| last < occurred_at)
    }
}

/// key: billing-invoice-status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    AwaitingPaymentConfirmation,
    Paid,
    Uncollectible,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Open => "open",
            InvoiceStatus::AwaitingPaymentConfirmation => "awaiting_payment_confirmation",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Uncollectible => "uncollectible",
            InvoiceStatus::Void => "void",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Paid | InvoiceStatus::Uncollectible | InvoiceStatus::Void
        )
    }

    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;

        if *self == next {
            return !self.is_terminal();
        }
        match self {
            Draft => matches!(
                next,
                Open | AwaitingPaymentConfirmation | Paid | Uncollectible | Void
            ),
            Open => matches!(next, AwaitingPaymentConfirmation | Paid | Uncollectible | Void),
            AwaitingPaymentConfirmation => matches!(next, Open | Paid | Uncollectible | Void),
            Paid | Uncollectible | Void => false,
        }
    }

    /// Invoice status implied by a billing run outcome.
    pub fn for_run_status(status: BillingRunStatus) -> Option<InvoiceStatus> {
        match status {
            BillingRunStatus::Succeeded => Some(InvoiceStatus::Paid),
            BillingRunStatus::AwaitingPaymentConfirmation => {
                Some(InvoiceStatus::AwaitingPaymentConfirmation)
            }
            BillingRunStatus::InProgress | BillingRunStatus::Failed | BillingRunStatus::Aborted => {
                Some(InvoiceStatus::Open)
            }
            BillingRunStatus::Scheduled | BillingRunStatus::Abandoned => None,
        }
    }
}

impl FromStr for InvoiceStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "draft" => Ok(InvoiceStatus::Draft),
            "open" => Ok(InvoiceStatus::Open),
            "awaiting_payment_confirmation" => Ok(InvoiceStatus::AwaitingPaymentConfirmation),
            "paid" => Ok(InvoiceStatus::Paid),
            "uncollectible" => Ok(InvoiceStatus::Uncollectible),
            "void" => Ok(InvoiceStatus::Void),
            other => Err(UnknownVariant::new("invoice status", other)),
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub invoice_number: String,
    pub billing_period_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub customer_id: Uuid,
    pub organization_id: Uuid,
    pub status: InvoiceStatus,
    pub currency: String,
    pub subtotal: i64,
    pub total_due: i64,
    pub fee_breakdown: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub billing_period_item_id: Option<Uuid>,
    pub description: String,
    pub quantity: i32,
    pub unit_price: i64,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// key: billing-payment-status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Processing,
    Succeeded,
    Failed,
    Refunded,
    Canceled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Processing => "processing",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Canceled => "canceled",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "processing" => Ok(PaymentStatus::Processing),
            "succeeded" => Ok(PaymentStatus::Succeeded),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            "canceled" => Ok(PaymentStatus::Canceled),
            other => Err(UnknownVariant::new("payment status", other)),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub billing_period_id: Option<Uuid>,
    pub billing_run_id: Option<Uuid>,
    pub customer_id: Uuid,
    pub organization_id: Uuid,
    pub amount: i64,
    pub refunded_amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub gateway_charge_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_subscriptions_accept_no_transitions() {
        for next in [
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
        ] {
            assert!(!SubscriptionStatus::Canceled.can_transition_to(next));
            assert!(!SubscriptionStatus::IncompleteExpired.can_transition_to(next));
        }
        assert!(SubscriptionStatus::PastDue.can_transition_to(SubscriptionStatus::Active));
    }

    #[test]
    fn period_state_machine_matches_lifecycle() {
        use BillingPeriodStatus::*;

        assert!(Upcoming.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(Active.can_transition_to(PastDue));
        assert!(PastDue.can_transition_to(Completed));
        assert!(PastDue.can_transition_to(Canceled));
        assert!(!Completed.can_transition_to(PastDue));
        assert!(!Canceled.can_transition_to(Active));
        assert!(!Upcoming.can_transition_to(Completed));
    }

    #[test]
    fn failed_runs_only_recover_through_success() {
        assert!(BillingRunStatus::Failed.can_transition_to(BillingRunStatus::Succeeded));
        assert!(!BillingRunStatus::Failed.can_transition_to(BillingRunStatus::InProgress));
        assert!(!BillingRunStatus::Succeeded.can_transition_to(BillingRunStatus::Failed));
        assert!(!BillingRunStatus::Aborted.can_transition_to(BillingRunStatus::Succeeded));
        assert!(BillingRunStatus::Scheduled
            .can_transition_to(BillingRunStatus::AwaitingPaymentConfirmation));
    }

    #[test]
    fn invoice_status_follows_run_outcome() {
        assert_eq!(
            InvoiceStatus::for_run_status(BillingRunStatus::Succeeded),
            Some(InvoiceStatus::Paid)
        );
        assert_eq!(
            InvoiceStatus::for_run_status(BillingRunStatus::Failed),
            Some(InvoiceStatus::Open)
        );
        assert_eq!(InvoiceStatus::for_run_status(BillingRunStatus::Scheduled), None);
        assert!(!InvoiceStatus::Paid.can_transition_to(InvoiceStatus::Open));
    }

    #[test]
    fn statuses_round_trip_through_storage_strings() {
        for status in [
            BillingRunStatus::Scheduled,
            BillingRunStatus::AwaitingPaymentConfirmation,
            BillingRunStatus::Abandoned,
        ] {
            assert_eq!(status.as_str().parse::<BillingRunStatus>().unwrap(), status);
        }
        assert!("settled".parse::<InvoiceStatus>().is_err());
    }

    #[test]
    fn stale_events_are_rejected() {
        let now = Utc::now();
        let run = BillingRun {
            id: Uuid::new_v4(),
            billing_period_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            status: BillingRunStatus::AwaitingPaymentConfirmation,
            scheduled_for: now,
            payment_method_id: Uuid::new_v4(),
            gateway_payment_intent_id: Some("pi_1".into()),
            last_gateway_event_at: Some(now),
            error_details: None,
            started_at: None,
            completed_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        assert!(!run.accepts_event_at(now));
        assert!(!run.accepts_event_at(now - chrono::Duration::seconds(1)));
        assert!(run.accepts_event_at(now + chrono::Duration::seconds(1)));
    }
}
