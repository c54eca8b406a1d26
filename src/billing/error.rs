use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// key: billing-errors -> typed failures surfaced to callers
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("interval count must be at least 1, got {count}")]
    InvalidInterval { count: i32 },
    #[error("unsupported billing interval `{0}`")]
    UnsupportedInterval(String),
    #[error("next period would start at {start} before the previous period ended at {previous_end}")]
    NonContiguousPeriod {
        start: DateTime<Utc>,
        previous_end: DateTime<Utc>,
    },
    #[error("billing period from {start} to {end} has no positive duration")]
    ZeroOrNegativeDuration {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("adjustment date {date} falls outside billing period {start}..{end}")]
    AdjustmentOutOfRange {
        date: DateTime<Utc>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("subscription {0} is in a terminal state")]
    TerminalSubscription(Uuid),
    #[error("invalid adjustment timing `{0}`")]
    InvalidTiming(String),
    #[error("subscription {0} has no current billing period")]
    NoCurrentBillingPeriod(Uuid),
    #[error("subscription {0} has no default or backup payment method")]
    NoPaymentMethod(Uuid),
    #[error("billing period {period_id} does not end until {ends_at}")]
    PeriodNotYetEnded {
        period_id: Uuid,
        ends_at: DateTime<Utc>,
    },
    #[error("billing run {run_id} is tied to payment intent {expected:?}, event references {received}")]
    MismatchedPaymentIntent {
        run_id: Uuid,
        expected: Option<String>,
        received: String,
    },
    #[error("billing period {0} has no invoice")]
    MissingInvoice(Uuid),
    #[error("gateway returned no charge for billing run {0}")]
    MissingGatewayCharge(Uuid),
    #[error("invalid subscription item: {0}")]
    InvalidSubscriptionItem(String),
    #[error("customer {0} already has a live subscription")]
    ActiveSubscriptionExists(Uuid),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("illegal {entity} transition from {from} to {to}")]
    IllegalTransition {
        entity: &'static str,
        from: &'static str,
        to: &'static str,
    },
    #[error("billing run {0} was modified concurrently")]
    ConcurrentModification(Uuid),
    #[error("gateway event is missing the `{0}` metadata key")]
    MissingEventMetadata(&'static str),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl BillingError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        BillingError::NotFound { entity, id }
    }

    /// Validation failures abort the surrounding transaction and are reported
    /// to the caller as a client error.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BillingError::InvalidInterval { .. }
                | BillingError::UnsupportedInterval(_)
                | BillingError::NonContiguousPeriod { .. }
                | BillingError::ZeroOrNegativeDuration { .. }
                | BillingError::AdjustmentOutOfRange { .. }
                | BillingError::InvalidTiming(_)
                | BillingError::InvalidSubscriptionItem(_)
                | BillingError::MissingEventMetadata(_)
        )
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

/// Raised when a persisted status string does not name a known variant.
#[derive(Debug, Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
