pub mod adapters;
pub mod adjustments;
pub mod api;
pub mod clock;
pub mod error;
pub mod executor;
pub mod interval;
pub mod models;
pub mod periods;
pub mod proration;
pub mod reconciliation;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod subscriptions;

pub use adapters::{
    BillingNotifier, ChargeRequest, ChargeResult, FeeBreakdown, FeeCalculator, GatewayError,
    GatewayPaymentStatus, HttpPaymentGateway, LoggingNotifier, Notification, PaymentGateway,
    StandardFeeCalculator,
};
pub use adjustments::{AdjustmentOutcome, AdjustmentRequest, AdjustmentTiming, ItemInput};
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{BillingError, BillingResult};
pub use executor::RunExecution;
pub use interval::{compute_next_period, PeriodBounds};
pub use periods::PeriodTransition;
pub use proration::{split_around_date, ProrationSplit};
pub use reconciliation::{
    start_reconciliation_worker, EventDisposition, GatewayEvent, Reconciliation,
    ReconciliationHandle, ReconciliationJob,
};
pub use retry::RetrySchedule;
pub use scheduler::{process_tick as run_billing_automation_tick, spawn as spawn_billing_scheduler};
pub use service::BillingService;
pub use subscriptions::{CreateSubscription, NewItem, SubscriptionDetails};
