use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppResult;

use super::adjustments::{AdjustmentOutcome, AdjustmentRequest, AdjustmentTiming, ItemInput};
use super::executor::RunExecution;
use super::periods::PeriodTransition;
use super::service::BillingService;
use super::subscriptions::{CreateSubscription, SubscriptionDetails};

/// key: billing-api -> rest endpoints
pub async fn create_subscription(
    Extension(service): Extension<BillingService>,
    Json(payload): Json<CreateSubscription>,
) -> AppResult<(StatusCode, Json<SubscriptionDetails>)> {
    let details = service.create_subscription(&payload).await?;
    Ok((StatusCode::CREATED, Json(details)))
}

pub async fn get_subscription(
    Extension(service): Extension<BillingService>,
    Path(subscription_id): Path<Uuid>,
) -> AppResult<Json<SubscriptionDetails>> {
    Ok(Json(service.get_subscription(subscription_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct AdjustSubscriptionRequest {
    pub items: Vec<ItemInput>,
    pub timing: String,
    #[serde(default)]
    pub prorate_current_billing_period: Option<bool>,
}

impl AdjustSubscriptionRequest {
    pub fn into_request(self) -> AppResult<AdjustmentRequest> {
        let timing = self.timing.parse::<AdjustmentTiming>()?;
        Ok(AdjustmentRequest {
            items: self.items,
            timing,
            prorate_current_billing_period: self.prorate_current_billing_period.unwrap_or(false),
        })
    }
}

pub async fn adjust_subscription(
    Extension(service): Extension<BillingService>,
    Path(subscription_id): Path<Uuid>,
    Json(payload): Json<AdjustSubscriptionRequest>,
) -> AppResult<Json<AdjustmentOutcome>> {
    let request = payload.into_request()?;
    Ok(Json(
        service
            .adjust_subscription(subscription_id, &request)
            .await?,
    ))
}

pub async fn transition_period(
    Extension(service): Extension<BillingService>,
    Path(period_id): Path<Uuid>,
) -> AppResult<Json<PeriodTransition>> {
    Ok(Json(
        service
            .transition_subscription_billing_period(period_id)
            .await?,
    ))
}

pub async fn execute_run(
    Extension(service): Extension<BillingService>,
    Path(run_id): Path<Uuid>,
) -> AppResult<Json<RunExecution>> {
    Ok(Json(service.execute_billing_run(run_id).await?))
}
