use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::billing::error::BillingError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Billing(err) => billing_status(err),
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn billing_status(err: &BillingError) -> StatusCode {
    if err.is_validation() {
        return StatusCode::BAD_REQUEST;
    }
    match err {
        BillingError::NotFound { .. } => StatusCode::NOT_FOUND,
        BillingError::TerminalSubscription(_)
        | BillingError::ActiveSubscriptionExists(_)
        | BillingError::IllegalTransition { .. }
        | BillingError::ConcurrentModification(_)
        | BillingError::MismatchedPaymentIntent { .. }
        | BillingError::PeriodNotYetEnded { .. } => StatusCode::CONFLICT,
        BillingError::NoCurrentBillingPeriod(_)
        | BillingError::NoPaymentMethod(_)
        | BillingError::MissingInvoice(_)
        | BillingError::MissingGatewayCharge(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self, %status, "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn billing_errors_map_to_http_statuses() {
        let id = Uuid::new_v4();
        let cases = [
            (BillingError::InvalidTiming("later".into()), StatusCode::BAD_REQUEST),
            (BillingError::InvalidInterval { count: 0 }, StatusCode::BAD_REQUEST),
            (BillingError::not_found("subscription", id), StatusCode::NOT_FOUND),
            (BillingError::TerminalSubscription(id), StatusCode::CONFLICT),
            (BillingError::ActiveSubscriptionExists(id), StatusCode::CONFLICT),
            (BillingError::NoPaymentMethod(id), StatusCode::UNPROCESSABLE_ENTITY),
            (
                BillingError::Database(sqlx::Error::RowNotFound),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(AppError::from(err).status(), expected);
        }
    }
}
