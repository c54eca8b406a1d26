use axum::{
    routing::{get, post},
    Router,
};

use crate::{billing::api, webhooks};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/billing/subscriptions", post(api::create_subscription))
        .route(
            "/api/billing/subscriptions/:id",
            get(api::get_subscription),
        )
        .route(
            "/api/billing/subscriptions/:id/adjust",
            post(api::adjust_subscription),
        )
        .route(
            "/api/billing/periods/:id/transition",
            post(api::transition_period),
        )
        .route("/api/billing/runs/:id/execute", post(api::execute_run))
        .route("/api/billing/gateway/events", post(webhooks::gateway_events))
}
