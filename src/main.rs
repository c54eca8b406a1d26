use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use recurring_billing::billing::{
    spawn_billing_scheduler, start_reconciliation_worker, BillingService, HttpPaymentGateway,
    RetrySchedule,
};
use recurring_billing::{config, routes::api_routes, webhooks::WebhookSecret};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

async fn healthz() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error.into());
        }
    }

    if config::PAYMENT_GATEWAY_API_KEY.is_none() {
        tracing::warn!("PAYMENT_GATEWAY_API_KEY is not set; gateway calls will be rejected");
    }
    let gateway = HttpPaymentGateway::new(
        config::PAYMENT_GATEWAY_BASE_URL.as_str(),
        config::PAYMENT_GATEWAY_API_KEY.clone().unwrap_or_default(),
        Duration::from_secs(*config::PAYMENT_GATEWAY_TIMEOUT_SECS),
    )?;
    let service = BillingService::new(pool.clone(), Arc::new(gateway))
        .with_retry_schedule(RetrySchedule::new(config::BILLING_RETRY_SCHEDULE_DAYS.clone()))
        .with_default_currency(config::BILLING_DEFAULT_CURRENCY.as_str());

    let reconciler = start_reconciliation_worker(service.clone());
    spawn_billing_scheduler(service.clone(), *config::BILLING_SCAN_INTERVAL_SECS);

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(service))
        .layer(Extension(reconciler))
        .layer(Extension(WebhookSecret(
            config::PAYMENT_GATEWAY_WEBHOOK_SECRET.clone(),
        )));

    let addr: SocketAddr =
        format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT).parse()?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
