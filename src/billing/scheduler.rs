use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};

use crate::db::{billing_periods, billing_runs};

use super::service::BillingService;

const BATCH_SIZE: i64 = 200;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub periods_transitioned: usize,
    pub runs_executed: usize,
    pub failures: usize,
}

/// key: billing-scheduler -> period rollover and due run automation
pub fn spawn(service: BillingService, scan_interval_secs: u64) {
    let interval = TokioDuration::from_secs(scan_interval_secs.max(1));

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let now = service.clock().now();
            match process_tick(&service, now).await {
                Ok(summary) if summary != TickSummary::default() => info!(
                    periods = summary.periods_transitioned,
                    runs = summary.runs_executed,
                    failures = summary.failures,
                    "billing automation tick completed"
                ),
                Ok(_) => debug!("billing automation tick found no work"),
                Err(err) => warn!(?err, "billing automation tick failed"),
            }
        }
    });
}

/// key: billing-scheduler -> tick handler
pub async fn process_tick(service: &BillingService, now: DateTime<Utc>) -> Result<TickSummary> {
    let mut summary = TickSummary::default();

    let ended = billing_periods::list_ended_current(service.pool(), now, BATCH_SIZE).await?;
    for period in ended {
        match service
            .transition_subscription_billing_period(period.id)
            .await
        {
            Ok(transition) => {
                summary.periods_transitioned += 1;
                debug!(
                    subscription_id = %transition.subscription.id,
                    closed_period = %transition.closed_period.id,
                    next_period = ?transition.next_period.as_ref().map(|next| next.id),
                    "transitioned billing period"
                );
            }
            Err(err) => {
                summary.failures += 1;
                warn!(
                    ?err,
                    billing_period_id = %period.id,
                    subscription_id = %period.subscription_id,
                    "failed to transition billing period"
                );
            }
        }
    }

    let due = billing_runs::list_due(service.pool(), now, BATCH_SIZE).await?;
    for run in due {
        match service.execute_billing_run(run.id).await {
            Ok(execution) => {
                if execution.executed {
                    summary.runs_executed += 1;
                }
            }
            Err(err) => {
                summary.failures += 1;
                warn!(
                    ?err,
                    billing_run_id = %run.id,
                    subscription_id = %run.subscription_id,
                    "failed to execute billing run"
                );
            }
        }
    }

    Ok(summary)
}
