use std::time::Duration;

use chrono::{Datelike, Timelike, Utc};
use tokio::{task::JoinHandle, time::sleep};

use crate::{
    services::{
        autopay::run_autopay_charges, late_fees::run_late_fee_assessment,
        ledger::{close_ended_leases, post_monthly_rent_charges, BillingPeriod},
        messaging::process_queued_messages,
    },
    state::AppState,
};

/// Background loop: outbound message dispatch on an interval, billing jobs
/// once per UTC day after the configured hour.
///
/// Each job runs in its own `tokio::spawn` so a panic in one never stops the loop.
pub async fn run_background_scheduler(state: AppState) {
    let pool = match state.db_pool.as_ref() {
        Some(p) => p.clone(),
        None => {
            tracing::warn!("Scheduler: no database pool configured, exiting");
            return;
        }
    };
    tracing::info!(
        daily_hour_utc = state.config.scheduler_daily_hour_utc,
        "Background scheduler started"
    );

    let message_interval =
        Duration::from_secs(state.config.message_poll_interval_seconds.max(15));
    let mut last_message_run = tokio::time::Instant::now();
    let mut last_daily_run: Option<(i32, u32)> = None;
    let mut message_task: Option<JoinHandle<()>> = None;

    loop {
        sleep(Duration::from_secs(15)).await;

        let now_instant = tokio::time::Instant::now();
        let now_utc = Utc::now();
        let today = now_utc.date_naive();

        if now_instant.duration_since(last_message_run) >= message_interval {
            last_message_run = now_instant;
            if is_idle(message_task.as_ref()) {
                let pool = pool.clone();
                let client = state.http_client.clone();
                let config = state.config.clone();
                message_task = Some(tokio::spawn(async move {
                    process_queued_messages(&pool, &client, &config).await;
                }));
            } else {
                tracing::debug!("Scheduler: previous message dispatch still running, skipping tick");
            }
        }

        let day_key = (today.year(), today.ordinal());
        if last_daily_run == Some(day_key) || now_utc.hour() < state.config.scheduler_daily_hour_utc {
            continue;
        }
        last_daily_run = Some(day_key);
        tracing::info!(date = %today, "Scheduler: running daily billing jobs");

        // Rent must be posted before late fees and autopay read the balance.
        let st = state.clone();
        tokio::spawn(async move {
            run_daily_billing(&st, today).await;
        });
    }
}

fn is_idle(task: Option<&JoinHandle<()>>) -> bool {
    task.is_none_or(JoinHandle::is_finished)
}

pub async fn run_daily_billing(state: &AppState, today: chrono::NaiveDate) {
    let Some(pool) = state.db_pool.as_ref() else {
        return;
    };
    if let Err(error) = close_ended_leases(pool, today).await {
        tracing::warn!(error = %error, "Scheduler: failed to close ended leases");
    }
    post_monthly_rent_charges(pool, None, BillingPeriod::containing(today)).await;
    run_late_fee_assessment(state, None, None).await;
    run_autopay_charges(state, today).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::is_idle;

    #[tokio::test]
    async fn message_dispatch_does_not_overlap() {
        assert!(is_idle(None));

        let running = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert!(!is_idle(Some(&running)));
        running.abort();

        let finished = tokio::spawn(async {});
        while !finished.is_finished() {
            tokio::task::yield_now().await;
        }
        assert!(is_idle(Some(&finished)));
    }
}
