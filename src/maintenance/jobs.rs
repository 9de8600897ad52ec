//! The maintenance jobs this service schedules.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use super::{JobReport, MaintenanceJob};
use crate::{
    config::RetentionConfig,
    notify::WebhookDelivery,
    store::{Purge, Store},
};

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Dead letters older than this are left to the retention job.
const REDELIVERY_WINDOW_DAYS: i64 = 7;
const REDELIVERY_MAX_CYCLES: u32 = 5;
const REDELIVERY_BATCH: i64 = 100;

type PurgeBuilder = Box<dyn Fn(DateTime<Utc>) -> (Purge, Option<DateTime<Utc>>) + Send + Sync>;

/// A job that runs a single [`Purge`] built from the current time.
pub struct RetentionJob {
    name: &'static str,
    interval: Duration,
    store: Arc<dyn Store>,
    build: PurgeBuilder,
}

impl RetentionJob {
    pub fn new(
        name: &'static str,
        interval: Duration,
        store: Arc<dyn Store>,
        build: impl Fn(DateTime<Utc>) -> (Purge, Option<DateTime<Utc>>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            interval,
            store,
            build: Box::new(build),
        }
    }
}

#[async_trait]
impl MaintenanceJob for RetentionJob {
    fn name(&self) -> &'static str {
        self.name
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self, now: DateTime<Utc>) -> anyhow::Result<JobReport> {
        let (purge, cutoff) = (self.build)(now);
        let counts = self
            .store
            .purge(purge)
            .await
            .with_context(|| format!("{} purge failed", self.name))?;
        Ok(JobReport { counts, cutoff })
    }
}

/// Re-sends recent webhook dead letters.
pub struct RedeliveryJob {
    webhooks: WebhookDelivery,
}

impl RedeliveryJob {
    pub fn new(webhooks: WebhookDelivery) -> Self {
        Self { webhooks }
    }
}

#[async_trait]
impl MaintenanceJob for RedeliveryJob {
    fn name(&self) -> &'static str {
        "retry-failed-notifications"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }

    async fn run(&self, now: DateTime<Utc>) -> anyhow::Result<JobReport> {
        let cutoff = now - chrono::Duration::days(REDELIVERY_WINDOW_DAYS);
        let stats = self
            .webhooks
            .redeliver_failed(cutoff, REDELIVERY_MAX_CYCLES, REDELIVERY_BATCH)
            .await
            .context("Loading failed notifications")?;

        if stats.retried > 0 {
            info!(
                retried = stats.retried,
                recovered = stats.recovered,
                still_failing = stats.still_failing,
                "Redelivered failed notifications"
            );
        }
        Ok(JobReport {
            counts: vec![
                ("retried", stats.retried),
                ("recovered", stats.recovered),
                ("still_failing", stats.still_failing),
            ],
            cutoff: Some(cutoff),
        })
    }
}

pub fn default_jobs(
    store: Arc<dyn Store>,
    webhooks: WebhookDelivery,
    retention: &RetentionConfig,
) -> Vec<Arc<dyn MaintenanceJob>> {
    let days = chrono::Duration::days;
    let RetentionConfig {
        orphan_order_hours,
        stale_lock_minutes,
        cash_days,
        reservation_days,
        notification_days,
        audit_days,
    } = *retention;

    vec![
        Arc::new(RetentionJob::new(
            "clear-expired-tracking-codes",
            HOUR,
            store.clone(),
            |now| (Purge::ExpiredTrackingCodes { now }, Some(now)),
        )),
        Arc::new(RetentionJob::new(
            "delete-orphaned-orders",
            HOUR,
            store.clone(),
            move |now| {
                let cutoff = now - chrono::Duration::hours(orphan_order_hours);
                (Purge::OrphanedOrders { created_before: cutoff }, Some(cutoff))
            },
        )),
        Arc::new(RetentionJob::new(
            "sweep-stale-locks",
            Duration::from_secs(15 * 60),
            store.clone(),
            move |now| {
                let cutoff = now - chrono::Duration::minutes(stale_lock_minutes);
                (Purge::StaleLocks { locked_before: cutoff }, Some(cutoff))
            },
        )),
        Arc::new(RetentionJob::new(
            "cash-data-retention",
            DAY,
            store.clone(),
            move |now| {
                let cutoff = now - days(cash_days);
                let purge = Purge::CashData {
                    transactions_before: cutoff,
                    summaries_before: cutoff.date_naive(),
                };
                (purge, Some(cutoff))
            },
        )),
        Arc::new(RetentionJob::new(
            "reservation-retention",
            DAY,
            store.clone(),
            move |now| {
                let cutoff = now - days(reservation_days);
                let purge = Purge::Reservations {
                    before: cutoff.date_naive(),
                };
                (purge, Some(cutoff))
            },
        )),
        Arc::new(RetentionJob::new(
            "session-retention",
            HOUR,
            store.clone(),
            |now| (Purge::Sessions { expired_before: now }, Some(now)),
        )),
        Arc::new(RetentionJob::new(
            "notification-log-retention",
            DAY,
            store.clone(),
            move |now| {
                let cutoff = now - days(notification_days);
                let purge = Purge::NotificationLogs {
                    notifications_before: cutoff,
                    audit_before: now - days(audit_days),
                    webhooks_deleted_before: cutoff,
                };
                (purge, Some(cutoff))
            },
        )),
        Arc::new(RetentionJob::new(
            "driver-cleanup",
            DAY,
            store,
            |_| (Purge::InactiveDrivers, None),
        )),
        Arc::new(RedeliveryJob::new(webhooks)),
    ]
}
