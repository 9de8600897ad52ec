use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    models::{
        CreateNotificationLogEntity, NotificationKind, NotificationLogEntity, NotificationStatus,
        WebhookEntity, WebhookStatus,
    },
    retry::{RetryPolicy, retry_with_backoff},
    store::{Store, StoreError},
};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Endpoint responded with HTTP {0}")]
    Status(u16),

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("No provider configured for {0}")]
    Unconfigured(NotificationKind),
}

/// Outbound POST of a JSON body.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, url: &str, body: &Value, timeout: Duration) -> Result<(), DeliveryError>;
}

#[derive(Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(&self, url: &str, body: &Value, timeout: Duration) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout(timeout)
                } else {
                    DeliveryError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status(status.as_u16()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub webhook_id: uuid::Uuid,
    pub status: NotificationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedeliveryStats {
    pub retried: usize,
    pub recovered: usize,
    pub still_failing: usize,
}

/// Fan-out of events to every active webhook subscription.
#[derive(Clone)]
pub struct WebhookDelivery {
    store: Arc<dyn Store>,
    transport: Arc<dyn WebhookTransport>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl WebhookDelivery {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn WebhookTransport>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            policy,
            timeout,
        }
    }

    /// Delivers `event` to all active subscribers concurrently.
    pub async fn broadcast(&self, event: &str, payload: &Value) -> Result<Vec<DeliveryReport>, StoreError> {
        let webhooks = self.store.list_active_webhooks().await?;
        let deliveries = webhooks
            .iter()
            .map(|webhook| self.deliver(webhook, event, payload));
        Ok(join_all(deliveries).await)
    }

    /// Delivers to one subscriber, dead-lettering on exhausted retries.
    pub async fn deliver(&self, webhook: &WebhookEntity, event: &str, payload: &Value) -> DeliveryReport {
        let body = envelope(webhook, event, payload, Utc::now());
        let outcome = self.post_with_retry(&webhook.url, &body).await;

        let (status, attempts, last_error) = match outcome {
            Ok(attempts) => {
                info!(webhook = %webhook.id, event, attempts, "Webhook delivered");
                (NotificationStatus::Sent, attempts, None)
            }
            Err((err, attempts)) => {
                warn!(
                    webhook = %webhook.id,
                    url = %webhook.url,
                    event,
                    attempts,
                    error = %err,
                    "Webhook delivery failed, writing dead letter"
                );
                let details = json!({
                    "event": event,
                    "error": err.to_string(),
                    "attempts": attempts,
                    "failedAt": Utc::now(),
                });
                if let Err(e) = self.store.record_webhook_failure(webhook.id, details).await {
                    error!(webhook = %webhook.id, error = %e, "Failed to record webhook failure");
                }
                (NotificationStatus::Failed, attempts, Some(err.to_string()))
            }
        };

        let log = CreateNotificationLogEntity {
            kind: NotificationKind::Webhook.as_str().to_string(),
            target: webhook.url.clone(),
            provider: webhook.integration_id.clone(),
            webhook_id: Some(webhook.id),
            event: Some(event.to_string()),
            payload: body,
            status: status.as_str().to_string(),
            attempts: i32::try_from(attempts).unwrap_or(i32::MAX),
            last_error: last_error.clone(),
        };
        if let Err(e) = self.store.insert_notification_log(log).await {
            error!(webhook = %webhook.id, error = %e, "Failed to write notification log");
        }

        DeliveryReport {
            webhook_id: webhook.id,
            status,
            attempts,
            last_error,
        }
    }

    /// Re-sends dead letters created after `created_after` that have been
    /// through fewer than `max_cycles` delivery cycles. Every failed cycle
    /// spends the full retry budget, so the stored attempt count divided by
    /// the policy's attempts is the number of cycles so far.
    pub async fn redeliver_failed(
        &self,
        created_after: DateTime<Utc>,
        max_cycles: u32,
        limit: i64,
    ) -> Result<RedeliveryStats, StoreError> {
        let budget = max_cycles.saturating_mul(self.policy.max_attempts.max(1));
        let max_attempts = i32::try_from(budget).unwrap_or(i32::MAX);
        let failed = self
            .store
            .list_failed_webhook_notifications(created_after, max_attempts, limit)
            .await?;

        let mut stats = RedeliveryStats::default();
        for log in failed {
            stats.retried += 1;
            if self.redeliver(&log).await? {
                stats.recovered += 1;
            } else {
                stats.still_failing += 1;
            }
        }
        Ok(stats)
    }

    async fn redeliver(&self, log: &NotificationLogEntity) -> Result<bool, StoreError> {
        let webhook = match log.webhook_id {
            Some(id) => self.store.find_webhook(id).await?,
            None => None,
        };
        // FAILED subscriptions stay eligible so a recovered endpoint can be restored.
        let Some(webhook) = webhook.filter(|w| {
            w.deleted_at.is_none()
                && (w.status == WebhookStatus::Active.as_str()
                    || w.status == WebhookStatus::Failed.as_str())
        }) else {
            // Subscription is gone; exhaust the record so it is not picked up again.
            self.store
                .update_notification_log(
                    log.id,
                    NotificationStatus::Failed,
                    i32::MAX,
                    Some("Webhook subscription no longer active".into()),
                )
                .await?;
            return Ok(false);
        };

        let (status, used, last_error) = match self.post_with_retry(&webhook.url, &log.payload).await {
            Ok(attempts) => (NotificationStatus::Sent, attempts, None),
            Err((err, attempts)) => (NotificationStatus::Failed, attempts, Some(err.to_string())),
        };
        let attempts = log
            .attempts
            .saturating_add(i32::try_from(used).unwrap_or(i32::MAX));

        self.store
            .update_notification_log(log.id, status, attempts, last_error)
            .await?;

        let sent = status == NotificationStatus::Sent;
        if sent {
            self.store.restore_webhook(webhook.id).await?;
            info!(webhook = %webhook.id, attempts, "Dead letter redelivered");
        }
        Ok(sent)
    }

    async fn post_with_retry(&self, url: &str, body: &Value) -> Result<u32, (DeliveryError, u32)> {
        let timeout = self.timeout;
        let transport = &self.transport;

        retry_with_backoff(
            &self.policy,
            |attempt| async move {
                match tokio::time::timeout(timeout, transport.post(url, body, timeout)).await {
                    Ok(Ok(())) => Ok(attempt),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(DeliveryError::Timeout(timeout)),
                }
            },
            |_| true,
        )
        .await
        .map_err(|e| (e.error, e.attempts))
    }
}

/// JSON body posted to subscribers.
pub fn envelope(webhook: &WebhookEntity, event: &str, payload: &Value, at: DateTime<Utc>) -> Value {
    json!({
        "event": event,
        "payload": payload,
        "webhookId": webhook.id,
        "integrationId": webhook.integration_id,
        "timestamp": at,
    })
}
