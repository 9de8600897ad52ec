//! Notification dispatcher.
//!
//! Delivery failures are recorded in `notification_logs` and never surface to
//! the operation that triggered the notification.

pub mod relay;
pub mod webhook;

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tracing::{error, warn};

use crate::{
    models::{CreateNotificationLogEntity, NotificationKind, NotificationStatus},
    retry::{RetryPolicy, retry_with_backoff},
    store::Store,
};

pub use relay::ProviderRelay;
pub use webhook::{DeliveryError, HttpTransport, WebhookDelivery, WebhookTransport};

pub struct Dispatcher {
    store: Arc<dyn Store>,
    webhooks: WebhookDelivery,
    relay: Option<ProviderRelay>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        webhooks: WebhookDelivery,
        relay: Option<ProviderRelay>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            webhooks,
            relay,
            policy,
            timeout,
        }
    }

    pub fn webhooks(&self) -> &WebhookDelivery {
        &self.webhooks
    }

    /// Delivers one notification and returns the recorded outcome.
    ///
    /// For [`NotificationKind::Webhook`] the `target` is the event name and the
    /// notification fans out to every active subscription.
    pub async fn dispatch(
        &self,
        kind: NotificationKind,
        target: &str,
        content: Value,
        provider: Option<String>,
    ) -> NotificationStatus {
        match kind {
            NotificationKind::Webhook => self.dispatch_webhook(target, &content).await,
            NotificationKind::Email | NotificationKind::Sms | NotificationKind::Push => {
                self.dispatch_via_relay(kind, target, content, provider).await
            }
        }
    }

    /// Spawns [`Dispatcher::dispatch`] for a webhook event without waiting for it.
    pub fn emit(self: &Arc<Self>, event: &str, payload: Value) {
        let dispatcher = Arc::clone(self);
        let event = event.to_string();
        tokio::spawn(async move {
            dispatcher
                .dispatch(NotificationKind::Webhook, &event, payload, None)
                .await;
        });
    }

    async fn dispatch_webhook(&self, event: &str, payload: &Value) -> NotificationStatus {
        match self.webhooks.broadcast(event, payload).await {
            Ok(reports) if reports.iter().all(|r| r.status == NotificationStatus::Sent) => {
                NotificationStatus::Sent
            }
            Ok(_) => NotificationStatus::Failed,
            Err(e) => {
                error!(event, error = %e, "Failed to load webhook subscriptions");
                NotificationStatus::Failed
            }
        }
    }

    async fn dispatch_via_relay(
        &self,
        kind: NotificationKind,
        target: &str,
        content: Value,
        provider: Option<String>,
    ) -> NotificationStatus {
        let outcome = match &self.relay {
            Some(relay) => {
                let timeout = self.timeout;
                let content = &content;
                let provider = provider.as_deref();
                retry_with_backoff(
                    &self.policy,
                    |attempt| async move {
                        relay
                            .send(kind, target, content, provider, timeout)
                            .await
                            .map(|()| attempt)
                    },
                    |e| !matches!(e, DeliveryError::Unconfigured(_)),
                )
                .await
                .map_err(|e| (e.error, e.attempts))
            }
            None => Err((DeliveryError::Unconfigured(kind), 1)),
        };

        let (status, attempts, last_error) = match outcome {
            Ok(attempts) => (NotificationStatus::Sent, attempts, None),
            Err((err, attempts)) => {
                warn!(kind = %kind, target, attempts, error = %err, "Notification delivery failed");
                (NotificationStatus::Failed, attempts, Some(err.to_string()))
            }
        };

        let log = CreateNotificationLogEntity {
            kind: kind.as_str().to_string(),
            target: target.to_string(),
            provider,
            webhook_id: None,
            event: None,
            payload: content,
            status: status.as_str().to_string(),
            attempts: i32::try_from(attempts).unwrap_or(i32::MAX),
            last_error,
        };
        if let Err(e) = self.store.insert_notification_log(log).await {
            error!(kind = %kind, error = %e, "Failed to write notification log");
        }

        status
    }
}
