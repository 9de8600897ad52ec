use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use lapin::{message::Delivery, options::BasicAckOptions};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::{models::NotificationKind, state::AppState};

/// Published by other services that want a customer or subscriber notified.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequestedEvent {
    /// EMAIL, SMS, PUSH or WEBHOOK; anything else is delivered as a webhook.
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub provider: Option<String>,
}

impl NotificationRequestedEvent {
    pub fn kind(&self) -> NotificationKind {
        NotificationKind::parse_or_webhook(&self.kind)
    }
}

pub fn notification_requested(
    delivery: Delivery,
    state: Arc<AppState>,
) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let payload: NotificationRequestedEvent =
            serde_json::from_str(str::from_utf8(&delivery.data)?)?;
        info!("Received event: {:?}", payload);

        let kind = payload.kind();
        let status = state
            .dispatcher
            .dispatch(kind, &payload.target, payload.content, payload.provider)
            .await;

        info!("{} notification to {} finished as {}", kind, payload.target, status);

        delivery.ack(BasicAckOptions::default()).await?;

        Ok(())
    })
}
