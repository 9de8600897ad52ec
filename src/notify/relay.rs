use std::time::Duration;

use serde_json::{Value, json};

use super::webhook::DeliveryError;
use crate::models::NotificationKind;

/// Forwards email, SMS and push notifications to a provider gateway over HTTP.
#[derive(Clone)]
pub struct ProviderRelay {
    client: reqwest::Client,
    base_url: String,
}

impl ProviderRelay {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn send(
        &self,
        kind: NotificationKind,
        target: &str,
        content: &Value,
        provider: Option<&str>,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        let url = format!("{}/{}", self.base_url, kind.as_str().to_ascii_lowercase());
        let response = self
            .client
            .post(url)
            .json(&json!({
                "target": target,
                "content": content,
                "provider": provider,
            }))
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

        if response.status().is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status(response.status().as_u16()))
        }
    }
}
