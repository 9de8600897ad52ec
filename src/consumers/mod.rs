//! AMQP consumers that feed device events into the lifecycle engines and
//! notification requests into the dispatcher.

pub mod notifications;
pub mod orders;

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures_lite::StreamExt;
use lapin::{
    Connection, ConnectionProperties,
    message::Delivery,
    options::{BasicConsumeOptions, BasicNackOptions, QueueDeclareOptions},
    types::FieldTable,
};
use tracing::{error, info, warn};

use crate::state::AppState;

pub type Handler = fn(Delivery, Arc<AppState>) -> BoxFuture<'static, Result<()>>;

pub const HANDLERS: &[(&str, Handler)] = &[
    ("orders.status_requested", orders::status_requested),
    ("orders.cash_collected", orders::cash_collected),
    ("notifications.requested", notifications::notification_requested),
];

/// Declares every queue and spawns one consumer loop per handler.
pub async fn start(
    amqp_url: &str,
    service_name: &str,
    state: Arc<AppState>,
    handlers: &[(&'static str, Handler)],
) -> Result<Connection> {
    let conn = Connection::connect(amqp_url, ConnectionProperties::default())
        .await
        .context("Failed to connect to AMQP broker")?;

    for &(queue, handler) in handlers {
        let channel = conn
            .create_channel()
            .await
            .context("Failed to open AMQP channel")?;
        channel
            .queue_declare(
                queue.into(),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to declare queue {queue}"))?;

        let tag = format!("{service_name}.{queue}");
        let mut consumer = channel
            .basic_consume(
                queue.into(),
                tag.as_str().into(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to consume {queue}"))?;

        let state = state.clone();
        tokio::spawn(async move {
            info!(queue, "Consuming");
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        error!(queue, error = %e, "Consumer stream failed");
                        break;
                    }
                };

                let acker = delivery.acker.clone();
                if let Err(e) = handler(delivery, state.clone()).await {
                    warn!(queue, error = %format!("{e:#}"), "Handler failed, dropping message");
                    let nack = BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    };
                    if let Err(e) = acker.nack(nack).await {
                        error!(queue, error = %e, "Failed to nack message");
                    }
                }
            }
            warn!(queue, "Consumer stopped");
        });
    }

    Ok(conn)
}
