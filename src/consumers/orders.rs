use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use lapin::{message::Delivery, options::BasicAckOptions};
use serde::Deserialize;
use tracing::info;

use crate::{
    cash::CashTransactionOptions,
    models::{Actor, OrderStatus, Role},
    orders::TransitionOptions,
    state::AppState,
};

/// Published by kitchen and driver devices.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequestedEvent {
    pub order_number: String,
    pub status: OrderStatus,
    pub role: Role,
    pub actor_id: Option<i32>,
    #[serde(default)]
    pub driver_id: Option<i32>,
    #[serde(default)]
    pub cash_collected: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashCollectedEvent {
    pub order_number: String,
    pub driver_id: Option<i32>,
    pub amount: f64,
    #[serde(default)]
    pub customer_notes: Option<String>,
}

pub fn status_requested(delivery: Delivery, state: Arc<AppState>) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let payload: StatusRequestedEvent = serde_json::from_str(str::from_utf8(&delivery.data)?)?;
        info!("Received event: {:?}", payload);

        let order = state
            .orders
            .transition(
                &payload.order_number,
                payload.status,
                Actor::new(payload.role, payload.actor_id),
                TransitionOptions {
                    driver_id: payload.driver_id,
                    cash_collected: payload.cash_collected,
                    customer_notes: None,
                },
            )
            .await?;

        info!("Order {} moved to {}", order.order_number, order.status);

        delivery.ack(BasicAckOptions::default()).await?;

        Ok(())
    })
}

pub fn cash_collected(delivery: Delivery, state: Arc<AppState>) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let payload: CashCollectedEvent = serde_json::from_str(str::from_utf8(&delivery.data)?)?;
        info!("Received event: {:?}", payload);

        let txn = state
            .cash
            .create_cash_transaction_for_order(
                &payload.order_number,
                payload.driver_id,
                payload.amount,
                CashTransactionOptions {
                    customer_notes: payload.customer_notes,
                },
            )
            .await?;

        info!(
            "Cash {:.2} recorded for order {}",
            txn.amount, payload.order_number
        );

        delivery.ack(BasicAckOptions::default()).await?;

        Ok(())
    })
}
