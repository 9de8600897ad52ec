use std::sync::Arc;

use chrono::Duration;

use crate::{
    cash::CashService,
    config::AppConfig,
    notify::{Dispatcher, ProviderRelay, WebhookDelivery, WebhookTransport},
    orders::OrderService,
    reservations::ReservationService,
    retry::RetryPolicy,
    store::Store,
};

/// Shared by every handler and consumer.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub orders: OrderService,
    pub cash: CashService,
    pub reservations: ReservationService,
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        config: &AppConfig,
        transport: Arc<dyn WebhookTransport>,
        relay: Option<ProviderRelay>,
    ) -> Self {
        let policy = RetryPolicy::new(3, config.webhooks.base_delay, 2);
        let webhooks =
            WebhookDelivery::new(store.clone(), transport, policy, config.webhooks.timeout);
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            webhooks,
            relay,
            policy,
            config.webhooks.timeout,
        ));

        let cash = CashService::new(store.clone());
        let orders = OrderService::new(
            store.clone(),
            cash.clone(),
            dispatcher.clone(),
            Duration::hours(config.tracking_code_ttl_hours),
        );
        let reservations = ReservationService::new(store.clone(), config.reservation_capacity);

        Self {
            store,
            orders,
            cash,
            reservations,
            dispatcher,
        }
    }
}
