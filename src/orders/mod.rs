//! Order lifecycle engine.

pub mod tracking;
pub mod transitions;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::{
    cash::{CashService, CashTransactionOptions, already_recorded, round_cents},
    error::AppError,
    models::{
        Actor, CreateAuditLogEntity, CreateOrderEntity, CreateOrderItemEntity, DriverStatus,
        OrderAssignment, OrderEntity, OrderItemEntity, OrderStatus, OrderType, Role,
    },
    notify::Dispatcher,
    store::{Store, StoreError},
};

use tracking::{TRACKING_CODE_LEN, TrackedOrder, TrackingGuard, random_code};

const ORDER_NUMBER_PREFIX: &str = "ORD-";
const ORDER_NUMBER_SUFFIX_LEN: usize = 6;

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderItem {
    pub menu_item_id: i32,
    pub name: String,
    pub quantity: i32,
    pub unit_price: f64,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    /// Generated when absent.
    pub order_number: Option<String>,
    pub order_type: OrderType,
    pub customer_name: String,
    pub customer_phone: Option<String>,
    pub customer_email: Option<String>,
    pub delivery_address: Option<String>,
    pub table_number: Option<i32>,
    pub guest_count: Option<i32>,
    pub items: Vec<NewOrderItem>,
}

/// A freshly created order together with the code that unlocks guest tracking.
#[derive(Debug, Clone, serde::Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreatedOrder {
    pub order: OrderEntity,
    pub items: Vec<OrderItemEntity>,
    pub tracking_code: String,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransitionOptions {
    /// Driver handed the order on OUT_FOR_DELIVERY when staff dispatch it.
    pub driver_id: Option<i32>,
    /// Cash the driver collected, only valid on DELIVERED.
    pub cash_collected: Option<f64>,
    pub customer_notes: Option<String>,
}

#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn Store>,
    cash: CashService,
    dispatcher: Arc<Dispatcher>,
    tracking_ttl: Duration,
    tracking_guard: Arc<TrackingGuard>,
}

impl OrderService {
    pub fn new(
        store: Arc<dyn Store>,
        cash: CashService,
        dispatcher: Arc<Dispatcher>,
        tracking_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cash,
            dispatcher,
            tracking_ttl,
            tracking_guard: Arc::new(TrackingGuard::default()),
        }
    }

    pub async fn create_order(&self, new_order: NewOrder) -> Result<CreatedOrder, AppError> {
        validate_new_order(&new_order)?;

        let order_number = match new_order.order_number {
            Some(n) if !n.trim().is_empty() => n.trim().to_string(),
            _ => format!(
                "{ORDER_NUMBER_PREFIX}{}",
                random_code(ORDER_NUMBER_SUFFIX_LEN)
            ),
        };
        let total = round_cents(
            new_order
                .items
                .iter()
                .map(|i| f64::from(i.quantity) * i.unit_price)
                .sum(),
        );
        let tracking_code = random_code(TRACKING_CODE_LEN);
        let expires_at = Utc::now() + self.tracking_ttl;

        let items = new_order
            .items
            .into_iter()
            .map(|i| CreateOrderItemEntity {
                order_id: 0,
                menu_item_id: i.menu_item_id,
                name: i.name,
                quantity: i.quantity,
                unit_price: i.unit_price,
            })
            .collect();

        let (order, items) = self
            .store
            .create_order_with_items(
                CreateOrderEntity {
                    order_number: order_number.clone(),
                    order_type: new_order.order_type.as_str().to_string(),
                    status: OrderStatus::Pending.as_str().to_string(),
                    total,
                    customer_name: new_order.customer_name,
                    customer_phone: new_order.customer_phone,
                    customer_email: new_order.customer_email,
                    delivery_address: new_order.delivery_address,
                    tracking_code: Some(tracking_code.clone()),
                    tracking_code_expires_at: Some(expires_at),
                    table_number: new_order.table_number,
                    guest_count: new_order.guest_count,
                },
                items,
            )
            .await
            .map_err(|e| match e {
                StoreError::UniqueViolation(_) => {
                    AppError::Conflict(format!("Order {order_number} already exists"))
                }
                other => other.into(),
            })?;

        info!(order = %order.order_number, total, order_type = %order.order_type, "Order created");
        self.dispatcher.emit(
            "order.created",
            json!({
                "orderNumber": order.order_number,
                "orderType": order.order_type,
                "total": order.total,
            }),
        );

        Ok(CreatedOrder {
            order,
            items,
            tracking_code,
        })
    }

    pub async fn get_order(
        &self,
        order_number: &str,
    ) -> Result<(OrderEntity, Vec<OrderItemEntity>), AppError> {
        let order = self.find(order_number).await?;
        let items = self.store.find_order_items(order.id).await?;
        Ok((order, items))
    }

    async fn find(&self, order_number: &str) -> Result<OrderEntity, AppError> {
        self.store
            .find_order_by_number(order_number)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Order {order_number}")))
    }

    /// Moves an order along one edge of the status graph.
    ///
    /// Checks run in a fixed order: existence, edge, role, ownership, then
    /// business rules. The status and assignment columns are written by a
    /// single compare-and-set on the current status, so a concurrent move of
    /// the same order yields a conflict instead of a lost update. Cash
    /// collected on delivery is inserted in that same store call.
    pub async fn transition(
        &self,
        order_number: &str,
        target: OrderStatus,
        actor: Actor,
        opts: TransitionOptions,
    ) -> Result<OrderEntity, AppError> {
        let order = self.find(order_number).await?;
        let current = order.status().map_err(anyhow::Error::msg)?;

        let edge = transitions::edge(current, target).ok_or(AppError::InvalidTransition {
            from: current,
            to: target,
        })?;
        if !edge.roles.contains(&actor.role) {
            return Err(AppError::forbidden(
                format!("{} cannot move an order to {target}", actor.role),
                edge.roles,
            ));
        }

        let assignment = self.check_rules(&order, target, actor, &opts).await?;
        let cash = match (target, opts.cash_collected) {
            (OrderStatus::Delivered, Some(amount)) => {
                let notes = CashTransactionOptions {
                    customer_notes: opts.customer_notes,
                };
                self.cash.prepare_for_delivery(&order, amount, notes).await?
            }
            _ => None,
        };

        let moved = match cash {
            Some(cash) => self
                .store
                .update_order_status_with_cash(order_number, current, target, assignment, cash)
                .await
                .map_err(|e| already_recorded(order_number, e))?
                .map(|(order, txn)| {
                    info!(
                        order = order_number,
                        driver = ?txn.driver_id,
                        amount = txn.amount,
                        discrepancy = ?txn.discrepancy_amount,
                        "Cash recorded on delivery"
                    );
                    order
                }),
            None => {
                self.store
                    .update_order_status_by_number(order_number, current, target, assignment)
                    .await?
            }
        };
        let updated = moved.ok_or_else(|| {
            AppError::Conflict(format!(
                "Order {order_number} changed while it was being updated"
            ))
        })?;

        info!(
            order = order_number,
            from = %current,
            to = %target,
            role = %actor.role,
            actor_id = ?actor.id,
            "Order status changed"
        );

        self.after_commit(&updated, current, target, actor).await;
        Ok(updated)
    }

    /// Ownership and business rules for an edge the actor may walk.
    async fn check_rules(
        &self,
        order: &OrderEntity,
        target: OrderStatus,
        actor: Actor,
        opts: &TransitionOptions,
    ) -> Result<OrderAssignment, AppError> {
        if opts.cash_collected.is_some() && target != OrderStatus::Delivered {
            return Err(AppError::Validation(
                "Collected cash can only be reported on delivery".into(),
            ));
        }

        let mut assignment = OrderAssignment::default();
        match target {
            OrderStatus::OutForDelivery => {
                let driver_id = if actor.role == Role::Driver {
                    let id = actor.id.ok_or_else(|| {
                        AppError::forbidden("Driver identity is required", &[Role::Driver])
                    })?;
                    if order.driver_id.is_some_and(|owner| owner != id) {
                        return Err(AppError::forbidden(
                            format!("Order {} is assigned to another driver", order.order_number),
                            &[Role::Cashier, Role::Admin, Role::Owner],
                        ));
                    }
                    id
                } else {
                    opts.driver_id.or(order.driver_id).ok_or_else(|| {
                        AppError::Validation("A driver must be named for dispatch".into())
                    })?
                };

                if order.order_type() != Ok(OrderType::Delivery) {
                    return Err(AppError::Validation(format!(
                        "Order {} is not a delivery order",
                        order.order_number
                    )));
                }
                let driver = self
                    .store
                    .find_driver(driver_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("Driver {driver_id}")))?;
                if !driver.active {
                    return Err(AppError::Validation(format!(
                        "Driver {driver_id} is not active"
                    )));
                }
                assignment.driver_id = Some(driver_id);
            }
            OrderStatus::Delivered => {
                if actor.role == Role::Driver && (actor.id.is_none() || order.driver_id != actor.id) {
                    return Err(AppError::forbidden(
                        format!("Order {} is not assigned to this driver", order.order_number),
                        &[Role::Cashier, Role::Admin, Role::Owner],
                    ));
                }
                if let Some(amount) = opts.cash_collected {
                    if !amount.is_finite() || amount < 0.0 {
                        return Err(AppError::Validation(
                            "Cash amount must be a non-negative number".into(),
                        ));
                    }
                }
            }
            OrderStatus::Completed if order.status() == Ok(OrderStatus::Delivered) => {
                if let Some(txn) = self.cash.find_for_order(order).await? {
                    if !txn.admin_verified {
                        return Err(AppError::Validation(format!(
                            "Cash for order {} must be verified before completion",
                            order.order_number
                        )));
                    }
                }
            }
            _ => {}
        }

        match (target, actor.role) {
            (OrderStatus::Confirmed, Role::Waiter) => assignment.waiter_id = actor.id,
            (OrderStatus::Preparing, Role::Cook) => assignment.cook_id = actor.id,
            (OrderStatus::AwaitingPayment | OrderStatus::Completed, Role::Cashier) => {
                assignment.cashier_id = actor.id
            }
            _ => {}
        }

        Ok(assignment)
    }

    /// Side effects that never undo a committed transition.
    async fn after_commit(
        &self,
        order: &OrderEntity,
        from: OrderStatus,
        to: OrderStatus,
        actor: Actor,
    ) {
        let driver_status = match to {
            OrderStatus::OutForDelivery => Some(DriverStatus::OnDelivery),
            OrderStatus::Delivered => Some(DriverStatus::Available),
            _ => None,
        };
        if let (Some(status), Some(driver_id)) = (driver_status, order.driver_id) {
            if let Err(e) = self.store.set_driver_status(driver_id, status).await {
                warn!(driver = driver_id, error = %e, "Failed to update driver status");
            }
        }

        let audit = CreateAuditLogEntity {
            order_id: order.id,
            actor_role: actor.role.as_str().to_string(),
            actor_id: actor.id,
            from_status: from.as_str().to_string(),
            to_status: to.as_str().to_string(),
        };
        if let Err(e) = self.store.insert_audit_log(audit).await {
            warn!(order = %order.order_number, error = %e, "Failed to write audit log");
        }

        self.dispatcher.emit(
            "order.status_changed",
            json!({
                "orderNumber": order.order_number,
                "from": from,
                "to": to,
                "actorRole": actor.role,
            }),
        );
    }

    pub async fn track_order(
        &self,
        order_number: &str,
        code: &str,
    ) -> Result<TrackedOrder, AppError> {
        self.track_order_at(order_number, code, Utc::now()).await
    }

    /// Guest lookup. Unknown orders, wrong codes and expired codes all read
    /// as not found so the response does not reveal which one it was.
    pub async fn track_order_at(
        &self,
        order_number: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<TrackedOrder, AppError> {
        if self.tracking_guard.is_blocked(order_number) {
            warn!(order = order_number, "Tracking lookups rate limited");
            return Err(AppError::RateLimited);
        }

        let code = code.trim().to_ascii_uppercase();
        let Some(order) = self
            .store
            .get_order_for_tracking(order_number, &code, now)
            .await?
        else {
            if self.store.find_order_by_number(order_number).await?.is_some() {
                self.tracking_guard.record_failure(order_number);
            }
            return Err(AppError::NotFound(format!("Order {order_number}")));
        };

        self.tracking_guard.reset(order_number);
        let items = self.store.find_order_items(order.id).await?;
        Ok(TrackedOrder::masked(order, items))
    }

    /// Mints a new tracking code, invalidating the previous one.
    pub async fn reissue_tracking_code(&self, order_number: &str) -> Result<String, AppError> {
        let order = self.find(order_number).await?;
        let code = random_code(TRACKING_CODE_LEN);
        self.store
            .set_order_tracking(order.id, &code, Utc::now() + self.tracking_ttl)
            .await?;
        info!(order = order_number, "Tracking code reissued");
        Ok(code)
    }
}

fn validate_new_order(order: &NewOrder) -> Result<(), AppError> {
    if order.customer_name.trim().is_empty() {
        return Err(AppError::Validation("Customer name is required".into()));
    }
    if order.items.is_empty() {
        return Err(AppError::Validation("An order needs at least one item".into()));
    }
    if let Some(item) = order
        .items
        .iter()
        .find(|i| i.quantity <= 0 || !i.unit_price.is_finite() || i.unit_price < 0.0)
    {
        return Err(AppError::Validation(format!(
            "Invalid quantity or price for {}",
            item.name
        )));
    }
    match order.order_type {
        OrderType::DineIn if order.table_number.is_none() => Err(AppError::Validation(
            "Dine-in orders need a table number".into(),
        )),
        OrderType::Delivery
            if order
                .delivery_address
                .as_deref()
                .is_none_or(|a| a.trim().is_empty()) =>
        {
            Err(AppError::Validation(
                "Delivery orders need an address".into(),
            ))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::{
        error::ErrorKind,
        models::CreateDriverEntity,
        notify::{WebhookDelivery, webhook::tests::RecordingTransport},
        retry::RetryPolicy,
        store::MemoryStore,
    };

    fn service(store: Arc<MemoryStore>) -> OrderService {
        let policy = RetryPolicy::new(3, StdDuration::from_millis(1), 2);
        let webhooks = WebhookDelivery::new(
            store.clone(),
            Arc::new(RecordingTransport::default()),
            policy,
            StdDuration::from_secs(1),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            webhooks,
            None,
            policy,
            StdDuration::from_secs(1),
        ));
        OrderService::new(
            store.clone(),
            CashService::new(store),
            dispatcher,
            Duration::hours(24),
        )
    }

    fn delivery(number: &str) -> NewOrder {
        NewOrder {
            order_number: Some(number.into()),
            order_type: OrderType::Delivery,
            customer_name: "Johnson".into(),
            customer_phone: Some("5550100".into()),
            customer_email: None,
            delivery_address: Some("12 Elm Street".into()),
            table_number: None,
            guest_count: None,
            items: vec![
                NewOrderItem {
                    menu_item_id: 1,
                    name: "Pizza".into(),
                    quantity: 2,
                    unit_price: 15.0,
                },
                NewOrderItem {
                    menu_item_id: 2,
                    name: "Salad".into(),
                    quantity: 1,
                    unit_price: 12.5,
                },
            ],
        }
    }

    async fn driver(store: &MemoryStore, active: bool) -> i32 {
        store
            .create_driver(CreateDriverEntity {
                name: "Dee".into(),
                current_status: "Available".into(),
                active,
                user_id: None,
            })
            .await
            .unwrap()
            .id
    }

    fn staff(role: Role) -> Actor {
        Actor::new(role, Some(900))
    }

    async fn walk(svc: &OrderService, number: &str, path: &[OrderStatus]) {
        for status in path {
            svc.transition(number, *status, staff(Role::Admin), Default::default())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn create_order_totals_items_and_starts_pending() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store);

        let created = svc.create_order(delivery("ORD-100")).await.unwrap();

        assert_eq!(created.order.total, 42.5);
        assert_eq!(created.order.status, "PENDING");
        assert_eq!(created.items.len(), 2);
        assert_eq!(created.tracking_code.len(), TRACKING_CODE_LEN);
    }

    #[tokio::test]
    async fn generated_order_numbers_are_prefixed() {
        let svc = service(Arc::new(MemoryStore::new()));
        let mut order = delivery("unused");
        order.order_number = None;

        let created = svc.create_order(order).await.unwrap();

        assert!(created.order.order_number.starts_with("ORD-"));
        assert_eq!(created.order.order_number.len(), 10);
    }

    #[tokio::test]
    async fn delivery_without_address_is_rejected() {
        let svc = service(Arc::new(MemoryStore::new()));
        let mut order = delivery("ORD-1");
        order.delivery_address = None;

        let err = svc.create_order(order).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn duplicate_order_number_conflicts() {
        let svc = service(Arc::new(MemoryStore::new()));
        svc.create_order(delivery("ORD-1")).await.unwrap();

        let err = svc.create_order(delivery("ORD-1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn only_graph_edges_are_accepted() {
        for from in OrderStatus::ALL {
            for to in OrderStatus::ALL {
                let store = Arc::new(MemoryStore::new());
                let svc = service(store.clone());
                let number = "ORD-G";
                let (order, _) = store
                    .create_order_with_items(
                        CreateOrderEntity {
                            order_number: number.into(),
                            order_type: "DINE_IN".into(),
                            status: from.as_str().into(),
                            total: 10.0,
                            customer_name: "Ada".into(),
                            customer_phone: None,
                            customer_email: None,
                            delivery_address: None,
                            tracking_code: None,
                            tracking_code_expires_at: None,
                            table_number: Some(4),
                            guest_count: Some(2),
                        },
                        Vec::new(),
                    )
                    .await
                    .unwrap();

                let result = svc
                    .transition(number, *to, staff(Role::Owner), Default::default())
                    .await;

                match transitions::edge(*from, *to) {
                    None => {
                        let err = result.unwrap_err();
                        assert_eq!(err.kind(), ErrorKind::InvalidTransition, "{from} -> {to}");
                    }
                    // Dispatch needs a delivery order and a named driver.
                    Some(_) if *to == OrderStatus::OutForDelivery => {
                        assert_eq!(result.unwrap_err().kind(), ErrorKind::ValidationError);
                    }
                    Some(_) => {
                        let moved = result.unwrap();
                        assert_eq!(moved.status, to.as_str(), "{from} -> {to}");
                        assert_eq!(moved.id, order.id);
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn invalid_transition_reports_both_statuses() {
        let svc = service(Arc::new(MemoryStore::new()));
        svc.create_order(delivery("ORD-1")).await.unwrap();

        let err = svc
            .transition("ORD-1", OrderStatus::Delivered, staff(Role::Admin), Default::default())
            .await
            .unwrap_err();

        match err {
            AppError::InvalidTransition { from, to } => {
                assert_eq!(from, OrderStatus::Pending);
                assert_eq!(to, OrderStatus::Delivered);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn same_status_is_rejected() {
        let svc = service(Arc::new(MemoryStore::new()));
        svc.create_order(delivery("ORD-1")).await.unwrap();

        let err = svc
            .transition("ORD-1", OrderStatus::Pending, staff(Role::Admin), Default::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn missing_order_is_not_found() {
        let svc = service(Arc::new(MemoryStore::new()));
        let err = svc
            .transition("ORD-404", OrderStatus::Confirmed, staff(Role::Admin), Default::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn drivers_are_limited_to_their_own_deliveries() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store.clone());
        let own = driver(&store, true).await;
        let other = driver(&store, true).await;
        svc.create_order(delivery("ORD-1")).await.unwrap();

        let err = svc
            .transition("ORD-1", OrderStatus::Confirmed, Actor::new(Role::Driver, Some(own)), Default::default())
            .await
            .unwrap_err();
        match &err {
            AppError::Forbidden { required, .. } => assert!(!required.contains(&Role::Driver)),
            other => panic!("unexpected error {other:?}"),
        }

        walk(&svc, "ORD-1", &[OrderStatus::Confirmed, OrderStatus::Preparing, OrderStatus::Ready]).await;
        let claimed = svc
            .transition("ORD-1", OrderStatus::OutForDelivery, Actor::new(Role::Driver, Some(own)), Default::default())
            .await
            .unwrap();
        assert_eq!(claimed.driver_id, Some(own));
        let status = store.find_driver(own).await.unwrap().unwrap().current_status;
        assert_eq!(status, "On Delivery");

        let err = svc
            .transition("ORD-1", OrderStatus::Delivered, Actor::new(Role::Driver, Some(other)), Default::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        svc.transition("ORD-1", OrderStatus::Delivered, Actor::new(Role::Driver, Some(own)), Default::default())
            .await
            .unwrap();
        let status = store.find_driver(own).await.unwrap().unwrap().current_status;
        assert_eq!(status, "Available");
    }

    #[tokio::test]
    async fn staff_dispatch_needs_an_active_driver() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store.clone());
        let idle = driver(&store, false).await;
        svc.create_order(delivery("ORD-1")).await.unwrap();
        walk(&svc, "ORD-1", &[OrderStatus::Confirmed, OrderStatus::Preparing, OrderStatus::Ready]).await;

        let err = svc
            .transition(
                "ORD-1",
                OrderStatus::OutForDelivery,
                staff(Role::Cashier),
                TransitionOptions {
                    driver_id: Some(idle),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn role_assignment_is_written_with_status() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store.clone());
        svc.create_order(delivery("ORD-1")).await.unwrap();

        svc.transition("ORD-1", OrderStatus::Confirmed, Actor::new(Role::Waiter, Some(7)), Default::default())
            .await
            .unwrap();
        let order = svc
            .transition("ORD-1", OrderStatus::Preparing, Actor::new(Role::Cook, Some(8)), Default::default())
            .await
            .unwrap();

        assert_eq!(order.waiter_id, Some(7));
        assert_eq!(order.cook_id, Some(8));
    }

    #[tokio::test]
    async fn transitions_are_audited() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store.clone());
        svc.create_order(delivery("ORD-1")).await.unwrap();

        svc.transition("ORD-1", OrderStatus::Cancelled, Actor::new(Role::Cashier, Some(3)), Default::default())
            .await
            .unwrap();

        let logs = store.audit_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].from_status, "PENDING");
        assert_eq!(logs[0].to_status, "CANCELLED");
        assert_eq!(logs[0].actor_role, "CASHIER");
        assert_eq!(logs[0].actor_id, Some(3));
    }

    #[tokio::test]
    async fn settlement_waits_for_admin_verification() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store.clone());
        let own = driver(&store, true).await;
        svc.create_order(delivery("ORD-1")).await.unwrap();
        walk(&svc, "ORD-1", &[OrderStatus::Confirmed, OrderStatus::Preparing, OrderStatus::Ready]).await;
        svc.transition(
            "ORD-1",
            OrderStatus::OutForDelivery,
            staff(Role::Cashier),
            TransitionOptions {
                driver_id: Some(own),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        svc.transition(
            "ORD-1",
            OrderStatus::Delivered,
            Actor::new(Role::Driver, Some(own)),
            TransitionOptions {
                cash_collected: Some(42.5),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let err = svc
            .transition("ORD-1", OrderStatus::Completed, staff(Role::Cashier), Default::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        svc.cash.confirm_cash_transaction("ORD-1", None).await.unwrap();
        svc.cash.verify_cash_transaction("ORD-1", true, None).await.unwrap();
        let done = svc
            .transition("ORD-1", OrderStatus::Completed, staff(Role::Cashier), Default::default())
            .await
            .unwrap();
        assert_eq!(done.status, "COMPLETED");
        assert_eq!(done.cashier_id, Some(900));
    }

    async fn out_for_delivery(svc: &OrderService, store: &MemoryStore, number: &str) -> i32 {
        let own = driver(store, true).await;
        svc.create_order(delivery(number)).await.unwrap();
        walk(svc, number, &[OrderStatus::Confirmed, OrderStatus::Preparing, OrderStatus::Ready]).await;
        svc.transition(number, OrderStatus::OutForDelivery, Actor::new(Role::Driver, Some(own)), Default::default())
            .await
            .unwrap();
        own
    }

    fn with_cash(amount: f64) -> TransitionOptions {
        TransitionOptions {
            cash_collected: Some(amount),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn failed_cash_write_leaves_the_order_undelivered() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store.clone());
        let own = out_for_delivery(&svc, &store, "ORD-1").await;
        let courier = Actor::new(Role::Driver, Some(own));

        store.fail_next_cash_inserts(1);
        let err = svc
            .transition("ORD-1", OrderStatus::Delivered, courier, with_cash(42.5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalError);

        let order = store.find_order_by_number("ORD-1").await.unwrap().unwrap();
        assert_eq!(order.status, "OUT_FOR_DELIVERY");
        assert!(store.find_cash_transaction(order.id).await.unwrap().is_none());
        assert!(store.audit_logs().iter().all(|a| a.to_status != "DELIVERED"));

        let delivered = svc
            .transition("ORD-1", OrderStatus::Delivered, courier, with_cash(42.5))
            .await
            .unwrap();
        let txn = store.find_cash_transaction(delivered.id).await.unwrap().unwrap();
        assert_eq!(txn.amount, 42.5);
        assert_eq!(txn.driver_id, Some(own));
    }

    #[tokio::test]
    async fn delivery_cash_disagreeing_with_record_conflicts() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store.clone());
        let own = out_for_delivery(&svc, &store, "ORD-1").await;
        svc.cash
            .create_cash_transaction_for_order("ORD-1", Some(own), 0.0, Default::default())
            .await
            .unwrap();

        let err = svc
            .transition("ORD-1", OrderStatus::Delivered, Actor::new(Role::Driver, Some(own)), with_cash(20.0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let order = store.find_order_by_number("ORD-1").await.unwrap().unwrap();
        assert_eq!(order.status, "OUT_FOR_DELIVERY");
    }

    #[tokio::test]
    async fn matching_cash_already_on_record_is_not_duplicated() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store.clone());
        let own = out_for_delivery(&svc, &store, "ORD-1").await;
        svc.cash
            .create_cash_transaction_for_order("ORD-1", Some(own), 42.5, Default::default())
            .await
            .unwrap();

        let delivered = svc
            .transition("ORD-1", OrderStatus::Delivered, Actor::new(Role::Driver, Some(own)), with_cash(42.5))
            .await
            .unwrap();
        assert_eq!(delivered.status, "DELIVERED");
    }

    #[tokio::test]
    async fn tracking_requires_matching_unexpired_code() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store);
        let created = svc.create_order(delivery("ORD-1")).await.unwrap();

        let tracked = svc
            .track_order("ORD-1", &created.tracking_code.to_lowercase())
            .await
            .unwrap();
        assert_eq!(tracked.customer_name, "J*****n");
        assert_eq!(tracked.delivery_address.as_deref(), Some("1***********t"));
        assert_eq!(tracked.items.len(), 2);

        let err = svc.track_order("ORD-1", "WRONG123").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let later = Utc::now() + Duration::hours(25);
        let err = svc
            .track_order_at("ORD-1", &created.tracking_code, later)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn repeated_bad_codes_are_rate_limited() {
        let svc = service(Arc::new(MemoryStore::new()));
        let created = svc.create_order(delivery("ORD-1")).await.unwrap();

        for _ in 0..5 {
            let _ = svc.track_order("ORD-1", "GUESS000").await;
        }
        let err = svc
            .track_order("ORD-1", &created.tracking_code)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn lookups_of_unknown_orders_are_not_counted() {
        let svc = service(Arc::new(MemoryStore::new()));
        svc.create_order(delivery("ORD-1")).await.unwrap();

        for n in 0..1000 {
            let err = svc
                .track_order(&format!("ORD-X{n}"), "GUESS000")
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound);
        }
        assert_eq!(svc.tracking_guard.tracked(), 0);

        let _ = svc.track_order("ORD-1", "GUESS000").await;
        assert_eq!(svc.tracking_guard.tracked(), 1);
    }

    #[tokio::test]
    async fn reissued_code_replaces_the_old_one() {
        let svc = service(Arc::new(MemoryStore::new()));
        let created = svc.create_order(delivery("ORD-1")).await.unwrap();

        let fresh = svc.reissue_tracking_code("ORD-1").await.unwrap();

        if fresh != created.tracking_code {
            assert!(svc.track_order("ORD-1", &created.tracking_code).await.is_err());
        }
        assert!(svc.track_order("ORD-1", &fresh).await.is_ok());
    }
}
