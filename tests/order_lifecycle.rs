use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use bistro_orderservice::{
    config::{AppConfig, DatabaseConfig, RetentionConfig, WebhookConfig},
    models::{Actor, CreateDriverEntity, OrderStatus, OrderType, Role},
    notify::{DeliveryError, WebhookTransport},
    orders::{NewOrder, NewOrderItem, TransitionOptions},
    routes,
    state::AppState,
    store::{MemoryStore, Store},
};
use chrono::Utc;
use serde_json::{Value, json};
use tower::ServiceExt;

struct AcceptAll;

#[async_trait]
impl WebhookTransport for AcceptAll {
    async fn post(&self, _url: &str, _body: &Value, _timeout: Duration) -> Result<(), DeliveryError> {
        Ok(())
    }
}

fn config() -> AppConfig {
    AppConfig {
        server_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        database: DatabaseConfig { url: None },
        amqp_url: None,
        instance_id: "test".into(),
        tracking_code_ttl_hours: 24,
        reservation_capacity: 40,
        job_max_duration: Duration::from_secs(300),
        retention: RetentionConfig::default(),
        webhooks: WebhookConfig {
            timeout: Duration::from_secs(1),
            base_delay: Duration::from_millis(1),
            relay_url: None,
        },
    }
}

fn state(store: Arc<MemoryStore>) -> AppState {
    AppState::new(store, &config(), Arc::new(AcceptAll), None)
}

fn ord_100() -> NewOrder {
    NewOrder {
        order_number: Some("ORD-100".into()),
        order_type: OrderType::Delivery,
        customer_name: "Maria Lopez".into(),
        customer_phone: Some("5550142".into()),
        customer_email: Some("maria@example.com".into()),
        delivery_address: Some("48 Harbor Road".into()),
        table_number: None,
        guest_count: None,
        items: vec![
            NewOrderItem {
                menu_item_id: 10,
                name: "Margherita".into(),
                quantity: 2,
                unit_price: 15.0,
            },
            NewOrderItem {
                menu_item_id: 11,
                name: "Tiramisu".into(),
                quantity: 1,
                unit_price: 12.5,
            },
        ],
    }
}

#[tokio::test]
async fn ord_100_from_kitchen_to_reconciled_cash() {
    let store = Arc::new(MemoryStore::new());
    let state = state(store.clone());
    let driver = store
        .create_driver(CreateDriverEntity {
            name: "Sam".into(),
            current_status: "Available".into(),
            active: true,
            user_id: Some(31),
        })
        .await
        .unwrap();

    let created = state.orders.create_order(ord_100()).await.unwrap();
    assert_eq!(created.order.total, 42.5);

    let cashier = Actor::new(Role::Cashier, Some(2));
    let cook = Actor::new(Role::Cook, Some(5));
    let courier = Actor::new(Role::Driver, Some(driver.id));

    for (status, actor) in [
        (OrderStatus::Confirmed, cashier),
        (OrderStatus::Preparing, cook),
        (OrderStatus::Ready, cook),
        (OrderStatus::OutForDelivery, courier),
    ] {
        state
            .orders
            .transition("ORD-100", status, actor, TransitionOptions::default())
            .await
            .unwrap();
    }

    let delivered = state
        .orders
        .transition(
            "ORD-100",
            OrderStatus::Delivered,
            courier,
            TransitionOptions {
                cash_collected: Some(45.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(delivered.driver_id, Some(driver.id));

    let txn = store
        .find_cash_transaction(delivered.id)
        .await
        .unwrap()
        .expect("cash recorded on delivery");
    assert_eq!(txn.amount, 45.0);
    assert_eq!(txn.discrepancy_amount, Some(2.5));
    assert!(!txn.confirmed);

    let err = state
        .orders
        .transition("ORD-100", OrderStatus::Completed, cashier, TransitionOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.message_key(), "errors.validation");

    state.cash.confirm_cash_transaction("ORD-100", None).await.unwrap();
    let verified = state
        .cash
        .verify_cash_transaction("ORD-100", true, None)
        .await
        .unwrap();
    assert!(verified.admin_verified);
    assert_eq!(verified.discrepancy_amount, Some(2.5));

    let summary = state
        .cash
        .get_cash_summary_by_driver_and_date(driver.id, Utc::now().date_naive())
        .await
        .unwrap();
    assert_eq!(summary.cash_total, 45.0);
    assert_eq!(summary.card_total, 0.0);
    assert_eq!(summary.order_count, 1);
    assert_eq!(summary.discrepancy_total, 2.5);

    let completed = state
        .orders
        .transition("ORD-100", OrderStatus::Completed, cashier, TransitionOptions::default())
        .await
        .unwrap();
    assert_eq!(completed.status, "COMPLETED");

    let trail: Vec<(String, String)> = store
        .audit_logs()
        .into_iter()
        .map(|a| (a.from_status, a.to_status))
        .collect();
    assert_eq!(trail.len(), 6);
    assert_eq!(trail.last().unwrap(), &("DELIVERED".to_string(), "COMPLETED".to_string()));
}

async fn send(app: axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn http_surface_enforces_roles_and_masks_tracking() {
    let store = Arc::new(MemoryStore::new());
    let (router, _) = routes::routes_with_openapi().split_for_parts();
    let app = router.with_state(state(store));

    let create = |role: Option<&str>| {
        let mut builder = Request::post("/orders").header("content-type", "application/json");
        if let Some(role) = role {
            builder = builder.header("x-actor-role", role);
        }
        let order = json!({
            "orderNumber": "ORD-100",
            "orderType": "DELIVERY",
            "customerName": "Maria Lopez",
            "deliveryAddress": "48 Harbor Road",
            "items": [
                { "menuItemId": 10, "name": "Margherita", "quantity": 2, "unitPrice": 15.0 },
                { "menuItemId": 11, "name": "Tiramisu", "quantity": 1, "unitPrice": 12.5 }
            ]
        });
        builder.body(Body::from(order.to_string())).unwrap()
    };

    let (status, body) = send(app.clone(), create(None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"]["kind"], "FORBIDDEN");

    let (status, body) = send(app.clone(), create(Some("CUSTOMER"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["order"]["total"], 42.5);
    assert!(body["data"]["order"].get("tracking_code").is_none());
    let code = body["data"]["trackingCode"].as_str().unwrap().to_string();

    let transition = Request::post("/orders/ORD-100/transitions")
        .header("content-type", "application/json")
        .header("x-actor-role", "WAITER")
        .header("x-actor-id", "4")
        .body(Body::from(json!({ "status": "DELIVERED" }).to_string()))
        .unwrap();
    let (status, body) = send(app.clone(), transition).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"]["kind"], "INVALID_TRANSITION");
    assert_eq!(body["message"]["currentStatus"], "PENDING");
    assert_eq!(body["message"]["requestedStatus"], "DELIVERED");

    let tracking = Request::get(format!("/orders/ORD-100/tracking?code={code}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app.clone(), tracking).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["customerName"], "M*********z");
    assert_eq!(body["data"]["status"], "PENDING");
}

#[tokio::test]
async fn drivers_cannot_report_cash_for_other_drivers_orders() {
    let store = Arc::new(MemoryStore::new());
    let state = state(store.clone());
    let mut drivers = Vec::new();
    for name in ["Sam", "Kit"] {
        let driver = store
            .create_driver(CreateDriverEntity {
                name: name.into(),
                current_status: "Available".into(),
                active: true,
                user_id: None,
            })
            .await
            .unwrap();
        drivers.push(driver.id);
    }
    let (owner, stranger) = (drivers[0], drivers[1]);

    state.orders.create_order(ord_100()).await.unwrap();
    let admin = Actor::new(Role::Admin, Some(1));
    for status in [OrderStatus::Confirmed, OrderStatus::Preparing, OrderStatus::Ready] {
        state
            .orders
            .transition("ORD-100", status, admin, TransitionOptions::default())
            .await
            .unwrap();
    }
    state
        .orders
        .transition(
            "ORD-100",
            OrderStatus::OutForDelivery,
            Actor::new(Role::Driver, Some(owner)),
            TransitionOptions::default(),
        )
        .await
        .unwrap();

    let (router, _) = routes::routes_with_openapi().split_for_parts();
    let app = router.with_state(state.clone());
    let report = |driver: i32, amount: f64| {
        Request::post("/cash/orders/ORD-100")
            .header("content-type", "application/json")
            .header("x-actor-role", "DRIVER")
            .header("x-actor-id", driver.to_string())
            .body(Body::from(json!({ "amount": amount }).to_string()))
            .unwrap()
    };

    let (status, body) = send(app.clone(), report(stranger, 0.0)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"]["kind"], "FORBIDDEN");

    let delivered = state
        .orders
        .transition(
            "ORD-100",
            OrderStatus::Delivered,
            Actor::new(Role::Driver, Some(owner)),
            TransitionOptions {
                cash_collected: Some(42.5),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let txn = store
        .find_cash_transaction(delivered.id)
        .await
        .unwrap()
        .expect("cash recorded on delivery");
    assert_eq!(txn.driver_id, Some(owner));
    assert_eq!(txn.amount, 42.5);

    let (status, _) = send(app, report(owner, 42.5)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}
