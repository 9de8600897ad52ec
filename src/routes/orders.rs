use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;

use crate::{
    error::{AppError, StdResponse},
    middleware,
    models::{Actor, OrderEntity, OrderItemEntity, OrderStatus, Role},
    orders::{CreatedOrder, NewOrder, TransitionOptions, tracking::TrackedOrder},
    routes::require_role,
    state::AppState,
};

const STAFF: &[Role] = &[
    Role::Driver,
    Role::Cook,
    Role::Waiter,
    Role::Cashier,
    Role::Admin,
    Role::Owner,
];

/// Order routes. Guest tracking is added after the caller layer and is
/// authorised by the tracking code alone.
pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    utoipa_axum::router::OpenApiRouter::new().nest(
        "/orders",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(create_order))
            .routes(utoipa_axum::routes!(get_order))
            .routes(utoipa_axum::routes!(transition_order))
            .routes(utoipa_axum::routes!(reissue_tracking_code))
            .route_layer(axum::middleware::from_fn(middleware::actor_authorization))
            .routes(utoipa_axum::routes!(track_order)),
    )
}

#[derive(Serialize, ToSchema)]
pub struct GetOrderRes {
    pub order: OrderEntity,
    pub order_items: Vec<OrderItemEntity>,
}

/// Place a new order.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Orders"],
    request_body = NewOrder,
    responses(
        (status = 201, description = "Order created", body = StdResponse<CreatedOrder, String>),
        (status = 400, description = "Invalid order")
    )
)]
async fn create_order(
    State(state): State<AppState>,
    Extension(_actor): Extension<Actor>,
    Json(body): Json<NewOrder>,
) -> Result<impl IntoResponse, AppError> {
    let created = state.orders.create_order(body).await?;

    Ok((
        StatusCode::CREATED,
        StdResponse {
            data: Some(created),
            message: Some("Order created successfully"),
        },
    ))
}

/// Fetch an order with its items.
#[utoipa::path(
    get,
    path = "/{order_number}",
    tags = ["Orders"],
    params(
        ("order_number" = String, Path, description = "Order number, e.g. ORD-100")
    ),
    responses(
        (status = 200, description = "Get order successfully", body = StdResponse<GetOrderRes, String>),
        (status = 404, description = "Order not found")
    )
)]
async fn get_order(
    Path(order_number): Path<String>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, AppError> {
    require_role(actor, STAFF)?;
    let (order, order_items) = state.orders.get_order(&order_number).await?;

    Ok(StdResponse {
        data: Some(GetOrderRes { order, order_items }),
        message: Some("Get order successfully"),
    })
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransitionReq {
    pub status: OrderStatus,
    #[serde(flatten)]
    pub options: TransitionOptions,
}

/// Move an order to its next status.
#[utoipa::path(
    post,
    path = "/{order_number}/transitions",
    tags = ["Orders"],
    params(
        ("order_number" = String, Path, description = "Order number to move")
    ),
    request_body = TransitionReq,
    responses(
        (status = 200, description = "Order status changed", body = StdResponse<OrderEntity, String>),
        (status = 400, description = "Transition not allowed from the current status"),
        (status = 403, description = "Caller role may not perform this transition"),
        (status = 409, description = "Order changed concurrently")
    )
)]
async fn transition_order(
    Path(order_number): Path<String>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<TransitionReq>,
) -> Result<impl IntoResponse, AppError> {
    let order = state
        .orders
        .transition(&order_number, body.status, actor, body.options)
        .await?;

    Ok(StdResponse {
        data: Some(order),
        message: Some("Order status changed successfully"),
    })
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrackingCodeRes {
    pub tracking_code: String,
}

/// Issue a fresh tracking code, invalidating the previous one.
#[utoipa::path(
    post,
    path = "/{order_number}/tracking-code",
    tags = ["Orders"],
    params(
        ("order_number" = String, Path, description = "Order number")
    ),
    responses(
        (status = 200, description = "Tracking code issued", body = StdResponse<TrackingCodeRes, String>)
    )
)]
async fn reissue_tracking_code(
    Path(order_number): Path<String>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, AppError> {
    require_role(actor, &[Role::Waiter, Role::Cashier, Role::Admin, Role::Owner])?;
    let tracking_code = state.orders.reissue_tracking_code(&order_number).await?;

    Ok(StdResponse {
        data: Some(TrackingCodeRes { tracking_code }),
        message: Some("Tracking code issued successfully"),
    })
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TrackingQuery {
    /// Code handed to the guest when the order was placed.
    pub code: String,
}

/// Track an order as a guest. Personal details are masked.
#[utoipa::path(
    get,
    path = "/{order_number}/tracking",
    tags = ["Tracking"],
    params(
        ("order_number" = String, Path, description = "Order number"),
        TrackingQuery
    ),
    responses(
        (status = 200, description = "Tracked order", body = StdResponse<TrackedOrder, String>),
        (status = 404, description = "Unknown order or invalid code"),
        (status = 429, description = "Too many failed lookups")
    )
)]
async fn track_order(
    Path(order_number): Path<String>,
    Query(query): Query<TrackingQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let order = state.orders.track_order(&order_number, &query.code).await?;

    Ok(StdResponse {
        data: Some(order),
        message: Some("Get tracked order successfully"),
    })
}
