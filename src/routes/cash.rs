use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;

use crate::{
    cash::{CashSummary, CashTransactionOptions, CountedCash},
    error::{AppError, StdResponse},
    middleware,
    models::{Actor, CashTransactionEntity, Role},
    routes::require_role,
    state::AppState,
};

const TILL: &[Role] = &[Role::Cashier, Role::Admin, Role::Owner];
const MANAGEMENT: &[Role] = &[Role::Admin, Role::Owner];

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    utoipa_axum::router::OpenApiRouter::new().nest(
        "/cash",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(create_cash_transaction))
            .routes(utoipa_axum::routes!(confirm_cash_transaction))
            .routes(utoipa_axum::routes!(verify_cash_transaction))
            .routes(utoipa_axum::routes!(get_cash_summary))
            .route_layer(axum::middleware::from_fn(middleware::actor_authorization)),
    )
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateCashTransactionReq {
    /// Ignored when a driver reports the cash; the caller is recorded instead.
    pub driver_id: Option<i32>,
    pub amount: f64,
    #[serde(flatten)]
    pub options: CashTransactionOptions,
}

/// Record the cash collected for an order.
#[utoipa::path(
    post,
    path = "/orders/{order_number}",
    tags = ["Cash"],
    params(
        ("order_number" = String, Path, description = "Order the cash belongs to")
    ),
    request_body = CreateCashTransactionReq,
    responses(
        (status = 201, description = "Cash transaction created", body = StdResponse<CashTransactionEntity, String>),
        (status = 403, description = "Order is not assigned to the reporting driver"),
        (status = 409, description = "Order already has a cash transaction")
    )
)]
async fn create_cash_transaction(
    Path(order_number): Path<String>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<CreateCashTransactionReq>,
) -> Result<impl IntoResponse, AppError> {
    require_role(actor, &[Role::Driver, Role::Cashier, Role::Admin, Role::Owner])?;

    let txn = state
        .cash
        .report_collected_cash(&order_number, actor, body.driver_id, body.amount, body.options)
        .await?;

    Ok((
        StatusCode::CREATED,
        StdResponse {
            data: Some(txn),
            message: Some("Cash transaction created successfully"),
        },
    ))
}

#[derive(Deserialize, Default, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmCashReq {
    pub payment_timestamp: Option<DateTime<Utc>>,
}

/// Confirm that the cashier received the cash.
#[utoipa::path(
    post,
    path = "/orders/{order_number}/confirm",
    tags = ["Cash"],
    params(
        ("order_number" = String, Path, description = "Order the cash belongs to")
    ),
    request_body = ConfirmCashReq,
    responses(
        (status = 200, description = "Cash confirmed", body = StdResponse<CashTransactionEntity, String>),
        (status = 404, description = "No cash transaction for the order")
    )
)]
async fn confirm_cash_transaction(
    Path(order_number): Path<String>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    body: Option<Json<ConfirmCashReq>>,
) -> Result<impl IntoResponse, AppError> {
    require_role(actor, TILL)?;
    let Json(body) = body.unwrap_or_default();

    let txn = state
        .cash
        .confirm_cash_transaction(&order_number, body.payment_timestamp)
        .await?;

    Ok(StdResponse {
        data: Some(txn),
        message: Some("Cash transaction confirmed successfully"),
    })
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyCashReq {
    pub admin_verified: bool,
    pub counted: Option<CountedCash>,
}

/// Admin sign-off on a confirmed cash transaction.
#[utoipa::path(
    post,
    path = "/orders/{order_number}/verify",
    tags = ["Cash"],
    params(
        ("order_number" = String, Path, description = "Order the cash belongs to")
    ),
    request_body = VerifyCashReq,
    responses(
        (status = 200, description = "Cash verified", body = StdResponse<CashTransactionEntity, String>),
        (status = 400, description = "Cash not confirmed yet")
    )
)]
async fn verify_cash_transaction(
    Path(order_number): Path<String>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<VerifyCashReq>,
) -> Result<impl IntoResponse, AppError> {
    require_role(actor, MANAGEMENT)?;

    let txn = state
        .cash
        .verify_cash_transaction(&order_number, body.admin_verified, body.counted)
        .await?;

    Ok(StdResponse {
        data: Some(txn),
        message: Some("Cash transaction verified successfully"),
    })
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SummaryQuery {
    pub date: NaiveDate,
    /// Limits the summary to one driver.
    pub driver_id: Option<i32>,
}

/// Daily cash and card totals.
#[utoipa::path(
    get,
    path = "/summary",
    tags = ["Cash"],
    params(SummaryQuery),
    responses(
        (status = 200, description = "Cash summary", body = StdResponse<CashSummary, String>)
    )
)]
async fn get_cash_summary(
    Query(query): Query<SummaryQuery>,
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, AppError> {
    let driver_id = match actor.role {
        // Drivers only see their own totals.
        Role::Driver => Some(actor.id.ok_or_else(|| {
            AppError::forbidden("Driver identity is required", &[Role::Driver])
        })?),
        _ => {
            require_role(actor, TILL)?;
            query.driver_id
        }
    };

    let summary = match driver_id {
        Some(driver_id) => {
            state
                .cash
                .get_cash_summary_by_driver_and_date(driver_id, query.date)
                .await?
        }
        None => state.cash.get_cash_summary_by_date(query.date).await?,
    };

    Ok(StdResponse {
        data: Some(summary),
        message: Some("Get cash summary successfully"),
    })
}
