use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use utoipa_axum::router::OpenApiRouter;

use crate::{
    error::{AppError, StdResponse},
    models::ReservationEntity,
    reservations::{Availability, NewReservation, SlotQuery},
    state::AppState,
};

/// Public booking routes.
pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    utoipa_axum::router::OpenApiRouter::new().nest(
        "/reservations",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(check_availability))
            .routes(utoipa_axum::routes!(create_reservation)),
    )
}

/// Check whether a party fits into a time slot.
#[utoipa::path(
    get,
    path = "/availability",
    tags = ["Reservations"],
    params(SlotQuery),
    responses(
        (status = 200, description = "Slot availability", body = StdResponse<Availability, String>)
    )
)]
async fn check_availability(
    Query(query): Query<SlotQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let availability = state
        .reservations
        .check_availability(query.date, query.time, query.party_size)
        .await?;

    Ok(StdResponse {
        data: Some(availability),
        message: Some("Get availability successfully"),
    })
}

/// Book a table.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Reservations"],
    request_body = NewReservation,
    responses(
        (status = 201, description = "Reservation created", body = StdResponse<ReservationEntity, String>),
        (status = 409, description = "Slot is full")
    )
)]
async fn create_reservation(
    State(state): State<AppState>,
    Json(body): Json<NewReservation>,
) -> Result<impl IntoResponse, AppError> {
    let reservation = state.reservations.create_reservation(body).await?;

    Ok((
        StatusCode::CREATED,
        StdResponse {
            data: Some(reservation),
            message: Some("Reservation created successfully"),
        },
    ))
}
