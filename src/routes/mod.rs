pub mod cash;
pub mod orders;
pub mod reservations;

use utoipa_axum::router::OpenApiRouter;

use crate::{
    error::AppError,
    models::{Actor, Role},
    state::AppState,
};

/// Every HTTP route of the service.
pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    orders::routes_with_openapi()
        .merge(cash::routes_with_openapi())
        .merge(reservations::routes_with_openapi())
}

pub(crate) fn require_role(actor: Actor, allowed: &[Role]) -> Result<(), AppError> {
    if allowed.contains(&actor.role) {
        Ok(())
    } else {
        Err(AppError::forbidden(
            format!("{} is not allowed to do this", actor.role),
            allowed,
        ))
    }
}
