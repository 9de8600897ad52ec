use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::{
    models::{OrderStatus, Role},
    store::StoreError,
};

/// Machine-readable error kinds returned to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound,
    InvalidTransition,
    ValidationError,
    Forbidden,
    Conflict,
    RateLimited,
    InternalError,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("{0}")]
    Validation(String),

    #[error("{reason}")]
    Forbidden {
        reason: String,
        required: Vec<Role>,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("Too many attempts, try again later")]
    RateLimited,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn forbidden(reason: impl Into<String>, required: &[Role]) -> Self {
        AppError::Forbidden {
            reason: reason.into(),
            required: required.to_vec(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            AppError::Validation(_) => ErrorKind::ValidationError,
            AppError::Forbidden { .. } => ErrorKind::Forbidden,
            AppError::Conflict(_) => ErrorKind::Conflict,
            AppError::RateLimited => ErrorKind::RateLimited,
            AppError::Other(_) => ErrorKind::InternalError,
        }
    }

    /// Translation key for the client-side message.
    pub fn message_key(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "errors.not_found",
            AppError::InvalidTransition { .. } => "errors.order.invalid_transition",
            AppError::Validation(_) => "errors.validation",
            AppError::Forbidden { .. } => "errors.forbidden",
            AppError::Conflict(_) => "errors.conflict",
            AppError::RateLimited => "errors.rate_limited",
            AppError::Other(_) => "errors.internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidTransition | ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => AppError::NotFound("Record".into()),
            StoreError::UniqueViolation(msg) => AppError::Conflict(msg),
            other => AppError::Other(other.into()),
        }
    }
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message_key: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_status: Option<OrderStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_status: Option<OrderStatus>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required_roles: Vec<Role>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if let AppError::Other(err) = &self {
            tracing::error!("Internal error: {:#}", err);
        }

        let (current_status, requested_status) = match &self {
            AppError::InvalidTransition { from, to } => (Some(*from), Some(*to)),
            _ => (None, None),
        };
        let required_roles = match &self {
            AppError::Forbidden { required, .. } => required.clone(),
            _ => Vec::new(),
        };
        let message = match &self {
            AppError::Other(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let body = ErrorBody {
            kind: self.kind(),
            message_key: self.message_key(),
            message,
            current_status,
            requested_status,
            required_roles,
        };

        (
            status,
            Json(StdResponse::<(), ErrorBody> {
                data: None,
                message: Some(body),
            }),
        )
            .into_response()
    }
}

/// Envelope used by every endpoint.
#[derive(Serialize, ToSchema)]
pub struct StdResponse<T, M> {
    pub data: Option<T>,
    pub message: Option<M>,
}

impl<T: Serialize, M: Serialize> IntoResponse for StdResponse<T, M> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_conflicts_map_to_conflict() {
        let err: AppError = StoreError::UniqueViolation("duplicate".into()).into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn invalid_transition_names_both_statuses() {
        let err = AppError::InvalidTransition {
            from: OrderStatus::Pending,
            to: OrderStatus::Delivered,
        };
        assert_eq!(err.to_string(), "Cannot move order from PENDING to DELIVERED");
        assert_eq!(err.message_key(), "errors.order.invalid_transition");
    }
}
