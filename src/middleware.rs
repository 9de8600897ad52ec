use axum::{extract::Request, http::HeaderMap, middleware::Next, response::Response};

use crate::{
    error::AppError,
    models::{Actor, Role},
};

pub const ROLE_HEADER: &str = "x-actor-role";
pub const ACTOR_ID_HEADER: &str = "x-actor-id";

/// Reads the caller set by the gateway and exposes it as `Extension<Actor>`.
pub async fn actor_authorization(mut req: Request, next: Next) -> Result<Response, AppError> {
    let actor = actor_from_headers(req.headers())?;
    req.extensions_mut().insert(actor);
    Ok(next.run(req).await)
}

pub fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, AppError> {
    let role = headers
        .get(ROLE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::forbidden("Missing caller role", Role::ALL))?
        .trim()
        .to_ascii_uppercase()
        .parse::<Role>()
        .map_err(|e| AppError::forbidden(e, Role::ALL))?;

    let id = match headers.get(ACTOR_ID_HEADER) {
        Some(value) => Some(
            value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<i32>().ok())
                .ok_or_else(|| AppError::Validation("Invalid caller id".into()))?,
        ),
        None => None,
    };

    Ok(Actor::new(role, id))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn parses_role_and_id() {
        let mut headers = HeaderMap::new();
        headers.insert(ROLE_HEADER, HeaderValue::from_static("driver"));
        headers.insert(ACTOR_ID_HEADER, HeaderValue::from_static("12"));

        let actor = actor_from_headers(&headers).unwrap();
        assert_eq!(actor, Actor::new(Role::Driver, Some(12)));
    }

    #[test]
    fn missing_or_unknown_role_is_forbidden() {
        let err = actor_from_headers(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let mut headers = HeaderMap::new();
        headers.insert(ROLE_HEADER, HeaderValue::from_static("chef"));
        let err = actor_from_headers(&headers).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }
}
