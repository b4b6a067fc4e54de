//! HTTP and WebSocket surface.

pub mod auth;
pub mod bins;
pub mod moves;
pub mod server;
pub mod shifts;
pub mod ws;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::fleet::errors::FleetError;

/// Web-layer error: a classified fleet error plus its HTTP mapping. Every
/// handler returns `{"error": "..."}` with the mapped status; internal
/// details are logged, never sent.
#[derive(Debug)]
pub struct WebError(pub FleetError);

impl From<FleetError> for WebError {
    fn from(err: FleetError) -> Self {
        WebError(err)
    }
}

impl std::fmt::Display for WebError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            FleetError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            FleetError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            FleetError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            FleetError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            FleetError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            FleetError::External { provider, .. } => {
                tracing::error!(error = %self.0, "provider failure surfaced to client");
                (
                    StatusCode::BAD_GATEWAY,
                    format!("{} provider unavailable", provider),
                )
            }
            FleetError::Internal(_) => {
                tracing::error!(error = %self.0, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<Json<T>, WebError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: FleetError) -> StatusCode {
        WebError(err).into_response().status()
    }

    #[test]
    fn taxonomy_maps_to_statuses() {
        assert_eq!(
            status_of(FleetError::validation("bad")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(FleetError::Auth("no".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(FleetError::Forbidden("no".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(FleetError::not_found("gone")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(FleetError::conflict("dup")),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(FleetError::External {
                provider: "snap",
                detail: "down".into()
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(FleetError::internal("boom")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_detail_is_opaque() {
        let response = WebError(FleetError::internal("connection string leaked")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        // The body is the generic message; details only reach the log.
    }
}
