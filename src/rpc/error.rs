//! Error responses shared by both listeners

use crate::error::Error;
use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Handler error that renders as `{"error": {"code", "message"}}`
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::BadRequest(rejection.body_text()))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Config(_) | Error::UnknownAgent(_) | Error::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Authentication => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidState(_) => StatusCode::CONFLICT,
            Error::Discovery { .. } => StatusCode::BAD_GATEWAY,
            Error::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(code = self.0.code(), "Request failed: {}", self.0);
        }
        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Fallback route; installed before the auth layer so unknown paths also need a token
pub async fn route_not_found(uri: Uri) -> ApiError {
    ApiError(Error::NotFound(format!("no route for {}", uri.path())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::UnknownAgent("x".into()), StatusCode::BAD_REQUEST),
            (Error::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (Error::Authentication, StatusCode::UNAUTHORIZED),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::InvalidState("x".into()), StatusCode::CONFLICT),
            (Error::discovery("codex", "timeout"), StatusCode::BAD_GATEWAY),
            (Error::Busy("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::Store("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }

    #[tokio::test]
    async fn test_body_shape() {
        let resp = ApiError(Error::NotFound("run r1".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 64).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"]["code"], "NOT_FOUND");
        assert_eq!(json["error"]["message"], "Not found: run r1");
    }
}
