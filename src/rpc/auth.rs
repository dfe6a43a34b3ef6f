//! Bearer-token middleware
//!
//! Each listener gets its own instance keyed by its own secret type, so a
//! token valid on one listener is never accepted by the other.

use super::error::ApiError;
use crate::error::Error;
use crate::secret::BearerSecret;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

/// Reject the request unless it carries `Authorization: Bearer <secret>`
pub async fn require_bearer<S: BearerSecret>(
    State(secret): State<Arc<S>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| secret.verify(token.trim().as_bytes()))
        .unwrap_or(false);

    if !authorized {
        tracing::debug!(path = %req.uri().path(), "Rejected unauthenticated request");
        return ApiError(Error::Authentication).into_response();
    }
    next.run(req).await
}
