//! API key middleware
//!
//! Runs in front of every route. A request without a valid
//! `Authorization: Bearer <key>` header is answered with 401 before any
//! handler, and therefore any adapter method, is reached.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use nc_core::api_key::validate_api_key;
use nc_protocol::{bearer_token, AUTHORIZATION};

use super::error::ApiError;
use super::{AppState, RequestId};

pub(crate) async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let rejection = |message: String| {
        let err = ApiError::unauthorized(message);
        match request.extensions().get::<RequestId>() {
            Some(rid) => err.with_request_id(rid.0.clone()),
            None => err,
        }
    };

    let token = match bearer_token(header) {
        Ok(token) => token,
        Err(e) => {
            tracing::debug!("Rejected {} {}: {}", request.method(), request.uri().path(), e);
            return Err(rejection(e.to_string()));
        }
    };

    if !validate_api_key(token, &state.api_key) {
        tracing::warn!(
            "Rejected {} {}: invalid API key",
            request.method(),
            request.uri().path()
        );
        return Err(rejection("Invalid API key".to_string()));
    }

    Ok(next.run(request).await)
}
