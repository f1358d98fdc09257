//! HTTP error mapping for facade handlers

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use nc_core::ConnectorError;
use nc_protocol::{ErrorBody, ErrorCode};

/// Error returned by a facade handler
#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
    request_id: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl From<ConnectorError> for ApiError {
    fn from(err: ConnectorError) -> Self {
        let code = err.kind().code();
        if code == ErrorCode::Internal {
            tracing::error!("Request failed: {}", err);
        }
        Self::new(code, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            code: self.code,
            message: self.message,
            request_id: self.request_id,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nc_core::types::{ExecutionId, ExecutionState, NodeId, NodeState};
    use nc_core::BackendError;
    use std::time::Duration;

    fn status_of(err: ConnectorError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_error_kinds_map_to_distinct_statuses() {
        assert_eq!(
            status_of(ConnectorError::NodeNotFound(NodeId::new("n1"))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(ConnectorError::NodeBusy {
                node: NodeId::new("n1"),
                state: NodeState::Busy
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(ConnectorError::ResultNotReady {
                execution: ExecutionId::new("e1"),
                state: ExecutionState::Running
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(ConnectorError::from_backend(BackendError::Timeout(
                Duration::from_secs(30)
            ))),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(ConnectorError::from_backend(BackendError::Internal("boom".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_error_body_carries_request_id() {
        let response = ApiError::unauthorized("missing credential")
            .with_request_id("req-1")
            .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.code, ErrorCode::Unauthorized);
        assert_eq!(body.request_id.as_deref(), Some("req-1"));
    }
}
