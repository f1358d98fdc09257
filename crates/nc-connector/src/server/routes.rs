//! Facade routes
//!
//! Handlers only marshal: they parse the request, call the adapter and map
//! its errors. No domain state lives here.

use std::collections::BTreeMap;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Extension, Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{from_fn, from_fn_with_state, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};

use nc_core::types::{
    Deployment, DeploymentId, Execution, ExecutionId, ExecutionResult, Node, NodeFilter, NodeId,
    NodeListing,
};
use nc_core::ConnectorError;
use nc_protocol::{CancelRequest, DeployRequest, ExecuteRequest, HealthReport, OperationContext};

use super::auth::require_api_key;
use super::error::ApiError;
use super::{AppState, RequestId};

const REQUEST_ID_HEADER: &str = "x-request-id";

type ApiResult<T> = Result<T, ApiError>;

/// Build the facade router over `state`
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/initialize", post(initialize))
        .route("/shutdown", post(shutdown))
        .route("/nodes", get(list_nodes))
        .route("/nodes/:id/release", post(release_node))
        .route("/deployments", post(deploy))
        .route("/deployments/:id", get(deployment))
        .route("/executions", post(execute))
        .route("/executions/:id", get(status))
        .route("/executions/:id/cancel", post(cancel))
        .route("/executions/:id/result", get(result))
        .layer(from_fn_with_state(state.clone(), require_api_key))
        .layer(from_fn(request_log_middleware))
        .with_state(state)
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

async fn request_log_middleware(headers: HeaderMap, mut request: Request, next: Next) -> Response {
    let rid = request_id(&headers);
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    request.extensions_mut().insert(RequestId(rid.clone()));

    let mut response = next.run(request).await;

    tracing::debug!(
        "connector_api_request request_id={} method={} path={} status={}",
        rid,
        method,
        path,
        response.status().as_u16()
    );
    if let Ok(value) = HeaderValue::from_str(&rid) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Attach the request id to an adapter error
fn fail(rid: &RequestId) -> impl Fn(ConnectorError) -> ApiError + '_ {
    move |err| ApiError::from(err).with_request_id(rid.0.clone())
}

async fn health(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
) -> ApiResult<Json<HealthReport>> {
    let report = state.connector.health().await.map_err(fail(&rid))?;
    Ok(Json(report))
}

async fn initialize(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
) -> ApiResult<StatusCode> {
    state.connector.initialize().await.map_err(fail(&rid))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn shutdown(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
) -> ApiResult<StatusCode> {
    state.connector.shutdown().await.map_err(fail(&rid))?;
    tracing::info!("Shutdown requested over the facade");
    state.shutdown.cancel();
    Ok(StatusCode::NO_CONTENT)
}

async fn list_nodes(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    query: Result<Query<BTreeMap<String, String>>, QueryRejection>,
) -> ApiResult<Json<NodeListing>> {
    let Query(tags) = query.map_err(|e| ApiError::from(e).with_request_id(rid.0.clone()))?;
    let listing = state
        .connector
        .list_nodes(&NodeFilter::from(tags))
        .await
        .map_err(fail(&rid))?;
    Ok(Json(listing))
}

async fn release_node(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<String>,
) -> ApiResult<Json<Node>> {
    let node = state
        .connector
        .release_node(&NodeId::new(id))
        .await
        .map_err(fail(&rid))?;
    Ok(Json(node))
}

async fn deploy(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    body: Result<Json<DeployRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Deployment>)> {
    let Json(req) = body.map_err(|e| ApiError::from(e).with_request_id(rid.0.clone()))?;
    let deployment = state
        .connector
        .deploy_with_context(&req.node_id, req.payload, req.context)
        .await
        .map_err(fail(&rid))?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

async fn deployment(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<String>,
) -> ApiResult<Json<Deployment>> {
    let deployment = state
        .connector
        .deployment(&DeploymentId::new(id))
        .map_err(fail(&rid))?;
    Ok(Json(deployment))
}

async fn execute(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> ApiResult<Json<Execution>> {
    let Json(req) = body.map_err(|e| ApiError::from(e).with_request_id(rid.0.clone()))?;
    let execution = state
        .connector
        .execute_with_context(&req.deployment_id, req.execution_id, req.experiment_id, req.context)
        .await
        .map_err(fail(&rid))?;
    Ok(Json(execution))
}

async fn status(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<String>,
) -> ApiResult<Json<Execution>> {
    let execution = state
        .connector
        .status(&ExecutionId::new(id))
        .await
        .map_err(fail(&rid))?;
    Ok(Json(execution))
}

/// The body is optional; a request without one cancels with no context
async fn cancel(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<String>,
    body: Result<Json<CancelRequest>, JsonRejection>,
) -> ApiResult<Json<Execution>> {
    let context = match body {
        Ok(Json(req)) => req.context,
        Err(JsonRejection::MissingJsonContentType(_)) => OperationContext::new(),
        Err(e) => return Err(ApiError::from(e).with_request_id(rid.0.clone())),
    };
    let execution = state
        .connector
        .cancel_with_context(&ExecutionId::new(id), context)
        .await
        .map_err(fail(&rid))?;
    Ok(Json(execution))
}

async fn result(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Path(id): Path<String>,
) -> ApiResult<Json<ExecutionResult>> {
    let result = state
        .connector
        .result(&ExecutionId::new(id))
        .await
        .map_err(fail(&rid))?;
    Ok(Json(result))
}
