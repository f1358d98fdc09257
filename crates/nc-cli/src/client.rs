//! HTTP client for a remote connector facade
//!
//! `RemoteConnector` offers the same operation set as the in-process
//! adapter. Every request carries the API key; non-2xx responses are decoded
//! from the facade's error envelope so callers keep the error category.
//!
//! Ids are caller-chosen strings, so each one is pushed as a single
//! percent-encoded path segment.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use nc_protocol::{
    bearer_value, CancelRequest, DeployRequest, Deployment, DeploymentId, ErrorBody, ErrorCode,
    ExecuteRequest, Execution, ExecutionId, ExecutionResult, HealthReport, Node, NodeFilter,
    NodeId, NodeListing, OperationContext, AUTHORIZATION,
};

/// Default facade address
pub const DEFAULT_URL: &str = "http://127.0.0.1:26512";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors returned by [`RemoteConnector`]
#[derive(Error, Debug)]
pub enum ClientError {
    /// The request did not produce a response
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The facade answered with an error envelope
    #[error("{code} ({status}): {message}")]
    Api {
        status: u16,
        code: ErrorCode,
        message: String,
        request_id: Option<String>,
    },

    #[error("Invalid connector URL: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    /// Error category, mirroring the adapter's error kinds
    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::Api { code, .. } => *code,
            ClientError::Http(e) if e.is_connect() || e.is_timeout() => ErrorCode::Unavailable,
            ClientError::Http(e) if e.is_decode() => ErrorCode::Internal,
            ClientError::Http(_) => ErrorCode::Unavailable,
            ClientError::InvalidUrl(_) => ErrorCode::BadRequest,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Client for one connector facade
#[derive(Debug, Clone)]
pub struct RemoteConnector {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl RemoteConnector {
    /// Create a client for the facade at `base_url`
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> ClientResult<Self> {
        Self::with_timeout(base_url, api_key, DEFAULT_TIMEOUT)
    }

    /// Create a client whose requests give up after `timeout`
    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> ClientResult<Self> {
        let raw = base_url.into();
        let base_url = Url::parse(&raw).map_err(|e| ClientError::InvalidUrl(format!("{}: {}", raw, e)))?;
        if !matches!(base_url.scheme(), "http" | "https") || base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(raw));
        }

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    /// Endpoint URL with every segment percent-encoded
    fn url(&self, segments: &[&str]) -> ClientResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> ClientResult<RequestBuilder> {
        Ok(self
            .client
            .request(method, self.url(segments)?)
            .header(AUTHORIZATION, bearer_value(&self.api_key)))
    }

    fn get(&self, segments: &[&str]) -> ClientResult<RequestBuilder> {
        self.request(Method::GET, segments)
    }

    fn post(&self, segments: &[&str]) -> ClientResult<RequestBuilder> {
        self.request(Method::POST, segments)
    }

    pub async fn health(&self) -> ClientResult<HealthReport> {
        decode(self.get(&["health"])?.send().await?).await
    }

    pub async fn initialize(&self) -> ClientResult<()> {
        expect_empty(self.post(&["initialize"])?.send().await?).await
    }

    /// Ask the connector to stop its backend and its server
    pub async fn shutdown(&self) -> ClientResult<()> {
        expect_empty(self.post(&["shutdown"])?.send().await?).await
    }

    pub async fn list_nodes(&self, filter: &NodeFilter) -> ClientResult<NodeListing> {
        let response = self.get(&["nodes"])?.query(&filter.tags).send().await?;
        decode(response).await
    }

    pub async fn deploy(&self, node_id: &NodeId, payload: Value) -> ClientResult<Deployment> {
        self.deploy_with_context(node_id, payload, OperationContext::new())
            .await
    }

    pub async fn deploy_with_context(
        &self,
        node_id: &NodeId,
        payload: Value,
        context: OperationContext,
    ) -> ClientResult<Deployment> {
        let request = DeployRequest {
            node_id: node_id.clone(),
            payload,
            context,
        };
        decode(self.post(&["deployments"])?.json(&request).send().await?).await
    }

    pub async fn deployment(&self, id: &DeploymentId) -> ClientResult<Deployment> {
        decode(self.get(&["deployments", id.as_str()])?.send().await?).await
    }

    pub async fn execute(
        &self,
        deployment_id: &DeploymentId,
        execution_id: Option<ExecutionId>,
        experiment_id: Option<String>,
    ) -> ClientResult<Execution> {
        self.execute_with_context(deployment_id, execution_id, experiment_id, OperationContext::new())
            .await
    }

    pub async fn execute_with_context(
        &self,
        deployment_id: &DeploymentId,
        execution_id: Option<ExecutionId>,
        experiment_id: Option<String>,
        context: OperationContext,
    ) -> ClientResult<Execution> {
        let request = ExecuteRequest {
            deployment_id: deployment_id.clone(),
            execution_id,
            experiment_id,
            context,
        };
        decode(self.post(&["executions"])?.json(&request).send().await?).await
    }

    pub async fn status(&self, id: &ExecutionId) -> ClientResult<Execution> {
        decode(self.get(&["executions", id.as_str()])?.send().await?).await
    }

    pub async fn cancel(&self, id: &ExecutionId) -> ClientResult<Execution> {
        self.cancel_with_context(id, OperationContext::new()).await
    }

    pub async fn cancel_with_context(
        &self,
        id: &ExecutionId,
        context: OperationContext,
    ) -> ClientResult<Execution> {
        let request = CancelRequest { context };
        let response = self
            .post(&["executions", id.as_str(), "cancel"])?
            .json(&request)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn result(&self, id: &ExecutionId) -> ClientResult<ExecutionResult> {
        decode(self.get(&["executions", id.as_str(), "result"])?.send().await?).await
    }

    pub async fn release_node(&self, id: &NodeId) -> ClientResult<Node> {
        decode(self.post(&["nodes", id.as_str(), "release"])?.send().await?).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    Ok(response.json().await?)
}

async fn expect_empty(response: Response) -> ClientResult<()> {
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    Ok(())
}

async fn error_from_response(response: Response) -> ClientError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();

    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => ClientError::Api {
            status,
            code: body.code,
            message: body.message,
            request_id: body.request_id,
        },
        Err(_) => {
            tracing::debug!("Non-envelope error body with status {}: {}", status, text);
            ClientError::Api {
                status,
                code: ErrorCode::from_http_status(status),
                message: if text.is_empty() {
                    format!("HTTP {}", status)
                } else {
                    text
                },
                request_id: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_url_without_scheme() {
        let err = RemoteConnector::new("127.0.0.1:26512", "key").unwrap_err();
        assert!(matches!(err, ClientError::InvalidUrl(_)));
        assert_eq!(err.code(), ErrorCode::BadRequest);
    }

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let client = RemoteConnector::new("http://localhost:1/", "key").unwrap();
        assert_eq!(client.base_url(), "http://localhost:1");
        assert_eq!(
            client.url(&["health"]).unwrap().as_str(),
            "http://localhost:1/health"
        );

        let client = RemoteConnector::new("http://localhost:1/connector/", "key").unwrap();
        assert_eq!(
            client.url(&["nodes", "n1", "release"]).unwrap().as_str(),
            "http://localhost:1/connector/nodes/n1/release"
        );
    }

    #[test]
    fn test_ids_are_one_encoded_segment() {
        let client = RemoteConnector::new("http://localhost:1", "key").unwrap();
        let url = client
            .url(&["executions", "exp-1/task?2#3 %", "result"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:1/executions/exp-1%2Ftask%3F2%233%20%25/result"
        );
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());
    }

    #[test]
    fn test_api_error_keeps_category() {
        let err = ClientError::Api {
            status: 503,
            code: ErrorCode::Unavailable,
            message: "backend down".to_string(),
            request_id: None,
        };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "unavailable (503): backend down");

        let err = ClientError::Api {
            status: 409,
            code: ErrorCode::Conflict,
            message: "busy".to_string(),
            request_id: None,
        };
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_facade_is_retryable() {
        // Port 9 (discard) on loopback is not expected to accept connections
        let client =
            RemoteConnector::with_timeout("http://127.0.0.1:9", "key", Duration::from_secs(2))
                .unwrap();
        let err = client.health().await.unwrap_err();
        assert!(matches!(err, ClientError::Http(_)));
        assert_eq!(err.code(), ErrorCode::Unavailable);
    }
}
