//! Remote connector facade
//!
//! An axum HTTP service exposing the adapter's operation set to an
//! out-of-process orchestrator. Every route sits behind the API key
//! middleware; adapter error kinds map one-to-one onto status codes.

mod auth;
mod error;
mod routes;

pub use error::ApiError;
pub use routes::build_router;

use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::adapter::Connector;

/// Request id assigned by the logging middleware
#[derive(Debug, Clone)]
pub(crate) struct RequestId(pub String);

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub(crate) connector: Arc<Connector>,
    pub(crate) api_key: Arc<str>,
    /// Cancelled by `POST /shutdown`
    pub(crate) shutdown: CancellationToken,
}

impl AppState {
    pub fn new(connector: Arc<Connector>, api_key: impl Into<String>) -> Self {
        Self {
            connector,
            api_key: Arc::from(api_key.into()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }
}

/// HTTP server wrapping a connector
pub struct ConnectorServer {
    state: AppState,
}

impl ConnectorServer {
    pub fn new(connector: Arc<Connector>, api_key: impl Into<String>) -> Self {
        Self {
            state: AppState::new(connector, api_key),
        }
    }

    /// Stop serving when `token` is cancelled
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.state = self.state.with_shutdown_token(token);
        self
    }

    /// Token cancelled when the server should stop
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> io::Result<()> {
        let address = self.state.connector.config().bind_address.clone();
        let listener = TcpListener::bind(&address).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        let address = listener.local_addr()?;
        let token = self.state.shutdown.clone();
        let router = build_router(self.state);

        tracing::info!("Connector facade listening on {}", address);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;
        tracing::info!("Connector facade on {} stopped", address);
        Ok(())
    }
}
