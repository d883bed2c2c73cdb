//! HTTP server implementation.

use axum::{middleware, routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{rate_limit, GateState};
use crate::error::{FinGateError, Result};
use crate::ratelimit::Gate;

/// Body of the health endpoint.
#[derive(Debug, Serialize)]
struct HealthResponse {
    message: &'static str,
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        message: "Financial API v1.0",
        status: "running",
    })
}

/// Build the router with every route behind the rate limit middleware.
pub fn router(state: GateState) -> Router {
    Router::new()
        .route("/", get(health))
        .layer(middleware::from_fn_with_state(state, rate_limit))
}

/// HTTP server hosting the gate.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Middleware state
    state: GateState,
}

impl HttpServer {
    /// Create a new HTTP server around a gate.
    pub fn new(addr: SocketAddr, gate: Arc<Gate>, trust_forwarded_headers: bool) -> Self {
        Self {
            addr,
            state: GateState::new(gate, trust_forwarded_headers),
        }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            FinGateError::Io(e)
        })?;

        Self::serve_on(listener, self.state, signal).await
    }

    async fn serve_on<F>(listener: TcpListener, state: GateState, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(
            addr = %addr,
            rate_limiting = state.gate().is_enabled(),
            "Starting HTTP server with graceful shutdown"
        );

        let app = router(state).into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                FinGateError::Io(e)
            })
    }
}
