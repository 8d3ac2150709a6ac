// SPDX-License-Identifier: Apache-2.0

//! HTTP server for exposing admin endpoints.
//!
//! Serves the periodically scraped status document (`GET /status`) and a
//! liveness probe (`GET /health`). The server runs on a current-thread
//! runtime hosted by a dedicated OS thread and shuts down gracefully when
//! its cancellation token fires.

pub mod error;

pub use error::Error;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use finchdb_config::AdminConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;

/// Produces the status document served at `/status`.
pub trait StatusSource: Send + Sync {
    /// Builds the current status document.
    fn status(&self) -> serde_json::Value;
}

/// Shared state for the HTTP admin server.
#[derive(Clone)]
struct AppState {
    status_source: Arc<dyn StatusSource>,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.status_source.status())
}

/// Run the admin HTTP server until shutdown is requested.
pub async fn run(
    config: AdminConfig,
    status_source: Arc<dyn StatusSource>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let app_state = AppState { status_source };

    let app = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(ServiceBuilder::new())
        .with_state(app_state);

    let addr = config
        .bind_address
        .parse::<SocketAddr>()
        .map_err(|e| Error::InvalidBindAddress {
            bind_address: config.bind_address.clone(),
            details: format!("{e}"),
        })?;

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::BindFailed {
            addr: addr.to_string(),
            details: format!("{e}"),
        })?;

    tracing::info!(endpoint = addr.to_string(), "admin HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await
        .map_err(|e| Error::ServerError {
            addr: addr.to_string(),
            details: format!("{e}"),
        })
}
