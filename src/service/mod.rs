//! HTTP serving tier: vector, search and backend services.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod backend;
pub mod search;
pub mod vector;

/// Error payload returned by every service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    /// Human-readable failure description.
    pub detail: String,
}

/// `GET /health` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthBody {
    /// Always `"ok"` when the check passed.
    pub status: String,
    /// Service-specific message.
    pub message: String,
}

impl HealthBody {
    /// Successful health payload.
    pub fn ok(message: &str) -> Self {
        Self {
            status: "ok".to_string(),
            message: message.to_string(),
        }
    }
}

/// Handler error: status plus JSON body.
pub type ApiError = (StatusCode, Json<ErrorBody>);

/// Builds an [`ApiError`].
pub fn error(status: StatusCode, detail: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            detail: detail.into(),
        }),
    )
}

/// 400 with `detail`.
pub fn bad_request(detail: impl Into<String>) -> ApiError {
    error(StatusCode::BAD_REQUEST, detail)
}

/// 500 with `detail`.
pub fn internal_error(detail: impl Into<String>) -> ApiError {
    error(StatusCode::INTERNAL_SERVER_ERROR, detail)
}

/// Permissive CORS: any origin, method and header.
pub fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Binds `addr` and serves `app` with request tracing until Ctrl-C.
pub async fn serve(app: Router, addr: SocketAddr, name: &str) -> Result<()> {
    let app = app.layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(service = name, "listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown")?;
    info!(service = name, "stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for Ctrl-C; serving until killed");
        std::future::pending::<()>().await;
    }
}

/// Parses `host:port` into a socket address, resolving `localhost`.
pub fn bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let host = if host.eq_ignore_ascii_case("localhost") {
        "127.0.0.1"
    } else {
        host
    };
    format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {host}:{port}"))
}
