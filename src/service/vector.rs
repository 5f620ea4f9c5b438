//! Vector service: text to embedding.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{internal_error, ApiError, HealthBody};
use crate::embeddings::TextEncoder;

/// Text encoded by the health probe.
pub const HEALTH_PROBE_TEXT: &str = "health check";

/// `POST /get_vector` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRequest {
    /// Text to embed.
    pub text: String,
}

/// `POST /get_vector` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorResponse {
    /// Text embedding.
    pub vector: Vec<f32>,
}

/// Shared handler state.
#[derive(Clone)]
pub struct VectorState {
    encoder: Arc<dyn TextEncoder>,
}

impl VectorState {
    /// Wraps a text encoder.
    pub fn new(encoder: Arc<dyn TextEncoder>) -> Self {
        Self { encoder }
    }

    async fn encode(&self, text: String) -> anyhow::Result<Vec<f32>> {
        let encoder = Arc::clone(&self.encoder);
        tokio::task::spawn_blocking(move || encoder.encode_text(&text))
            .await
            .map_err(|err| anyhow::anyhow!("encoder task join error: {err}"))?
    }
}

/// Router exposing `/get_vector` and `/health`.
pub fn router(state: VectorState) -> Router {
    Router::new()
        .route("/get_vector", post(get_vector))
        .route("/health", get(health))
        .with_state(state)
}

async fn get_vector(
    State(state): State<VectorState>,
    Json(request): Json<VectorRequest>,
) -> Result<Json<VectorResponse>, ApiError> {
    let vector = state
        .encode(request.text)
        .await
        .map_err(|err| internal_error(format!("Error generating vector: {err:#}")))?;
    debug!(dim = vector.len(), "text encoded");
    Ok(Json(VectorResponse { vector }))
}

async fn health(State(state): State<VectorState>) -> Result<Json<HealthBody>, ApiError> {
    state
        .encode(HEALTH_PROBE_TEXT.to_string())
        .await
        .map_err(|err| internal_error(format!("Health check failed: {err:#}")))?;
    Ok(Json(HealthBody::ok("CLIP service is running")))
}
