//! Search service: embedding to ranked index matches.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::debug;

use super::{bad_request, internal_error, ApiError, HealthBody};
use crate::secrets::SecretSource;
use crate::vector_store::{IndexHandle, IndexStats, Pinecone, QueryMatch};

/// Nearest-neighbour index queried by the service.
pub trait VectorIndex: Send + Sync + 'static {
    /// Matches for `vector`, best first.
    fn query(
        &self,
        vector: Vec<f32>,
        top_k: usize,
    ) -> impl Future<Output = Result<Vec<QueryMatch>>> + Send;

    /// Cheap liveness probe.
    fn stats(&self) -> impl Future<Output = Result<IndexStats>> + Send;
}

/// Pinecone index connected on first use.
///
/// The API key is read from its secret source when the first request arrives;
/// a failed lookup is reported to that request and retried by the next.
pub struct LazyPinecone {
    secret: SecretSource,
    index_name: String,
    index_host: Option<String>,
    control_base: String,
    timeout: Duration,
    handle: OnceCell<IndexHandle>,
}

impl LazyPinecone {
    /// Describes how to reach the index.
    pub fn new(
        secret: SecretSource,
        index_name: String,
        index_host: Option<String>,
        control_base: String,
        timeout: Duration,
    ) -> Self {
        Self {
            secret,
            index_name,
            index_host: index_host.filter(|h| !h.trim().is_empty()),
            control_base,
            timeout,
            handle: OnceCell::new(),
        }
    }

    async fn handle(&self) -> Result<&IndexHandle> {
        self.handle
            .get_or_try_init(|| async {
                let api_key = self
                    .secret
                    .resolve()
                    .await
                    .context("failed to read Pinecone API key")?;
                let pinecone = Pinecone::new(&api_key, &self.control_base, self.timeout)?;
                match &self.index_host {
                    Some(host) => pinecone.index_at(host),
                    None => pinecone.index(&self.index_name).await,
                }
            })
            .await
    }
}

impl VectorIndex for LazyPinecone {
    async fn query(&self, vector: Vec<f32>, top_k: usize) -> Result<Vec<QueryMatch>> {
        self.handle().await?.query(&vector, top_k).await
    }

    async fn stats(&self) -> Result<IndexStats> {
        self.handle().await?.describe_index_stats().await
    }
}

/// `POST /search` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Query embedding.
    pub vector: Vec<f32>,
    /// Matches to return.
    pub top_k: usize,
}

/// One ranked match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedMatch {
    /// 1-based rank in index order.
    pub rank: usize,
    /// Vector id.
    pub id: String,
    /// Similarity score.
    pub score: f32,
    /// Stored metadata; `{}` when the index has none.
    pub metadata: Value,
}

/// Numbers matches 1..n in the order the index returned them.
pub fn rank_matches(matches: Vec<QueryMatch>) -> Vec<RankedMatch> {
    matches
        .into_iter()
        .enumerate()
        .map(|(idx, m)| RankedMatch {
            rank: idx + 1,
            id: m.id,
            score: m.score,
            metadata: m
                .metadata
                .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
        })
        .collect()
}

/// Router exposing `/search` and `/health` over `index`.
pub fn router<I: VectorIndex>(index: Arc<I>) -> Router {
    Router::new()
        .route("/search", post(search::<I>))
        .route("/health", get(health::<I>))
        .with_state(index)
}

async fn search<I: VectorIndex>(
    State(index): State<Arc<I>>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<Vec<RankedMatch>>, ApiError> {
    if request.vector.is_empty() {
        return Err(bad_request("vector must not be empty"));
    }
    if request.top_k == 0 {
        return Err(bad_request("top_k must be at least 1"));
    }
    let matches = index
        .query(request.vector, request.top_k)
        .await
        .map_err(|err| internal_error(format!("Error querying Pinecone: {err:#}")))?;
    debug!(matches = matches.len(), "index queried");
    Ok(Json(rank_matches(matches)))
}

async fn health<I: VectorIndex>(State(index): State<Arc<I>>) -> Result<Json<HealthBody>, ApiError> {
    index
        .stats()
        .await
        .map_err(|err| internal_error(format!("Health check failed: {err:#}")))?;
    Ok(Json(HealthBody::ok("Pinecone service is running")))
}
