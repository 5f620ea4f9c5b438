//! Backend service: query text in, product items out.
//!
//! Each request makes one call to the vector service and then one call to the
//! search service. Nothing is cached or retried.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::{cors, error, ApiError, HealthBody};

/// Timeout applied to each downstream call.
pub const DOWNSTREAM_TIMEOUT: Duration = Duration::from_secs(10);
/// Matches requested when the client does not say.
pub const DEFAULT_TOP_K: usize = 5;

const UNKNOWN_NAME: &str = "Unknown Name";
const UNKNOWN_URL: &str = "Unknown URL";
const NO_CAPTION: &str = "No caption available";
const NOT_AVAILABLE: &str = "N/A";

/// Downstream failure, mapped to a distinct status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// A downstream service could not be reached or timed out.
    Request(String),
    /// A downstream answer was not JSON, or the vector service answered
    /// without a usable vector.
    Value(String),
    /// A downstream JSON payload did not have the expected shape.
    Key(String),
    /// A downstream service answered with a non-success status.
    Unexpected(String),
}

impl BackendError {
    /// HTTP status for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            BackendError::Request(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BackendError::Value(_) => StatusCode::NOT_IMPLEMENTED,
            BackendError::Key(_) => StatusCode::BAD_GATEWAY,
            BackendError::Unexpected(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_status() {
            BackendError::Unexpected(err.to_string())
        } else {
            BackendError::Request(err.to_string())
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Request(msg) => write!(f, "Request error: {msg}"),
            BackendError::Value(msg) => write!(f, "Value error: {msg}"),
            BackendError::Key(msg) => write!(f, "Key error: {msg}"),
            BackendError::Unexpected(msg) => write!(f, "Unexpected error: {msg}"),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        error(err.status(), err.to_string())
    }
}

/// `POST /search` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Free-text query.
    #[serde(rename = "queryText")]
    pub query_text: String,
    /// Matches to return.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

/// `POST /search` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResponse {
    /// `Search results for '<query>'`.
    pub description: String,
    /// Matched products, in search-service order.
    pub items: Vec<Item>,
}

/// One product card.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    /// Product name.
    pub item_name: String,
    /// Brand.
    pub item_brand: String,
    /// Gender category.
    pub item_gender: String,
    /// Product type.
    pub item_type: String,
    /// Product sub type.
    pub item_sub_type: String,
    /// Product page.
    pub item_url: String,
    /// Product image.
    pub image_url: String,
    /// Generated caption.
    pub item_caption: String,
    /// Rank from the search service, or `"N/A"`.
    pub rank: Value,
    /// Score from the search service, or `"N/A"`.
    pub score: Value,
}

/// Shared handler state.
#[derive(Clone)]
pub struct BackendState {
    client: Client,
    vector_url: String,
    search_url: String,
}

impl BackendState {
    /// State calling `vector_base/get_vector` and `search_base/search`.
    pub fn new(vector_base: &str, search_base: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build downstream HTTP client")?;
        Ok(Self {
            client,
            vector_url: format!("{}/get_vector", vector_base.trim_end_matches('/')),
            search_url: format!("{}/search", search_base.trim_end_matches('/')),
        })
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, BackendError> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(BackendError::from_reqwest)?
            .error_for_status()
            .map_err(BackendError::from_reqwest)?;
        let text = resp.text().await.map_err(BackendError::from_reqwest)?;
        serde_json::from_str(&text)
            .map_err(|err| BackendError::Value(format!("invalid JSON from {url}: {err}")))
    }

    /// Embeds `query_text` and returns the reshaped search results.
    pub async fn search(&self, query_text: &str, top_k: usize) -> Result<SearchResponse, BackendError> {
        let payload = self
            .post_json(&self.vector_url, &serde_json::json!({"text": query_text}))
            .await?;
        let vector = extract_vector(&payload)?;

        let results = self
            .post_json(
                &self.search_url,
                &serde_json::json!({"vector": vector, "top_k": top_k}),
            )
            .await?;
        let items = reshape_results(&results)?;
        Ok(SearchResponse {
            description: format!("Search results for '{query_text}'"),
            items,
        })
    }
}

/// Reads the `vector` field of a vector-service answer.
pub fn extract_vector(payload: &Value) -> Result<Vec<f32>, BackendError> {
    let raw = match payload.get("vector") {
        None | Some(Value::Null) => {
            return Err(BackendError::Value(
                "No vector returned from vector service.".to_string(),
            ))
        }
        Some(raw) => raw,
    };
    let values = raw
        .as_array()
        .ok_or_else(|| BackendError::Key("'vector' is not an array".to_string()))?;
    if values.is_empty() {
        return Err(BackendError::Value(
            "No vector returned from vector service.".to_string(),
        ));
    }
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| BackendError::Key("'vector' holds a non-number".to_string()))
        })
        .collect()
}

/// Turns search-service matches into items. Matches without metadata are
/// dropped.
pub fn reshape_results(results: &Value) -> Result<Vec<Item>, BackendError> {
    let results = results
        .as_array()
        .ok_or_else(|| BackendError::Key("search results are not a list".to_string()))?;
    Ok(results
        .iter()
        .filter_map(|result| {
            let metadata = result.get("metadata")?.as_object()?;
            let field = |key: &str, default: &str| match metadata.get(key) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => default.to_string(),
                Some(other) => other.to_string(),
            };
            let passthrough = |key: &str| match result.get(key) {
                Some(Value::Null) | None => Value::String(NOT_AVAILABLE.to_string()),
                Some(v) => v.clone(),
            };
            Some(Item {
                item_name: field("image_name", UNKNOWN_NAME),
                item_brand: field("brand", UNKNOWN_NAME),
                item_gender: field("gender", UNKNOWN_NAME),
                item_type: field("item_type", UNKNOWN_NAME),
                item_sub_type: field("item_sub_type", UNKNOWN_NAME),
                item_url: field("item_url", UNKNOWN_URL),
                image_url: field("image_url", UNKNOWN_URL),
                item_caption: field("caption", NO_CAPTION),
                rank: passthrough("rank"),
                score: passthrough("score"),
            })
        })
        .collect())
}

/// Router exposing `/search` and `/health` with permissive CORS.
pub fn router(state: BackendState) -> Router {
    Router::new()
        .route("/search", post(search))
        .route("/health", get(health))
        .layer(cors())
        .with_state(state)
}

async fn search(
    State(state): State<BackendState>,
    Json(query): Json<SearchQuery>,
) -> Result<Json<SearchResponse>, ApiError> {
    match state.search(&query.query_text, query.top_k).await {
        Ok(response) => {
            info!(query = %query.query_text, items = response.items.len(), "search served");
            Ok(Json(response))
        }
        Err(err) => {
            warn!(query = %query.query_text, error = %err, "search failed");
            Err(err.into())
        }
    }
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody::ok("Backend service is running"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_metadata_fields_get_defaults() {
        let results = serde_json::json!([
            {"rank": 1, "id": "a", "score": 0.8, "metadata": {"brand": "Acme", "caption": "Linen"}},
            {"rank": 2, "id": "b", "score": 0.5},
            {"id": "c", "metadata": {}}
        ]);
        let items = reshape_results(&results).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].item_brand, "Acme");
        assert_eq!(items[0].item_name, "Unknown Name");
        assert_eq!(items[0].item_url, "Unknown URL");
        assert_eq!(items[0].item_caption, "Linen");
        assert_eq!(items[0].rank, serde_json::json!(1));
        assert_eq!(items[1].item_caption, "No caption available");
        assert_eq!(items[1].rank, serde_json::json!("N/A"));
        assert_eq!(items[1].score, serde_json::json!("N/A"));
    }

    #[test]
    fn vector_extraction_distinguishes_missing_from_malformed() {
        assert_eq!(
            extract_vector(&serde_json::json!({"vector": [1, 2.5]})).unwrap(),
            vec![1.0, 2.5]
        );
        for payload in [
            serde_json::json!({}),
            serde_json::json!({"vector": null}),
            serde_json::json!({"vector": []}),
        ] {
            let err = extract_vector(&payload).unwrap_err();
            assert_eq!(err.status(), StatusCode::NOT_IMPLEMENTED);
        }
        let err = extract_vector(&serde_json::json!({"vector": "abc"})).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn error_messages_carry_category_prefix() {
        assert_eq!(
            BackendError::Value("No vector returned from vector service.".into()).to_string(),
            "Value error: No vector returned from vector service."
        );
        assert_eq!(
            BackendError::Request("connection refused".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            BackendError::Unexpected("500".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn query_defaults_top_k() {
        let query: SearchQuery = serde_json::from_str(r#"{"queryText": "red dress"}"#).unwrap();
        assert_eq!(query.top_k, DEFAULT_TOP_K);
    }
}
