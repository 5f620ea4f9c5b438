//! Pinecone REST client: index lifecycle plus query, upsert and stats.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::records::VectorRecord;

/// Pinecone control-plane base URL.
pub const DEFAULT_CONTROL_BASE: &str = "https://api.pinecone.io";
/// REST API version pinned in every request.
pub const API_VERSION: &str = "2024-07";
/// Vectors per upsert request.
pub const DEFAULT_UPSERT_BATCH: usize = 100;

const READY_POLL: Duration = Duration::from_secs(5);
const READY_ATTEMPTS: usize = 60;

fn client_for(api_key: &str, timeout: Duration) -> Result<Client> {
    anyhow::ensure!(!api_key.trim().is_empty(), "missing Pinecone API key");
    let mut headers = HeaderMap::new();
    headers.insert(
        "Api-Key",
        HeaderValue::from_str(api_key.trim()).context("invalid Pinecone API key")?,
    );
    headers.insert("X-Pinecone-API-Version", HeaderValue::from_static(API_VERSION));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Client::builder()
        .timeout(timeout)
        .default_headers(headers)
        .build()
        .context("failed to build Pinecone HTTP client")
}

fn host_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

/// Control-plane client.
#[derive(Clone)]
pub struct Pinecone {
    client: Client,
    api_key: String,
    control_base: String,
    timeout: Duration,
}

impl Pinecone {
    /// Builds a client against `control_base`.
    pub fn new(api_key: &str, control_base: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: client_for(api_key, timeout)?,
            api_key: api_key.trim().to_string(),
            control_base: control_base.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Looks up an index; `None` when it does not exist.
    pub async fn describe_index(&self, name: &str) -> Result<Option<IndexDescription>> {
        let url = format!("{}/indexes/{}", self.control_base, name);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to describe index {name}"))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let description = resp
            .error_for_status()
            .with_context(|| format!("Pinecone refused to describe index {name}"))?
            .json::<IndexDescription>()
            .await
            .context("failed to parse index description")?;
        Ok(Some(description))
    }

    /// Creates a serverless cosine index.
    pub async fn create_index(&self, spec: &CreateIndex) -> Result<IndexDescription> {
        let url = format!("{}/indexes", self.control_base);
        let description = self
            .client
            .post(&url)
            .json(spec)
            .send()
            .await
            .with_context(|| format!("failed to create index {}", spec.name))?
            .error_for_status()
            .with_context(|| format!("Pinecone refused to create index {}", spec.name))?
            .json::<IndexDescription>()
            .await
            .context("failed to parse index description")?;
        info!(index = %spec.name, dimension = spec.dimension, "index created");
        Ok(description)
    }

    /// Returns a handle to `name`, creating the index with `dimension` when
    /// missing and waiting until it reports ready.
    pub async fn ensure_index(&self, name: &str, dimension: usize) -> Result<IndexHandle> {
        let mut description = match self.describe_index(name).await? {
            Some(existing) => {
                anyhow::ensure!(
                    existing.dimension == dimension,
                    "index {} has dimension {}, expected {}",
                    name,
                    existing.dimension,
                    dimension
                );
                existing
            }
            None => self.create_index(&CreateIndex::serverless(name, dimension)).await?,
        };
        let mut attempts = 0;
        while !description.status.ready {
            attempts += 1;
            anyhow::ensure!(attempts <= READY_ATTEMPTS, "index {name} never became ready");
            tokio::time::sleep(READY_POLL).await;
            description = self
                .describe_index(name)
                .await?
                .with_context(|| format!("index {name} disappeared while starting"))?;
        }
        self.index_at(&description.host)
    }

    /// Handle to an existing index by name.
    pub async fn index(&self, name: &str) -> Result<IndexHandle> {
        let description = self
            .describe_index(name)
            .await?
            .with_context(|| format!("index {name} does not exist"))?;
        self.index_at(&description.host)
    }

    /// Handle to the data plane at a known host.
    pub fn index_at(&self, host: &str) -> Result<IndexHandle> {
        IndexHandle::new(&self.api_key, host, self.timeout)
    }
}

/// Data-plane client for one index.
#[derive(Clone)]
pub struct IndexHandle {
    client: Client,
    base_url: String,
}

impl IndexHandle {
    /// Builds a data-plane client for `host`.
    pub fn new(api_key: &str, host: &str, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!host.trim().is_empty(), "missing Pinecone index host");
        Ok(Self {
            client: client_for(api_key, timeout)?,
            base_url: host_url(host),
        })
    }

    /// Nearest neighbours of `vector`, best first.
    pub async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<QueryMatch>> {
        let request = QueryRequest {
            vector,
            top_k,
            include_values: true,
            include_metadata: true,
        };
        let resp = self
            .client
            .post(format!("{}/query", self.base_url))
            .json(&request)
            .send()
            .await
            .context("Pinecone query failed")?
            .error_for_status()
            .context("Pinecone refused query")?
            .json::<QueryResponse>()
            .await
            .context("failed to parse Pinecone query response")?;
        Ok(resp.matches)
    }

    /// Upserts `records`; returns the count Pinecone acknowledged.
    pub async fn upsert(&self, records: &[VectorRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let resp = self
            .client
            .post(format!("{}/vectors/upsert", self.base_url))
            .json(&UpsertRequest { vectors: records })
            .send()
            .await
            .context("Pinecone upsert failed")?
            .error_for_status()
            .context("Pinecone refused upsert")?
            .json::<UpsertResponse>()
            .await
            .context("failed to parse Pinecone upsert response")?;
        Ok(resp.upserted_count)
    }

    /// Index statistics; also used as a liveness probe.
    pub async fn describe_index_stats(&self) -> Result<IndexStats> {
        self.client
            .post(format!("{}/describe_index_stats", self.base_url))
            .json(&serde_json::json!({}))
            .send()
            .await
            .context("Pinecone stats request failed")?
            .error_for_status()
            .context("Pinecone refused stats request")?
            .json::<IndexStats>()
            .await
            .context("failed to parse Pinecone stats")
    }
}

/// Index creation request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CreateIndex {
    /// Index name.
    pub name: String,
    /// Vector width.
    pub dimension: usize,
    /// Distance metric.
    pub metric: String,
    /// Deployment spec.
    pub spec: Value,
}

impl CreateIndex {
    /// Cosine index on serverless AWS `us-east-1`.
    pub fn serverless(name: &str, dimension: usize) -> Self {
        Self {
            name: name.to_string(),
            dimension,
            metric: "cosine".to_string(),
            spec: serde_json::json!({"serverless": {"cloud": "aws", "region": "us-east-1"}}),
        }
    }
}

/// Control-plane view of an index.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexDescription {
    /// Index name.
    pub name: String,
    /// Vector width.
    pub dimension: usize,
    /// Data-plane host.
    pub host: String,
    /// Readiness.
    #[serde(default)]
    pub status: IndexStatus,
}

/// Index readiness.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndexStatus {
    /// Whether the data plane accepts requests.
    #[serde(default)]
    pub ready: bool,
}

/// One nearest-neighbour match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryMatch {
    /// Vector id.
    pub id: String,
    /// Similarity score.
    pub score: f32,
    /// Stored vector, when requested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<f32>,
    /// Stored metadata.
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Index statistics.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    /// Vector width.
    #[serde(default)]
    pub dimension: usize,
    /// Vectors stored across namespaces.
    #[serde(default)]
    pub total_vector_count: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    vector: &'a [f32],
    top_k: usize,
    include_values: bool,
    include_metadata: bool,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    vectors: &'a [VectorRecord],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertResponse {
    #[serde(default)]
    upserted_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::ItemMetadata;
    use axum::http::HeaderMap as AxumHeaders;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use pretty_assertions::assert_eq;

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn serverless_spec_is_cosine_on_aws() {
        assert_eq!(
            serde_json::to_value(CreateIndex::serverless("fashion", 512)).unwrap(),
            serde_json::json!({
                "name": "fashion",
                "dimension": 512,
                "metric": "cosine",
                "spec": {"serverless": {"cloud": "aws", "region": "us-east-1"}}
            })
        );
    }

    #[test]
    fn bare_hosts_default_to_https() {
        assert_eq!(host_url("idx-1.svc.pinecone.io"), "https://idx-1.svc.pinecone.io");
        assert_eq!(host_url("http://127.0.0.1:9/"), "http://127.0.0.1:9");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn query_sends_camel_case_and_auth_headers() {
        let app = Router::new().route(
            "/query",
            post(|headers: AxumHeaders, Json(body): Json<Value>| async move {
                assert_eq!(headers["api-key"], "pc-key");
                assert_eq!(headers["x-pinecone-api-version"], API_VERSION);
                assert_eq!(body["topK"], 2);
                assert_eq!(body["includeMetadata"], true);
                Json(serde_json::json!({
                    "matches": [
                        {"id": "men_shirts image_1.jpg", "score": 0.91, "metadata": {"brand": "Acme"}},
                        {"id": "men_shirts image_2.jpg", "score": 0.42}
                    ],
                    "namespace": ""
                }))
            }),
        );
        let host = spawn(app).await;
        let index = IndexHandle::new("pc-key", &host, Duration::from_secs(5)).unwrap();
        let matches = index.query(&[0.1, 0.2], 2).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].metadata, Some(serde_json::json!({"brand": "Acme"})));
        assert_eq!(matches[1].metadata, None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn upsert_serializes_metadata() {
        let app = Router::new().route(
            "/vectors/upsert",
            post(|Json(body): Json<Value>| async move {
                let vectors = body["vectors"].as_array().unwrap();
                assert_eq!(vectors[0]["metadata"]["item_type"], "Shirts");
                Json(serde_json::json!({"upsertedCount": vectors.len()}))
            }),
        );
        let host = spawn(app).await;
        let index = IndexHandle::new("pc-key", &host, Duration::from_secs(5)).unwrap();
        let record = VectorRecord {
            id: VectorRecord::index_id("men_shirts", "image_1.jpg"),
            values: vec![0.5; 4],
            metadata: ItemMetadata {
                item_type: "Shirts".into(),
                ..ItemMetadata::default()
            },
        };
        assert_eq!(index.upsert(&[record]).await.unwrap(), 1);
        assert_eq!(index.upsert(&[]).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_index_is_created_and_resolved() {
        let app = Router::new()
            .route(
                "/indexes/:name",
                get(|| async { (StatusCode::NOT_FOUND, "not found") }),
            )
            .route(
                "/indexes",
                post(|Json(body): Json<Value>| async move {
                    assert_eq!(body["metric"], "cosine");
                    Json(serde_json::json!({
                        "name": body["name"],
                        "dimension": body["dimension"],
                        "host": "idx.svc.pinecone.io",
                        "status": {"ready": true, "state": "Ready"}
                    }))
                }),
            );
        let base = spawn(app).await;
        let pinecone = Pinecone::new("pc-key", &base, Duration::from_secs(5)).unwrap();
        assert!(pinecone.describe_index("fashion").await.unwrap().is_none());
        let handle = pinecone.ensure_index("fashion", 512).await.unwrap();
        assert_eq!(handle.base_url, "https://idx.svc.pinecone.io");
    }
}
