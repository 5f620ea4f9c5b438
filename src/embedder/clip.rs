//! CLIP inference-endpoint client.
//!
//! Talks to a Hugging Face Inference Endpoint style deployment that accepts
//! `{"inputs": ..., "parameters": {"modality": "text" | "image"}}` and answers
//! with a feature vector. Images travel base64-encoded.

use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::embeddings::{l2_normalize, ImageEncoder, TextEncoder};

/// Output width of CLIP ViT-B/32.
pub const DEFAULT_CLIP_DIM: usize = 512;

/// Blocking client for a hosted CLIP model.
#[derive(Clone)]
pub struct ClipEndpoint {
    client: Client,
    endpoint: String,
    model: Option<String>,
    dimensions: Option<usize>,
    normalize: bool,
}

impl ClipEndpoint {
    /// Builds a client. `token` is sent as a bearer token when present.
    pub fn new(
        endpoint: &str,
        token: Option<&str>,
        model: Option<String>,
        dimensions: Option<usize>,
        timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(!endpoint.trim().is_empty(), "missing CLIP endpoint URL");
        let mut headers = HeaderMap::new();
        if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .context("invalid inference endpoint token")?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build CLIP HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.filter(|m| !m.trim().is_empty()),
            dimensions,
            normalize: true,
        })
    }

    /// Disables unit-length normalization of returned vectors.
    pub fn without_normalization(mut self) -> Self {
        self.normalize = false;
        self
    }

    /// Expected output width, when configured.
    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    fn embed(&self, inputs: &str, modality: Modality) -> Result<Vec<f32>> {
        let request = FeatureRequest {
            inputs,
            parameters: FeatureParameters {
                modality,
                model: self.model.as_deref(),
            },
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .context("CLIP endpoint request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            anyhow::bail!("CLIP endpoint request failed ({}): {}", status, body);
        }
        let parsed: FeatureResponse = resp
            .json()
            .context("failed to parse CLIP endpoint response")?;
        let mut vector = parsed.into_vector()?;
        if let Some(expected) = self.dimensions {
            anyhow::ensure!(
                vector.len() == expected,
                "CLIP endpoint returned {} dimensions, expected {}",
                vector.len(),
                expected
            );
        }
        if self.normalize {
            l2_normalize(&mut vector);
        }
        Ok(vector)
    }
}

impl TextEncoder for ClipEndpoint {
    fn encode_text(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(text, Modality::Text)
    }
}

impl ImageEncoder for ClipEndpoint {
    fn encode_image(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        anyhow::ensure!(!bytes.is_empty(), "empty image payload");
        self.embed(&BASE64.encode(bytes), Modality::Image)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
enum Modality {
    Text,
    Image,
}

#[derive(Serialize)]
struct FeatureRequest<'a> {
    inputs: &'a str,
    parameters: FeatureParameters<'a>,
}

#[derive(Serialize)]
struct FeatureParameters<'a> {
    modality: Modality,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

/// Shapes returned by feature-extraction deployments.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeatureResponse {
    Flat(Vec<f32>),
    Nested(Vec<Vec<f32>>),
    Object { embedding: Vec<f32> },
    Batch { embeddings: Vec<Vec<f32>> },
}

impl FeatureResponse {
    fn into_vector(self) -> Result<Vec<f32>> {
        let vector = match self {
            FeatureResponse::Flat(v) | FeatureResponse::Object { embedding: v } => v,
            FeatureResponse::Nested(rows) | FeatureResponse::Batch { embeddings: rows } => {
                anyhow::ensure!(
                    rows.len() == 1,
                    "CLIP endpoint returned {} vectors for one input",
                    rows.len()
                );
                rows.into_iter().next().unwrap_or_default()
            }
        };
        anyhow::ensure!(!vector.is_empty(), "CLIP endpoint returned an empty vector");
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    #[test]
    fn accepts_every_response_shape() {
        for body in [
            "[0.5, 0.5]",
            "[[0.5, 0.5]]",
            r#"{"embedding": [0.5, 0.5]}"#,
            r#"{"embeddings": [[0.5, 0.5]]}"#,
        ] {
            let parsed: FeatureResponse = serde_json::from_str(body).unwrap();
            assert_eq!(parsed.into_vector().unwrap(), vec![0.5, 0.5], "{body}");
        }
    }

    #[test]
    fn rejects_empty_and_multi_vector_responses() {
        let empty: FeatureResponse = serde_json::from_str("[]").unwrap();
        assert!(empty.into_vector().is_err());
        let many: FeatureResponse = serde_json::from_str("[[1.0], [2.0]]").unwrap();
        assert!(many.into_vector().is_err());
    }

    /// Echoes the modality back as a one-hot vector.
    async fn features(Json(body): Json<Value>) -> Json<Vec<f32>> {
        match body["parameters"]["modality"].as_str() {
            Some("image") => Json(vec![0.0, 3.0]),
            _ => Json(vec![4.0, 0.0]),
        }
    }

    fn spawn_endpoint() -> String {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let listener = runtime
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            runtime.block_on(async move {
                let app = Router::new().route("/", post(features));
                axum::serve(listener, app).await.unwrap();
            });
        });
        format!("http://{addr}/")
    }

    #[test]
    fn encodes_text_and_images_with_normalization() {
        let endpoint = spawn_endpoint();
        let clip =
            ClipEndpoint::new(&endpoint, Some("hf_token"), None, Some(2), Duration::from_secs(5))
                .unwrap();
        assert_eq!(clip.encode_text("red dress").unwrap(), vec![1.0, 0.0]);
        assert_eq!(clip.encode_image(b"\xff\xd8jpeg").unwrap(), vec![0.0, 1.0]);
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let endpoint = spawn_endpoint();
        let clip =
            ClipEndpoint::new(&endpoint, None, None, Some(512), Duration::from_secs(5)).unwrap();
        let err = clip.encode_text("red dress").unwrap_err();
        assert!(err.to_string().contains("expected 512"));
    }
}
