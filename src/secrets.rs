//! Secret references resolved at startup or per request.
//!
//! A reference is a short string:
//!
//! * `env:NAME` reads an environment variable,
//! * `file:/path` reads a file (trailing newline trimmed),
//! * `json:/path#field` reads a top-level string field of a JSON file,
//! * `gcp:projects/<p>/secrets/<s>/versions/<v>` or the bare `projects/...`
//!   resource name reads Google Secret Manager.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

/// Google Secret Manager REST base.
pub const SECRET_MANAGER_BASE: &str = "https://secretmanager.googleapis.com/v1";
/// GCE/Cloud Run metadata-server token endpoint.
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
/// Environment variable that short-circuits the metadata server.
pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a secret value lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// Environment variable.
    Env(String),
    /// Whole file contents.
    File(PathBuf),
    /// String field of a JSON file.
    JsonField {
        /// JSON file.
        path: PathBuf,
        /// Top-level field name.
        field: String,
    },
    /// Secret Manager version resource name.
    Gcp(String),
}

/// Error for malformed secret references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretSourceError(String);

impl fmt::Display for SecretSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid secret reference '{}'", self.0)
    }
}

impl std::error::Error for SecretSourceError {}

impl FromStr for SecretSource {
    type Err = SecretSourceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let invalid = || SecretSourceError(trimmed.to_string());
        if trimmed.starts_with("projects/") {
            return Ok(SecretSource::Gcp(trimmed.to_string()));
        }
        let (scheme, rest) = trimmed.split_once(':').ok_or_else(invalid)?;
        if rest.is_empty() {
            return Err(invalid());
        }
        match scheme {
            "env" => Ok(SecretSource::Env(rest.to_string())),
            "file" => Ok(SecretSource::File(PathBuf::from(rest))),
            "json" => {
                let (path, field) = rest.rsplit_once('#').ok_or_else(invalid)?;
                if path.is_empty() || field.is_empty() {
                    return Err(invalid());
                }
                Ok(SecretSource::JsonField {
                    path: PathBuf::from(path),
                    field: field.to_string(),
                })
            }
            "gcp" if rest.starts_with("projects/") => Ok(SecretSource::Gcp(rest.to_string())),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretSource::Env(name) => write!(f, "env:{name}"),
            SecretSource::File(path) => write!(f, "file:{}", path.display()),
            SecretSource::JsonField { path, field } => {
                write!(f, "json:{}#{}", path.display(), field)
            }
            SecretSource::Gcp(name) => write!(f, "gcp:{name}"),
        }
    }
}

impl SecretSource {
    /// Reads the secret value.
    pub async fn resolve(&self) -> Result<String> {
        let value = match self {
            SecretSource::Env(name) => {
                std::env::var(name).with_context(|| format!("environment variable {name} is not set"))?
            }
            SecretSource::File(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read secret file {}", path.display()))?,
            SecretSource::JsonField { path, field } => {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("failed to read secret file {}", path.display()))?;
                let doc: serde_json::Value = serde_json::from_str(&text)
                    .with_context(|| format!("invalid JSON in {}", path.display()))?;
                doc.get(field)
                    .and_then(|v| v.as_str())
                    .with_context(|| format!("{} has no string field '{}'", path.display(), field))?
                    .to_string()
            }
            SecretSource::Gcp(name) => SecretManager::new(SECRET_MANAGER_BASE)?.access(name).await?,
        };
        let value = value.trim().to_string();
        anyhow::ensure!(!value.is_empty(), "secret {self} is empty");
        debug!(source = %self, "secret resolved");
        Ok(value)
    }
}

/// Minimal Secret Manager REST client.
pub struct SecretManager {
    client: Client,
    base_url: String,
    token_url: String,
}

impl SecretManager {
    /// Client against `base_url`, authenticating through the metadata server.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_token_url(base_url, METADATA_TOKEN_URL)
    }

    /// Client with a custom token endpoint.
    pub fn with_token_url(base_url: &str, token_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build Secret Manager HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token_url: token_url.to_string(),
        })
    }

    /// Reads the payload of a secret version.
    pub async fn access(&self, name: &str) -> Result<String> {
        let token = self.access_token().await?;
        let url = format!("{}/{}:access", self.base_url, name);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("failed to access secret {name}"))?
            .error_for_status()
            .with_context(|| format!("Secret Manager refused {name}"))?
            .json::<AccessResponse>()
            .await
            .context("failed to parse Secret Manager response")?;
        let bytes = BASE64
            .decode(resp.payload.data.as_bytes())
            .context("secret payload is not base64")?;
        String::from_utf8(bytes).context("secret payload is not UTF-8")
    }

    async fn access_token(&self) -> Result<String> {
        if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
            if !token.trim().is_empty() {
                return Ok(token.trim().to_string());
            }
        }
        let token = self
            .client
            .get(&self.token_url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .context("failed to reach the metadata server for a Google access token")?
            .error_for_status()
            .context("metadata server refused token request")?
            .json::<TokenResponse>()
            .await
            .context("failed to parse metadata token")?;
        Ok(token.access_token)
    }
}

#[derive(Debug, Deserialize)]
struct AccessResponse {
    payload: Payload,
}

#[derive(Debug, Deserialize)]
struct Payload {
    data: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path as UrlPath;
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_every_reference_form() {
        assert_eq!(
            "env:PINECONE_API_KEY".parse::<SecretSource>().unwrap(),
            SecretSource::Env("PINECONE_API_KEY".into())
        );
        assert_eq!(
            "file:/run/secrets/gemini".parse::<SecretSource>().unwrap(),
            SecretSource::File("/run/secrets/gemini".into())
        );
        assert_eq!(
            "json:/etc/keys.json#apify".parse::<SecretSource>().unwrap(),
            SecretSource::JsonField {
                path: "/etc/keys.json".into(),
                field: "apify".into()
            }
        );
        let name = "projects/1/secrets/GeminiAPI/versions/1";
        assert_eq!(
            name.parse::<SecretSource>().unwrap(),
            SecretSource::Gcp(name.into())
        );
        assert_eq!(
            format!("gcp:{name}").parse::<SecretSource>().unwrap(),
            SecretSource::Gcp(name.into())
        );
    }

    #[test]
    fn rejects_malformed_references() {
        for raw in ["", "plain-key", "env:", "json:/keys.json", "gcp:not-a-resource", "vault:x"] {
            assert!(raw.parse::<SecretSource>().is_err(), "{raw}");
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn file_and_json_sources_are_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("key.txt");
        std::fs::write(&key, "abc123\n").unwrap();
        let json = dir.path().join("keys.json");
        std::fs::write(&json, r#"{"gemini": " g-key ", "n": 1}"#).unwrap();

        assert_eq!(SecretSource::File(key).resolve().await.unwrap(), "abc123");
        let field = SecretSource::JsonField {
            path: json.clone(),
            field: "gemini".into(),
        };
        assert_eq!(field.resolve().await.unwrap(), "g-key");
        let numeric = SecretSource::JsonField {
            path: json,
            field: "n".into(),
        };
        assert!(numeric.resolve().await.is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn secret_manager_decodes_payload() {
        let app = Router::new()
            .route(
                "/token",
                get(|headers: HeaderMap| async move {
                    assert_eq!(headers["metadata-flavor"], "Google");
                    Json(serde_json::json!({"access_token": "tok", "expires_in": 3600}))
                }),
            )
            .route(
                "/v1/*name",
                get(|UrlPath(name): UrlPath<String>, headers: HeaderMap| async move {
                    assert_eq!(headers["authorization"], "Bearer tok");
                    assert!(name.ends_with(":access"));
                    Json(serde_json::json!({"payload": {"data": "cGMta2V5"}}))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let manager = SecretManager::with_token_url(
            &format!("http://{addr}/v1"),
            &format!("http://{addr}/token"),
        )
        .unwrap();
        let value = manager
            .access("projects/1/secrets/Pinecone/versions/1")
            .await
            .unwrap();
        assert_eq!(value, "pc-key");
    }
}
