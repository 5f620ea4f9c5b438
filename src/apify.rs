//! Apify REST client: run the product crawling actor and download its dataset.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Default Apify API base URL.
pub const DEFAULT_APIFY_BASE: &str = "https://api.apify.com";
/// Product-listing crawler actor used for the fashion catalog.
pub const DEFAULT_ACTOR_ID: &str = "mKTnbkisJ8BAiIbsP";

const WAIT_FOR_FINISH_SECS: u64 = 60;
const UTF8_BOM: char = '\u{feff}';

/// Terminal status of an actor run.
pub const STATUS_SUCCEEDED: &str = "SUCCEEDED";
const TERMINAL_STATUSES: &[&str] = &[STATUS_SUCCEEDED, "FAILED", "ABORTED", "TIMED-OUT"];

/// Thin async client for the Apify API.
#[derive(Clone)]
pub struct ApifyClient {
    client: Client,
    base_url: String,
}

impl ApifyClient {
    /// Builds a client authenticated with `token`.
    pub fn new(token: &str, base_url: &str, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!token.trim().is_empty(), "missing Apify API token");
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                .context("invalid Apify API token")?,
        );
        // Runs block server-side for up to WAIT_FOR_FINISH_SECS per poll.
        let timeout = timeout.max(Duration::from_secs(WAIT_FOR_FINISH_SECS + 30));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Apify HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Starts `actor_id` with `input` and waits until the run reaches a
    /// terminal status.
    pub async fn run_actor(&self, actor_id: &str, input: &ActorInput) -> Result<ActorRun> {
        let url = format!(
            "{}/v2/acts/{}/runs?waitForFinish={}",
            self.base_url, actor_id, WAIT_FOR_FINISH_SECS
        );
        let resp = self
            .client
            .post(&url)
            .json(input)
            .send()
            .await
            .with_context(|| format!("failed to start actor {actor_id}"))?
            .error_for_status()
            .with_context(|| format!("Apify refused to start actor {actor_id}"))?;
        let mut run = resp
            .json::<Envelope<ActorRun>>()
            .await
            .context("failed to parse actor run")?
            .data;
        info!(run_id = %run.id, status = %run.status, "actor run started");

        while !run.is_finished() {
            let url = format!(
                "{}/v2/actor-runs/{}?waitForFinish={}",
                self.base_url, run.id, WAIT_FOR_FINISH_SECS
            );
            run = self
                .client
                .get(&url)
                .send()
                .await
                .context("failed to poll actor run")?
                .error_for_status()
                .context("Apify refused actor run poll")?
                .json::<Envelope<ActorRun>>()
                .await
                .context("failed to parse actor run")?
                .data;
            info!(run_id = %run.id, status = %run.status, "actor run polled");
        }
        anyhow::ensure!(
            run.status == STATUS_SUCCEEDED,
            "actor run {} finished with status {}",
            run.id,
            run.status
        );
        Ok(run)
    }

    /// Downloads a dataset as CSV text with any byte-order mark removed.
    pub async fn dataset_csv(&self, dataset_id: &str) -> Result<String> {
        let url = format!(
            "{}/v2/datasets/{}/items?format=csv",
            self.base_url, dataset_id
        );
        let bytes = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to download dataset {dataset_id}"))?
            .error_for_status()
            .with_context(|| format!("Apify refused dataset {dataset_id}"))?
            .bytes()
            .await
            .context("failed to read dataset body")?;
        let text = String::from_utf8(bytes.to_vec()).context("dataset CSV is not UTF-8")?;
        Ok(text.trim_start_matches(UTF8_BOM).to_string())
    }

    /// Fetches the account's proxy password.
    pub async fn proxy_password(&self) -> Result<String> {
        let url = format!("{}/v2/users/me", self.base_url);
        let user = self
            .client
            .get(&url)
            .send()
            .await
            .context("failed to fetch Apify account")?
            .error_for_status()
            .context("Apify refused account lookup")?
            .json::<Envelope<UserInfo>>()
            .await
            .context("failed to parse Apify account")?
            .data;
        user.proxy
            .map(|p| p.password)
            .filter(|p| !p.is_empty())
            .context("Apify account has no proxy password")
    }
}

/// Input accepted by the product crawling actor.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActorInput {
    /// Listing pages to start from.
    pub start_urls: Vec<StartUrl>,
    /// Upper bound on pages the actor visits.
    pub max_requests_per_crawl: u64,
    /// Proxy settings for the actor's own crawling.
    pub proxy: ActorProxy,
    /// Actor-side concurrency.
    pub max_concurrency: u32,
}

impl ActorInput {
    /// Input for one listing page. The actor visits roughly two pages per
    /// product, so the request budget is half the item budget.
    pub fn for_listing(url: &str, max_items: u64, proxy_groups: Vec<String>) -> Self {
        Self {
            start_urls: vec![StartUrl {
                url: url.to_string(),
            }],
            max_requests_per_crawl: (max_items / 2).max(1),
            proxy: ActorProxy {
                use_apify_proxy: true,
                apify_proxy_groups: proxy_groups,
            },
            max_concurrency: 10,
        }
    }
}

/// One start URL.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StartUrl {
    /// Page URL.
    pub url: String,
}

/// Actor proxy settings.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActorProxy {
    /// Route the actor through Apify Proxy.
    pub use_apify_proxy: bool,
    /// Proxy groups, e.g. `RESIDENTIAL`.
    pub apify_proxy_groups: Vec<String>,
}

/// Actor run state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorRun {
    /// Run id.
    pub id: String,
    /// Run status (`READY`, `RUNNING`, `SUCCEEDED`, ...).
    pub status: String,
    /// Dataset the run writes results into.
    pub default_dataset_id: String,
}

impl ActorRun {
    /// Whether the run reached a terminal status.
    pub fn is_finished(&self) -> bool {
        TERMINAL_STATUSES.contains(&self.status.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(default)]
    proxy: Option<ProxyInfo>,
}

#[derive(Debug, Deserialize)]
struct ProxyInfo {
    password: String,
}
