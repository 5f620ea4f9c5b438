//! Fetch throttle and proxy controls shared by the scraper binaries.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use url::Url;

use crate::proxy::{ApifyProxy, ProxyConfig};

/// Default cap on concurrent requests per host.
pub const DEFAULT_PER_HOST_LIMIT: usize = 30;
/// Default total timeout for one image request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

const USER_AGENT: &str = concat!("stylesearch/", env!("CARGO_PKG_VERSION"));

/// Tunable knobs that bound image fetching.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchControls {
    per_host_limit: usize,
    request_timeout: Duration,
    user_agent: String,
}

impl FetchControls {
    /// Constructs a new set of fetch controls. A zero host limit is raised to one.
    pub fn new(per_host_limit: usize, request_timeout: Duration, user_agent: String) -> Self {
        Self {
            per_host_limit: per_host_limit.max(1),
            request_timeout,
            user_agent,
        }
    }

    /// Maximum in-flight requests against a single host.
    pub fn per_host_limit(&self) -> usize {
        self.per_host_limit
    }

    /// Total time allowed for one request, body included.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// `User-Agent` header sent with every request.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

impl Default for FetchControls {
    fn default() -> Self {
        Self {
            per_host_limit: DEFAULT_PER_HOST_LIMIT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

/// Command-line options that build [`FetchControls`].
#[derive(Args, Debug, Clone)]
pub struct FetchArgs {
    /// Maximum concurrent connections per host
    #[arg(long, env = "STYLESEARCH_PER_HOST_LIMIT", default_value_t = DEFAULT_PER_HOST_LIMIT)]
    pub per_host_limit: usize,

    /// Seconds before a single image request is abandoned
    #[arg(long, env = "STYLESEARCH_FETCH_TIMEOUT_SECS", default_value_t = 600)]
    pub fetch_timeout_secs: u64,
}

impl FetchArgs {
    /// Converts the parsed options into `FetchControls`.
    pub fn build_controls(&self) -> FetchControls {
        FetchControls::new(
            self.per_host_limit,
            Duration::from_secs(self.fetch_timeout_secs.max(1)),
            USER_AGENT.to_string(),
        )
    }
}

/// Which proxy the fetcher routes image downloads through.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ProxyMode {
    /// Connect to image hosts directly.
    Direct,
    /// Route through the URL given by `--proxy-url`.
    Static,
    /// Route through the Apify proxy pool.
    Apify,
}

/// Command-line options that build a [`ProxyConfig`].
#[derive(Args, Debug, Clone)]
pub struct ProxyArgs {
    /// Proxy routing mode
    #[arg(long, env = "STYLESEARCH_PROXY_MODE", value_enum, default_value = "apify")]
    pub proxy_mode: ProxyMode,

    /// Proxy URL used in `static` mode
    #[arg(long, env = "STYLESEARCH_PROXY_URL")]
    pub proxy_url: Option<String>,

    /// Apify proxy groups, comma separated
    #[arg(long, env = "APIFY_PROXY_GROUPS", default_value = "RESIDENTIAL")]
    pub proxy_groups: String,

    /// Optional two-letter country code for Apify proxy exits
    #[arg(long, env = "APIFY_PROXY_COUNTRY")]
    pub proxy_country: Option<String>,

    /// Apify proxy password; looked up with the Apify token when absent
    #[arg(long, env = "APIFY_PROXY_PASSWORD")]
    pub proxy_password: Option<String>,
}

impl ProxyArgs {
    /// Comma-separated groups as a list, empty entries dropped.
    pub fn groups(&self) -> Vec<String> {
        split_list(&self.proxy_groups)
    }

    /// Builds the proxy configuration. `password` overrides the CLI value for Apify mode.
    pub fn build_config(&self, password: Option<String>) -> Result<ProxyConfig> {
        match self.proxy_mode {
            ProxyMode::Direct => Ok(ProxyConfig::Direct),
            ProxyMode::Static => {
                let raw = self
                    .proxy_url
                    .as_deref()
                    .context("--proxy-url is required in static proxy mode")?;
                let url = Url::parse(raw).with_context(|| format!("invalid proxy url {raw}"))?;
                Ok(ProxyConfig::Static(url))
            }
            ProxyMode::Apify => {
                let password = password
                    .or_else(|| self.proxy_password.clone())
                    .context("an Apify proxy password is required in apify proxy mode")?;
                let proxy = ApifyProxy::new(password, self.groups(), self.proxy_country.clone())?;
                Ok(ProxyConfig::Apify(proxy))
            }
        }
    }
}

/// Splits a comma-separated option into trimmed, non-empty values.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
