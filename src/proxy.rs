//! Proxy routing for image downloads.
//!
//! A fetch invocation opens exactly one [`ProxySession`]; every request of that
//! invocation reuses it. Apify pins the exit IP to the session id embedded in
//! the proxy username, so a fresh id per invocation rotates the exit while
//! keeping one identity for the whole batch.

use anyhow::{Context, Result};
use rand::distr::Alphanumeric;
use rand::Rng;
use url::Url;

/// Default Apify proxy endpoint.
pub const APIFY_PROXY_URL: &str = "http://proxy.apify.com:8000";

const SESSION_ID_LEN: usize = 12;

/// Proxy routing selected for a run.
#[derive(Debug, Clone)]
pub enum ProxyConfig {
    /// No proxy.
    Direct,
    /// A fixed proxy URL.
    Static(Url),
    /// Apify proxy with rotating sessions.
    Apify(ApifyProxy),
}

impl ProxyConfig {
    /// Opens the session used by one fetch invocation.
    pub fn open_session(&self) -> Result<Option<ProxySession>> {
        match self {
            ProxyConfig::Direct => Ok(None),
            ProxyConfig::Static(url) => Ok(Some(ProxySession {
                url: url.clone(),
                session_id: None,
            })),
            ProxyConfig::Apify(proxy) => proxy.new_session().map(Some),
        }
    }
}

/// Apify proxy credentials and targeting.
#[derive(Clone)]
pub struct ApifyProxy {
    endpoint: Url,
    password: String,
    groups: Vec<String>,
    country: Option<String>,
}

impl std::fmt::Debug for ApifyProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApifyProxy")
            .field("endpoint", &self.endpoint.as_str())
            .field("groups", &self.groups)
            .field("country", &self.country)
            .finish_non_exhaustive()
    }
}

impl ApifyProxy {
    /// Builds an Apify proxy against the default endpoint.
    pub fn new(password: String, groups: Vec<String>, country: Option<String>) -> Result<Self> {
        Self::with_endpoint(APIFY_PROXY_URL, password, groups, country)
    }

    /// Builds an Apify proxy against a custom endpoint.
    pub fn with_endpoint(
        endpoint: &str,
        password: String,
        groups: Vec<String>,
        country: Option<String>,
    ) -> Result<Self> {
        anyhow::ensure!(!password.trim().is_empty(), "missing Apify proxy password");
        let endpoint =
            Url::parse(endpoint).with_context(|| format!("invalid proxy endpoint {endpoint}"))?;
        Ok(Self {
            endpoint,
            password: password.trim().to_string(),
            groups,
            country: country.filter(|c| !c.trim().is_empty()),
        })
    }

    /// Opens a new session with a random id.
    pub fn new_session(&self) -> Result<ProxySession> {
        let session_id: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(SESSION_ID_LEN)
            .map(char::from)
            .collect();
        self.session(&session_id)
    }

    /// Opens a session with an explicit id.
    pub fn session(&self, session_id: &str) -> Result<ProxySession> {
        let mut url = self.endpoint.clone();
        url.set_username(&self.username(session_id))
            .map_err(|_| anyhow::anyhow!("proxy endpoint cannot carry credentials"))?;
        url.set_password(Some(&self.password))
            .map_err(|_| anyhow::anyhow!("proxy endpoint cannot carry credentials"))?;
        Ok(ProxySession {
            url,
            session_id: Some(session_id.to_string()),
        })
    }

    fn username(&self, session_id: &str) -> String {
        let mut parts = Vec::with_capacity(3);
        if !self.groups.is_empty() {
            parts.push(format!("groups-{}", self.groups.join("+")));
        }
        parts.push(format!("session-{session_id}"));
        if let Some(country) = &self.country {
            parts.push(format!("country-{}", country.trim().to_uppercase()));
        }
        parts.join(",")
    }
}

/// One proxy identity shared by every request of a fetch invocation.
#[derive(Clone)]
pub struct ProxySession {
    url: Url,
    session_id: Option<String>,
}

impl ProxySession {
    /// Proxy URL, credentials included.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Session id when the proxy rotates by session.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Builds the `reqwest` proxy routing all schemes through this session.
    pub fn to_reqwest(&self) -> Result<reqwest::Proxy> {
        reqwest::Proxy::all(self.url.as_str()).context("invalid proxy session url")
    }
}

impl std::fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySession")
            .field("host", &self.url.host_str())
            .field("session_id", &self.session_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apify_session_encodes_groups_and_session() {
        let proxy = ApifyProxy::new(
            "secret".into(),
            vec!["RESIDENTIAL".into()],
            Some("us".into()),
        )
        .unwrap();
        let session = proxy.session("abc123").unwrap();
        assert_eq!(
            session.url().username(),
            "groups-RESIDENTIAL,session-abc123,country-US"
        );
        assert_eq!(session.url().password(), Some("secret"));
        assert_eq!(session.url().host_str(), Some("proxy.apify.com"));
        assert_eq!(session.url().port(), Some(8000));
        assert_eq!(session.session_id(), Some("abc123"));
    }

    #[test]
    fn new_sessions_rotate_ids() {
        let proxy = ApifyProxy::new("secret".into(), vec!["RESIDENTIAL".into()], None).unwrap();
        let first = proxy.new_session().unwrap();
        let second = proxy.new_session().unwrap();
        assert_eq!(first.session_id().unwrap().len(), SESSION_ID_LEN);
        assert_ne!(first.session_id(), second.session_id());
    }

    #[test]
    fn direct_config_has_no_session() {
        assert!(ProxyConfig::Direct.open_session().unwrap().is_none());
    }

    #[test]
    fn debug_output_hides_password() {
        let proxy = ApifyProxy::new("hunter2".into(), Vec::new(), None).unwrap();
        let session = proxy.session("s1").unwrap();
        assert!(!format!("{proxy:?}").contains("hunter2"));
        assert!(!format!("{session:?}").contains("hunter2"));
    }
}
