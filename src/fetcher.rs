//! Bounded-concurrency image downloader.
//!
//! Every row becomes one future; all futures are driven together with
//! `join_all` on the caller's task, so suspension only happens on network and
//! file I/O. A per-host semaphore caps in-flight requests. Failures never abort
//! the batch: each future returns its own outcome and the failures are merged
//! once the whole set has completed.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use reqwest::{Client, StatusCode};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};
use url::Url;

use crate::controls::FetchControls;
use crate::proxy::{ProxyConfig, ProxySession};
use crate::records::BadUrlRecord;
use crate::table::ImageRow;

/// URL placeholder recorded for rows without a URL.
pub const MISSING_URL: &str = "Missing";

/// File name an image with `id` is stored under.
pub fn image_file_name(id: &str) -> String {
    format!("image_{id}.jpg")
}

/// Why one row could not be downloaded.
#[derive(Debug)]
pub enum FetchFailure {
    /// The row had no URL.
    MissingUrl,
    /// The row had no id to name the file after.
    MissingId,
    /// The URL could not be parsed.
    InvalidUrl(url::ParseError),
    /// The server answered with something other than 200.
    Status(StatusCode),
    /// Connection, timeout or body error.
    Transport(reqwest::Error),
    /// The image could not be written to disk.
    Io(std::io::Error),
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::MissingUrl => write!(f, "No URL provided"),
            FetchFailure::MissingId => write!(f, "No id provided"),
            FetchFailure::InvalidUrl(err) => write!(f, "invalid url: {err}"),
            FetchFailure::Status(status) => {
                write!(f, "Failed with status code {}", status.as_u16())
            }
            FetchFailure::Transport(err) => write!(f, "{err}"),
            FetchFailure::Io(err) => write!(f, "failed to write image: {err}"),
        }
    }
}

impl std::error::Error for FetchFailure {}

impl FetchFailure {
    fn into_record(self, url: &str, id: &str) -> BadUrlRecord {
        BadUrlRecord {
            url: url.to_string(),
            id: id.to_string(),
            error: self.to_string(),
        }
    }
}

enum FetchOutcome {
    Downloaded,
    Skipped,
    Failed(BadUrlRecord),
}

/// Summary of one fetch invocation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchReport {
    /// Images written during this invocation.
    pub downloaded: usize,
    /// Rows whose image already existed on disk.
    pub skipped: usize,
    /// Rows that failed, in no particular order.
    pub failures: Vec<BadUrlRecord>,
    /// Apify session id used by this invocation, if any.
    pub session_id: Option<String>,
}

/// Downloads image tables, opening a fresh proxy session per invocation.
pub struct ImageFetcher {
    controls: FetchControls,
    proxy: ProxyConfig,
    limiter: HostLimiter,
}

impl ImageFetcher {
    /// Builds a fetcher. Sessions are opened by [`ImageFetcher::fetch_all`].
    pub fn new(controls: &FetchControls, proxy: &ProxyConfig) -> Result<Self> {
        Ok(Self {
            controls: controls.clone(),
            proxy: proxy.clone(),
            limiter: HostLimiter::new(controls.per_host_limit()),
        })
    }

    fn client_for(&self, session: Option<&ProxySession>) -> Result<Client> {
        let builder = Client::builder()
            .user_agent(self.controls.user_agent())
            .timeout(self.controls.request_timeout())
            .pool_max_idle_per_host(self.controls.per_host_limit());
        let builder = match session {
            Some(session) => builder.proxy(session.to_reqwest()?),
            None => builder.no_proxy(),
        };
        builder.build().context("failed to build image HTTP client")
    }

    /// Downloads every row into `output_dir` as `image_<id>.jpg`.
    ///
    /// Each call opens one proxy session shared by all of its requests. Only
    /// failing to create `output_dir` or open the session is an error; per-row
    /// problems are reported in [`FetchReport::failures`].
    pub async fn fetch_all(&self, rows: &[ImageRow], output_dir: &Path) -> Result<FetchReport> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("failed to create {}", output_dir.display()))?;
        let session = self.proxy.open_session()?;
        let client = self.client_for(session.as_ref())?;
        if let Some(session) = &session {
            info!(session = ?session.session_id(), "opened proxy session");
        }

        let mut report = FetchReport {
            session_id: session
                .as_ref()
                .and_then(|s| s.session_id().map(str::to_string)),
            ..FetchReport::default()
        };
        let mut pending = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            let id = row.id.as_deref().unwrap_or_default();
            match (row.url.as_deref(), row.id.as_deref()) {
                (None, _) => {
                    warn!(row = idx + 1, id, "url missing");
                    report
                        .failures
                        .push(FetchFailure::MissingUrl.into_record(MISSING_URL, id));
                }
                (Some(url), None) => {
                    warn!(row = idx + 1, url, "id missing");
                    report
                        .failures
                        .push(FetchFailure::MissingId.into_record(url, id));
                }
                (Some(url), Some(id)) => {
                    let dest = output_dir.join(image_file_name(id));
                    pending.push(self.fetch_one(&client, url, id, dest));
                }
            }
        }

        for outcome in join_all(pending).await {
            match outcome {
                FetchOutcome::Downloaded => report.downloaded += 1,
                FetchOutcome::Skipped => report.skipped += 1,
                FetchOutcome::Failed(record) => report.failures.push(record),
            }
        }
        info!(
            downloaded = report.downloaded,
            skipped = report.skipped,
            failed = report.failures.len(),
            "image batch finished"
        );
        Ok(report)
    }

    async fn fetch_one(&self, client: &Client, url: &str, id: &str, dest: PathBuf) -> FetchOutcome {
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            debug!(path = %dest.display(), "already downloaded, skipping");
            return FetchOutcome::Skipped;
        }
        match self.download(client, url, &dest).await {
            Ok(()) => {
                info!(path = %dest.display(), "image downloaded");
                FetchOutcome::Downloaded
            }
            Err(failure) => {
                warn!(url, id, error = %failure, "image download failed");
                FetchOutcome::Failed(failure.into_record(url, id))
            }
        }
    }

    async fn download(&self, client: &Client, url: &str, dest: &Path) -> Result<(), FetchFailure> {
        let parsed = Url::parse(url).map_err(FetchFailure::InvalidUrl)?;
        let host = parsed.host_str().unwrap_or_default().to_string();
        let _permit = self.limiter.acquire(&host).await;

        let response = client
            .get(parsed)
            .send()
            .await
            .map_err(FetchFailure::Transport)?;
        if response.status() != StatusCode::OK {
            return Err(FetchFailure::Status(response.status()));
        }
        let body = response.bytes().await.map_err(FetchFailure::Transport)?;

        // A partial file must never look complete to a re-run.
        let partial = dest.with_extension("jpg.part");
        tokio::fs::write(&partial, &body)
            .await
            .map_err(FetchFailure::Io)?;
        tokio::fs::rename(&partial, dest)
            .await
            .map_err(FetchFailure::Io)?;
        Ok(())
    }
}

/// Lazily created semaphore per host.
struct HostLimiter {
    limit: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HostLimiter {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, host: &str) -> Option<tokio::sync::OwnedSemaphorePermit> {
        let semaphore = {
            let mut hosts = self.hosts.lock().await;
            Arc::clone(
                hosts
                    .entry(host.to_string())
                    .or_insert_with(|| Arc::new(Semaphore::new(self.limit))),
            )
        };
        semaphore.acquire_owned().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ApifyProxy;
    use axum::extract::{Path as AxumPath, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Hits {
        total: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    async fn serve_image(
        State(hits): State<Hits>,
        AxumPath(name): AxumPath<String>,
    ) -> (AxumStatus, Vec<u8>) {
        hits.total.fetch_add(1, Ordering::SeqCst);
        let now = hits.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        hits.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        hits.in_flight.fetch_sub(1, Ordering::SeqCst);
        if name.starts_with("missing") {
            return (AxumStatus::NOT_FOUND, Vec::new());
        }
        (AxumStatus::OK, format!("jpeg:{name}").into_bytes())
    }

    async fn spawn_image_server(hits: Hits) -> SocketAddr {
        let app = Router::new()
            .route("/img/:name", get(serve_image))
            .with_state(hits);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn fetcher(limit: usize) -> ImageFetcher {
        let controls = FetchControls::new(limit, Duration::from_secs(5), "test".into());
        ImageFetcher::new(&controls, &ProxyConfig::Direct).unwrap()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_urls_record_one_failure_and_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![
            ImageRow {
                id: Some("1".into()),
                url: None,
            },
            ImageRow {
                id: Some("2".into()),
                url: None,
            },
        ];
        let report = fetcher(4).fetch_all(&rows, dir.path()).await.unwrap();
        assert_eq!(report.failures.len(), 2);
        for (failure, id) in report.failures.iter().zip(["1", "2"]) {
            assert_eq!(failure.url, MISSING_URL);
            assert_eq!(failure.id, id);
            assert_eq!(failure.error, "No URL provided");
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rerun_skips_existing_files_without_requests() {
        let hits = Hits::default();
        let addr = spawn_image_server(hits.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<ImageRow> = (1..=3)
            .map(|i| ImageRow::new(i.to_string(), format!("http://{addr}/img/p{i}")))
            .collect();

        let fetcher = fetcher(4);
        let first = fetcher.fetch_all(&rows, dir.path()).await.unwrap();
        assert_eq!(first.downloaded, 3);
        assert_eq!(hits.total.load(Ordering::SeqCst), 3);
        assert_eq!(
            std::fs::read(dir.path().join("image_2.jpg")).unwrap(),
            b"jpeg:p2"
        );

        let second = fetcher.fetch_all(&rows, dir.path()).await.unwrap();
        assert_eq!(second.skipped, 3);
        assert_eq!(second.downloaded, 0);
        assert_eq!(hits.total.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn bad_rows_do_not_abort_the_batch() {
        let hits = Hits::default();
        let addr = spawn_image_server(hits.clone()).await;
        let closed = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![
            ImageRow::new("10", format!("http://{addr}/img/missing-10")),
            ImageRow::new("11", format!("http://{closed}/img/11")),
            ImageRow::new("12", format!("http://{addr}/img/ok-12")),
            ImageRow {
                id: None,
                url: Some(format!("http://{addr}/img/ok-13")),
            },
        ];

        let report = fetcher(4).fetch_all(&rows, dir.path()).await.unwrap();
        assert_eq!(report.downloaded, 1);
        assert!(dir.path().join("image_12.jpg").exists());
        assert!(!dir.path().join("image_10.jpg").exists());

        let by_id = |id: &str| {
            report
                .failures
                .iter()
                .find(|f| f.id == id)
                .unwrap_or_else(|| panic!("no failure for {id}"))
                .clone()
        };
        assert_eq!(by_id("10").error, "Failed with status code 404");
        assert!(!by_id("11").error.is_empty());
        assert_eq!(by_id("").error, "No id provided");
        assert_eq!(report.failures.len(), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn per_host_limit_caps_in_flight_requests() {
        let hits = Hits::default();
        let addr = spawn_image_server(hits.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<ImageRow> = (0..8)
            .map(|i| ImageRow::new(i.to_string(), format!("http://{addr}/img/p{i}")))
            .collect();

        let report = fetcher(2).fetch_all(&rows, dir.path()).await.unwrap();
        assert_eq!(report.downloaded, 8);
        assert!(hits.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn each_invocation_opens_its_own_session() {
        let proxy = ApifyProxy::new("secret".into(), vec!["RESIDENTIAL".into()], None).unwrap();
        let controls = FetchControls::new(4, Duration::from_secs(5), "test".into());
        let fetcher = ImageFetcher::new(&controls, &ProxyConfig::Apify(proxy)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![ImageRow {
            id: Some("1".into()),
            url: None,
        }];

        let men = fetcher.fetch_all(&rows, &dir.path().join("men")).await.unwrap();
        let women = fetcher.fetch_all(&rows, &dir.path().join("women")).await.unwrap();
        let (men_id, women_id) = (men.session_id.unwrap(), women.session_id.unwrap());
        assert_eq!(men_id.len(), 12);
        assert_ne!(men_id, women_id);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn direct_fetches_have_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let report = fetcher(1).fetch_all(&[], dir.path()).await.unwrap();
        assert_eq!(report.session_id, None);
    }

    #[test]
    fn failure_messages_are_distinct() {
        assert_eq!(FetchFailure::MissingUrl.to_string(), "No URL provided");
        assert_eq!(
            FetchFailure::Status(StatusCode::FORBIDDEN).to_string(),
            "Failed with status code 403"
        );
    }
}
