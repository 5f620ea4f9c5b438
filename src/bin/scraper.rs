use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use stylesearch::apify::{ActorInput, ApifyClient, DEFAULT_ACTOR_ID, DEFAULT_APIFY_BASE};
use stylesearch::records::BAD_URL_HEADERS;
use stylesearch::table::write_csv;
use stylesearch::{FetchArgs, ImageFetcher, MetadataTable, ProxyArgs, ProxyMode, SecretSource};
use tokio::runtime::Builder;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "stylesearch-scraper",
    about = "Download product images listed in scraped metadata tables"
)]
struct ScraperCli {
    /// Directory holding the metadata CSV files
    #[arg(long, env = "SCRAPED_METADATA", default_value = "data/metadata")]
    metadata_dir: PathBuf,

    /// Directory receiving one image folder per metadata file
    #[arg(long, env = "SCRAPED_RAW_IMAGES", default_value = "data/images")]
    images_dir: PathBuf,

    /// Men's metadata CSV, relative to the metadata directory
    #[arg(long, env = "MEN_FILE_NAME")]
    men_file_name: Option<String>,

    /// Women's metadata CSV, relative to the metadata directory
    #[arg(long, env = "WOMEN_FILE_NAME")]
    women_file_name: Option<String>,

    /// Failure report for the men's table
    #[arg(long, env = "BAD_URLS_MEN", default_value = "bad_urls_men.csv")]
    bad_urls_men: String,

    /// Failure report for the women's table
    #[arg(long, env = "BAD_URLS_WOMEN", default_value = "bad_urls_women.csv")]
    bad_urls_women: String,

    /// Column holding the product id
    #[arg(long, env = "COLUMN_ID_NAME", default_value = "source/id")]
    column_id: String,

    /// Column holding the image URL
    #[arg(long, env = "URL_IMAGE", default_value = "medias/0/url")]
    url_column: String,

    /// Listing page crawled by the Apify actor into the men's table
    #[arg(long, env = "MEN_SEED_URL")]
    men_seed_url: Option<String>,

    /// Listing page crawled by the Apify actor into the women's table
    #[arg(long, env = "WOMEN_SEED_URL")]
    women_seed_url: Option<String>,

    /// Item budget for each actor run
    #[arg(long, env = "MAX_ITEMS", default_value_t = 100)]
    max_items: u64,

    /// Apify actor that crawls listing pages
    #[arg(long, env = "APIFY_ACTOR_ID", default_value = DEFAULT_ACTOR_ID)]
    actor_id: String,

    /// Apify API base URL
    #[arg(long, env = "APIFY_API_BASE", default_value = DEFAULT_APIFY_BASE)]
    apify_base_url: String,

    /// Secret reference for the Apify API token
    #[arg(long, env = "APIFY_GCP_SECRET_ACCESS")]
    apify_token: Option<SecretSource>,

    #[command(flatten)]
    fetch: FetchArgs,

    #[command(flatten)]
    proxy: ProxyArgs,
}

/// One metadata table and where its failures go.
struct Table {
    file_name: String,
    bad_urls: String,
    seed_url: Option<String>,
}

impl ScraperCli {
    fn tables(&self) -> Vec<Table> {
        [
            (&self.men_file_name, &self.bad_urls_men, &self.men_seed_url),
            (&self.women_file_name, &self.bad_urls_women, &self.women_seed_url),
        ]
        .into_iter()
        .filter_map(|(file, bad, seed)| {
            Some(Table {
                file_name: file.clone()?,
                bad_urls: bad.clone(),
                seed_url: seed.clone(),
            })
        })
        .collect()
    }
}

fn main() -> Result<()> {
    stylesearch::logging::init();
    let cli = ScraperCli::parse();
    let tables = cli.tables();
    anyhow::ensure!(
        !tables.is_empty(),
        "set --men-file-name and/or --women-file-name"
    );

    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(run(cli, tables))
}

async fn run(cli: ScraperCli, tables: Vec<Table>) -> Result<()> {
    let apify = match &cli.apify_token {
        Some(source) => {
            let token = source
                .resolve()
                .await
                .context("failed to read Apify token")?;
            Some(ApifyClient::new(
                &token,
                &cli.apify_base_url,
                Duration::from_secs(120),
            )?)
        }
        None => None,
    };

    let password = match (&apify, cli.proxy.proxy_mode, &cli.proxy.proxy_password) {
        (Some(client), ProxyMode::Apify, None) => Some(client.proxy_password().await?),
        _ => None,
    };
    let proxy = cli.proxy.build_config(password)?;
    let fetcher = ImageFetcher::new(&cli.fetch.build_controls(), &proxy)?;

    for table in &tables {
        let metadata_path = cli.metadata_dir.join(&table.file_name);
        if let Some(seed_url) = &table.seed_url {
            let client = apify
                .as_ref()
                .context("--apify-token is required to crawl a seed URL")?;
            crawl_seed(client, &cli, seed_url, &metadata_path).await?;
        }

        let metadata = MetadataTable::from_path(&metadata_path)?;
        let rows = metadata.image_rows(&cli.column_id, &cli.url_column);
        let output_dir = cli.images_dir.join(file_stem(&table.file_name));
        info!(
            table = %table.file_name,
            rows = rows.len(),
            output = %output_dir.display(),
            "downloading images"
        );

        let report = fetcher.fetch_all(&rows, &output_dir).await?;
        let bad_urls_path = cli.metadata_dir.join(&table.bad_urls);
        write_csv(&bad_urls_path, BAD_URL_HEADERS, &report.failures)?;
        info!(
            table = %table.file_name,
            downloaded = report.downloaded,
            skipped = report.skipped,
            bad_urls = report.failures.len(),
            session = ?report.session_id,
            report = %bad_urls_path.display(),
            "images saved"
        );
    }
    Ok(())
}

async fn crawl_seed(
    client: &ApifyClient,
    cli: &ScraperCli,
    seed_url: &str,
    destination: &Path,
) -> Result<()> {
    let input = ActorInput::for_listing(seed_url, cli.max_items, cli.proxy.groups());
    let run = client.run_actor(&cli.actor_id, &input).await?;
    let csv = client.dataset_csv(&run.default_dataset_id).await?;
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::write(destination, csv)
        .await
        .with_context(|| format!("failed to write {}", destination.display()))?;
    info!(run = %run.id, path = %destination.display(), "actor dataset saved");
    Ok(())
}

fn file_stem(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string())
}
