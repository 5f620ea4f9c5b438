use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use stylesearch::embedder::clip::{ClipEndpoint, DEFAULT_CLIP_DIM};
use stylesearch::indexer::{index_topic, read_jobs, TopicData, DEFAULT_WORKERS};
use stylesearch::vector_store::{Pinecone, DEFAULT_CONTROL_BASE, DEFAULT_UPSERT_BATCH};
use stylesearch::SecretSource;
use tokio::runtime::Builder;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "stylesearch-indexer",
    about = "Embed captioned product images and upsert them into Pinecone"
)]
struct IndexCli {
    /// CSV of `bucket,name` rows naming the topics to index
    #[arg(long, env = "INDEX_BUCKETS_FILE", default_value = "data_buckets.csv")]
    buckets: PathBuf,

    /// Data root holding captioned_data/, metadata/ and scrapped_data/
    #[arg(long, env = "BASE_BUCKET", default_value = "data")]
    data_root: PathBuf,

    /// Secret reference for the Pinecone API key
    #[arg(long, env = "PINECONE_SECRET_NAME")]
    pinecone_secret: SecretSource,

    /// Index receiving the vectors; created when missing
    #[arg(long, env = "PINECONE_INDEX_NAME", default_value = "stylesearch")]
    index_name: String,

    /// Pinecone control-plane base URL
    #[arg(long, env = "PINECONE_CONTROL_BASE", default_value = DEFAULT_CONTROL_BASE)]
    control_base: String,

    /// Embedding width of the index
    #[arg(long, env = "VECTOR_DIM_MODEL", default_value_t = DEFAULT_CLIP_DIM)]
    dimension: usize,

    /// CLIP inference endpoint
    #[arg(long, env = "CLIP_ENDPOINT")]
    clip_endpoint: String,

    /// Bearer token for the CLIP endpoint
    #[arg(long, env = "HF_TOKEN")]
    hf_token: Option<String>,

    /// Model name forwarded to the CLIP endpoint
    #[arg(long, env = "MODEL_NAME")]
    model_name: Option<String>,

    /// Embedding worker threads
    #[arg(long, env = "INDEX_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Records per upsert request
    #[arg(long, env = "INDEX_BATCH_SIZE", default_value_t = DEFAULT_UPSERT_BATCH)]
    batch_size: usize,

    /// Max seconds to wait for each HTTP call
    #[arg(long, env = "INDEX_TIMEOUT_SECS", default_value_t = 60)]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    stylesearch::logging::init();
    let cli = IndexCli::parse();
    let timeout = Duration::from_secs(cli.timeout_secs.max(1));

    let jobs = read_jobs(&cli.buckets)?;
    anyhow::ensure!(!jobs.is_empty(), "{} lists no topics", cli.buckets.display());

    let encoder = ClipEndpoint::new(
        &cli.clip_endpoint,
        cli.hf_token.as_deref(),
        cli.model_name.clone(),
        Some(cli.dimension),
        timeout,
    )?;

    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    let index = runtime.block_on(async {
        let api_key = cli
            .pinecone_secret
            .resolve()
            .await
            .context("failed to read Pinecone API key")?;
        let pinecone = Pinecone::new(&api_key, &cli.control_base, timeout)?;
        pinecone.ensure_index(&cli.index_name, cli.dimension).await
    })?;

    let mut upserted = 0usize;
    for job in &jobs {
        info!(topic = %job.topic, data = %job.data_name, "indexing topic");
        let data = match TopicData::load(&cli.data_root, job) {
            Ok(data) => data,
            Err(err) => {
                warn!(topic = %job.topic, error = %format!("{err:#}"), "topic skipped");
                continue;
            }
        };
        let summary = index_topic(
            &encoder,
            job,
            &data,
            cli.workers,
            cli.batch_size,
            |batch| runtime.block_on(index.upsert(batch)),
        )
        .with_context(|| format!("failed to index topic {}", job.topic))?;
        info!(
            topic = %job.topic,
            upserted = summary.upserted,
            missing_metadata = summary.missing_metadata,
            failed_images = summary.failed_images,
            "topic indexed"
        );
        upserted += summary.upserted;
    }
    info!(upserted, index = %cli.index_name, "indexing finished");
    Ok(())
}
