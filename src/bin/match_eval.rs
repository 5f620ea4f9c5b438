use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use stylesearch::embedder::clip::ClipEndpoint;
use stylesearch::matcher::{evaluate, EmbeddedImage, EmbeddingScorer, DEFAULT_TOP_K};
use stylesearch::{CaptionEntry, ImageEncoder};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "stylesearch-eval",
    about = "Measure caption-to-image retrieval accuracy of a CLIP endpoint"
)]
struct EvalCli {
    /// Caption JSON (`[{"image", "caption"}]`) produced by the captioner
    #[arg(long, env = "EVAL_CAPTIONS", default_value = "data/captioned_data/final_output.json")]
    captions: PathBuf,

    /// Directory the caption image names are relative to
    #[arg(long, env = "EVAL_IMAGES_DIR", default_value = "data/images")]
    images_dir: PathBuf,

    /// Leading caption entries whose images form the candidate pool
    #[arg(long, default_value_t = 100)]
    pool_size: usize,

    /// Leading caption entries used as queries
    #[arg(long, default_value_t = 10)]
    total_test_cases: usize,

    /// Candidates scored per batch
    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    /// Matches kept per query
    #[arg(long, default_value_t = DEFAULT_TOP_K)]
    top_k: usize,

    /// JSON report path
    #[arg(long, env = "EVAL_REPORT", default_value = "test_results.json")]
    report_json: PathBuf,

    /// CLIP inference endpoint
    #[arg(long, env = "CLIP_ENDPOINT")]
    clip_endpoint: String,

    /// Bearer token for the CLIP endpoint
    #[arg(long, env = "HF_TOKEN")]
    hf_token: Option<String>,

    /// Model name forwarded to the CLIP endpoint
    #[arg(long, env = "MODEL_NAME")]
    model_name: Option<String>,

    /// Max seconds to wait for each embedding request
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    stylesearch::logging::init();
    let cli = EvalCli::parse();

    let text = std::fs::read_to_string(&cli.captions)
        .with_context(|| format!("failed to read {}", cli.captions.display()))?;
    let entries: Vec<CaptionEntry> = serde_json::from_str(&text)
        .with_context(|| format!("invalid caption JSON in {}", cli.captions.display()))?;
    anyhow::ensure!(!entries.is_empty(), "{} has no captions", cli.captions.display());

    let clip = ClipEndpoint::new(
        &cli.clip_endpoint,
        cli.hf_token.as_deref(),
        cli.model_name.clone(),
        None,
        Duration::from_secs(cli.timeout_secs.max(1)),
    )?;

    let started = Instant::now();
    let mut pool = Vec::with_capacity(cli.pool_size);
    for entry in entries.iter().take(cli.pool_size) {
        let path = cli.images_dir.join(&entry.image);
        match clip.encode_image_file(&path) {
            Ok(embedding) => pool.push(EmbeddedImage {
                name: entry.image.clone(),
                embedding,
            }),
            Err(err) => warn!(image = %entry.image, error = %format!("{err:#}"), "pool image skipped"),
        }
    }
    info!(
        pool = pool.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "candidate pool embedded"
    );

    let cases = &entries[..cli.total_test_cases.min(entries.len())];
    let scorer = EmbeddingScorer::new(&clip);
    let report = evaluate(cases, &pool, &scorer, cli.batch_size, cli.top_k)?;

    let body = serde_json::to_string_pretty(&report)?;
    std::fs::write(&cli.report_json, body)
        .with_context(|| format!("failed to write {}", cli.report_json.display()))?;
    info!(
        accuracy = report.accuracy,
        top1_accuracy = report.top1_accuracy,
        hits = report.hits,
        total = report.total,
        report = %cli.report_json.display(),
        "evaluation report written"
    );
    Ok(())
}
